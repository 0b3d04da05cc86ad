use rayon::prelude::*;

use super::packing::{TernaryPlane, CODE_LUT};

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

/// Weights consumed per AVX2 chunk (8 packed bytes).
const CHUNK: usize = 32;

/// Streaming-dequantization GEMM: `Y = X * W^T + bias`, W given as ternary planes.
///
/// X: `[m, k]` row-major f32. Every plane is `[n, k]`. Returns `[m, n]`.
/// Packed weights are never expanded to a full float matrix.
pub fn ternary_gemm(
    x: &[f32],
    m: usize,
    k: usize,
    planes: &[TernaryPlane],
    bias: Option<&[f32]>,
) -> Vec<f32> {
    let n = planes.first().map_or(0, |p| p.rows);
    let mut output = vec![0.0f32; m * n];

    // Runtime check for AVX2
    #[cfg(target_arch = "x86_64")]
    let has_avx2 = is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma");
    #[cfg(not(target_arch = "x86_64"))]
    let has_avx2 = false;

    // Parallelize over all output elements (M * N)
    output
        .par_iter_mut()
        .enumerate()
        .for_each(|(global_idx, out_val)| {
            let i = global_idx / n;
            let j = global_idx % n;
            let x_row = &x[i * k..(i + 1) * k];

            let mut acc = 0.0f32;
            for plane in planes {
                acc += row_dot(x_row, plane.row(j), has_avx2) * plane.scale;
            }
            if let Some(b) = bias {
                acc += b[j];
            }
            *out_val = acc;
        });

    output
}

/// Dot product of one activation row with one packed weight row (unscaled).
fn row_dot(x_row: &[f32], w_row: &[u8], has_avx2: bool) -> f32 {
    let mut sum = 0.0f32;
    let mut processed = 0;

    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2 {
            let num_chunks = x_row.len() / CHUNK;
            // Safety: feature presence checked by caller; the slices cover num_chunks * CHUNK.
            unsafe {
                sum += dot_avx2(x_row, w_row, num_chunks);
            }
            processed = num_chunks * CHUNK;
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = has_avx2;

    // Remainder (Scalar Loop)
    for (l, &x_val) in x_row.iter().enumerate().skip(processed) {
        let byte = w_row[l / 4];
        let code = (byte >> ((l % 4) * 2)) & 0b11;
        sum += x_val * CODE_LUT[code as usize];
    }
    sum
}

/// AVX2 Kernel: processes chunks of 32 weights, returns partial sum.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_avx2(x_row: &[f32], w_row: &[u8], num_chunks: usize) -> f32 {
    debug_assert!(x_row.len() >= num_chunks * CHUNK);
    debug_assert!(w_row.len() >= num_chunks * CHUNK / 4);

    let mut sum_vec = _mm256_setzero_ps();

    for chunk in 0..num_chunks {
        // 4 x (2 bytes -> 8 weights -> 1 YMM)
        for step in 0..4 {
            let byte_off = chunk * 8 + step * 2;
            let w_val = u16::from_le_bytes([w_row[byte_off], w_row[byte_off + 1]]);

            // coeff = (code & 1) - (code >> 1): 00->0, 01->1, 10->-1, 11->0
            let mut coeffs = [0.0f32; 8];
            for (b, coeff) in coeffs.iter_mut().enumerate() {
                let code = (w_val >> (b * 2)) & 0x03;
                *coeff = ((code & 1) as i32 - (code >> 1) as i32) as f32;
            }
            let w_vec = _mm256_loadu_ps(coeffs.as_ptr());
            let x_vec = _mm256_loadu_ps(x_row.as_ptr().add(chunk * CHUNK + step * 8));
            sum_vec = _mm256_fmadd_ps(x_vec, w_vec, sum_vec);
        }
    }

    let mut temp = [0.0f32; 8];
    _mm256_storeu_ps(temp.as_mut_ptr(), sum_vec);
    temp.iter().sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(x: &[f32], m: usize, k: usize, planes: &[TernaryPlane]) -> Vec<f32> {
        let n = planes[0].rows;
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                for p in planes {
                    for l in 0..k {
                        out[i * n + j] += x[i * k + l] * p.get(j, l);
                    }
                }
            }
        }
        out
    }

    #[test]
    fn test_matches_naive_with_remainder() -> candle_core::Result<()> {
        // k = 72: two AVX2 chunks plus an 8-wide scalar tail
        let (m, n, k) = (3, 5, 72);
        let w: Vec<f32> = (0..n * k).map(|i| ((i * 7 % 11) as f32) - 5.0).collect();
        let plane = TernaryPlane::pack(&w, n, k)?;
        let x: Vec<f32> = (0..m * k).map(|i| (i as f32 * 0.013).cos()).collect();

        let got = ternary_gemm(&x, m, k, std::slice::from_ref(&plane), None);
        let want = naive(&x, m, k, std::slice::from_ref(&plane));
        for (a, b) in got.iter().zip(want.iter()) {
            assert!((a - b).abs() < 1e-4 * (1.0 + b.abs()), "{} vs {}", a, b);
        }
        Ok(())
    }

    #[test]
    fn test_bias_is_added_per_column() -> candle_core::Result<()> {
        let plane = TernaryPlane::from_codes(vec![0u8, 0u8], 1.0, 2, 4)?;
        let out = ternary_gemm(&[1.0; 4], 1, 4, &[plane], Some(&[0.5, -2.0]));
        assert_eq!(out, vec![0.5, -2.0]);
        Ok(())
    }
}
