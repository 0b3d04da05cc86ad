use candle_core::{DType, Device, Result, Tensor};
use std::collections::HashMap;

use super::{SCALES_KEY, WEIGHT_PACKED_KEY};

/// Epsilon for numerical stability during Scale calculation
const EPSILON: f32 = 1e-6;

/// Code → coefficient lookup.
///
/// Mapping:
/// - 00 -> 0.0
/// - 01 -> 1.0
/// - 10 -> -1.0
/// - 11 -> Unused/Padding
pub const CODE_LUT: [f32; 4] = [0.0, 1.0, -1.0, 0.0];

#[inline]
pub fn encode(val: f32) -> u8 {
    if val > 0.5 {
        1
    } else if val < -0.5 {
        2
    } else {
        0
    }
}

#[inline]
pub fn decode(byte: u8, lane: usize) -> f32 {
    CODE_LUT[((byte >> (lane * 2)) & 0b11) as usize]
}

/// One 1.58-bit base of a matrix: 4 codes per byte, rows padded to whole bytes.
#[derive(Debug, Clone)]
pub struct TernaryPlane {
    pub codes: Vec<u8>, // [rows, cols.div_ceil(4)]
    pub scale: f32,
    pub rows: usize,
    pub cols: usize,
}

impl TernaryPlane {
    pub fn from_codes(codes: Vec<u8>, scale: f32, rows: usize, cols: usize) -> Result<Self> {
        let expected = rows * cols.div_ceil(4);
        if codes.len() != expected {
            candle_core::bail!(
                "TernaryPlane: expected {} code bytes for [{}, {}], got {}",
                expected,
                rows,
                cols,
                codes.len()
            );
        }
        Ok(Self {
            codes,
            scale,
            rows,
            cols,
        })
    }

    /// Quantize row-major `values` to {-1, 0, 1} * scale, scale = mean(|w|).
    pub fn pack(values: &[f32], rows: usize, cols: usize) -> Result<Self> {
        if values.len() != rows * cols {
            candle_core::bail!(
                "TernaryPlane: {} values do not fill [{}, {}]",
                values.len(),
                rows,
                cols
            );
        }
        let mean_abs = if values.is_empty() {
            0.0
        } else {
            values.iter().map(|v| v.abs()).sum::<f32>() / values.len() as f32
        };
        let scale = mean_abs + EPSILON;

        let stride = cols.div_ceil(4);
        let mut codes = vec![0u8; rows * stride];
        for r in 0..rows {
            for (c, &v) in values[r * cols..(r + 1) * cols].iter().enumerate() {
                let q = (v / scale).round().clamp(-1.0, 1.0);
                codes[r * stride + c / 4] |= encode(q) << ((c % 4) * 2);
            }
        }
        Ok(Self {
            codes,
            scale,
            rows,
            cols,
        })
    }

    pub fn row_stride(&self) -> usize {
        self.cols.div_ceil(4)
    }

    pub fn row(&self, r: usize) -> &[u8] {
        let stride = self.row_stride();
        &self.codes[r * stride..(r + 1) * stride]
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f32 {
        decode(self.codes[r * self.row_stride() + c / 4], c % 4) * self.scale
    }

    /// Row-major scaled values.
    pub fn unpack(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.rows * self.cols);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.push(self.get(r, c));
            }
        }
        out
    }
}

/// Pack a `[out, in]` weight into the multi-base tensor map the ternary
/// kernel consumes: `weight_packed` `[out, in/4, num_bases]` (u8) and
/// `scales` `[num_bases]`. Each base quantizes the residual of the previous ones.
pub fn pack_ternary(weight: &Tensor, num_bases: usize) -> Result<HashMap<String, Tensor>> {
    let (out_dim, in_dim) = weight.dims2()?;
    if in_dim % 4 != 0 {
        candle_core::bail!("pack_ternary: in_features {} not divisible by 4", in_dim);
    }
    if num_bases == 0 {
        candle_core::bail!("pack_ternary: num_bases must be at least 1");
    }
    let device = weight.device().clone();
    let mut residual = weight
        .to_dtype(DType::F32)?
        .to_device(&Device::Cpu)?
        .flatten_all()?
        .to_vec1::<f32>()?;

    let mut planes = Vec::with_capacity(num_bases);
    for _ in 0..num_bases {
        let plane = TernaryPlane::pack(&residual, out_dim, in_dim)?;
        for (r, v) in residual.iter_mut().zip(plane.unpack()) {
            *r -= v;
        }
        planes.push(plane);
    }

    // Interleave bases innermost: [out, in/4, nb]
    let in_q = in_dim / 4;
    let mut packed = vec![0u8; out_dim * in_q * num_bases];
    for (b, plane) in planes.iter().enumerate() {
        for (i, &byte) in plane.codes.iter().enumerate() {
            packed[i * num_bases + b] = byte;
        }
    }
    let scales: Vec<f32> = planes.iter().map(|p| p.scale).collect();

    let mut tensors = HashMap::new();
    tensors.insert(
        WEIGHT_PACKED_KEY.to_string(),
        Tensor::from_vec(packed, (out_dim, in_q, num_bases), &device)?,
    );
    tensors.insert(
        SCALES_KEY.to_string(),
        Tensor::from_vec(scales, (num_bases,), &device)?,
    );
    Ok(tensors)
}
