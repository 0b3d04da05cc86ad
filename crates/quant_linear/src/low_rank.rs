//! Low-rank factorization used by rank reduction
//!
//! `RandomizedSvd` is a randomized range finder with power iterations:
//! `A ≈ Q (Qᵀ A)` with `Q` an orthonormal `[m, k]` basis. With `k = min(m, n)`
//! the basis spans the whole column space and the product reproduces `A`.

use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Columns whose norm falls below this (relative to the matrix scale) are dropped.
const RANK_EPS: f64 = 1e-12;

/// `matrix ≈ left @ right` with `left: [m, k]`, `right: [k, n]` (F64, CPU).
#[derive(Debug, Clone)]
pub struct LowRankFactors {
    pub left: Tensor,
    pub right: Tensor,
}

impl LowRankFactors {
    pub fn rank(&self) -> usize {
        self.left.dims().get(1).copied().unwrap_or(0)
    }

    pub fn reconstruct(&self) -> Result<Tensor> {
        self.left.matmul(&self.right)
    }
}

/// Rank-k approximation oracle.
pub trait LowRankApprox {
    fn factorize(&self, matrix: &Tensor, rank: usize) -> Result<LowRankFactors>;
}

#[derive(Debug, Clone, Copy)]
pub struct RandomizedSvd {
    /// Power iterations after the initial sketch
    pub niter: usize,
    pub seed: u64,
}

impl Default for RandomizedSvd {
    fn default() -> Self {
        Self { niter: 10, seed: 0 }
    }
}

impl LowRankApprox for RandomizedSvd {
    fn factorize(&self, matrix: &Tensor, rank: usize) -> Result<LowRankFactors> {
        let (m, n) = matrix.dims2()?;
        let k = rank.min(m).min(n);
        if k == 0 {
            candle_core::bail!("RandomizedSvd: rank must be positive");
        }
        let a = matrix
            .to_dtype(DType::F64)?
            .to_device(&Device::Cpu)?
            .flatten_all()?
            .to_vec1::<f64>()?;
        let scale = a.iter().fold(0.0f64, |acc, v| acc.max(v.abs())).max(1.0);

        let mut rng = StdRng::seed_from_u64(self.seed);
        let omega: Vec<Vec<f64>> = (0..k)
            .map(|_| (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect();

        let mut q = a_times(&a, m, n, &omega);
        orthonormalize(&mut q, scale);
        for _ in 0..self.niter {
            let mut z = at_times(&a, m, n, &q);
            orthonormalize(&mut z, scale);
            q = a_times(&a, m, n, &z);
            orthonormalize(&mut q, scale);
        }

        // Rows of Qᵀ A
        let b_rows = at_times(&a, m, n, &q);

        let mut left = vec![0.0f64; m * k];
        for (r, col) in q.iter().enumerate() {
            for (i, &v) in col.iter().enumerate() {
                left[i * k + r] = v;
            }
        }
        let right: Vec<f64> = b_rows.into_iter().flatten().collect();

        Ok(LowRankFactors {
            left: Tensor::from_vec(left, (m, k), &Device::Cpu)?,
            right: Tensor::from_vec(right, (k, n), &Device::Cpu)?,
        })
    }
}

/// `A @ c` for every column `c` (each length n). A is row-major `[m, n]`.
fn a_times(a: &[f64], m: usize, n: usize, cols: &[Vec<f64>]) -> Vec<Vec<f64>> {
    cols.par_iter()
        .map(|c| {
            (0..m)
                .map(|i| a[i * n..(i + 1) * n].iter().zip(c).map(|(x, y)| x * y).sum())
                .collect()
        })
        .collect()
}

/// `Aᵀ @ c` for every column `c` (each length m).
fn at_times(a: &[f64], m: usize, n: usize, cols: &[Vec<f64>]) -> Vec<Vec<f64>> {
    cols.par_iter()
        .map(|c| {
            let mut out = vec![0.0f64; n];
            for i in 0..m {
                let ci = c[i];
                if ci == 0.0 {
                    continue;
                }
                for (o, &x) in out.iter_mut().zip(&a[i * n..(i + 1) * n]) {
                    *o += x * ci;
                }
            }
            out
        })
        .collect()
}

/// Modified Gram-Schmidt, two passes. Degenerate columns become zero.
fn orthonormalize(cols: &mut [Vec<f64>], scale: f64) {
    for j in 0..cols.len() {
        let (done, rest) = cols.split_at_mut(j);
        let col = &mut rest[0];
        for _ in 0..2 {
            for prev in done.iter() {
                let proj: f64 = prev.iter().zip(col.iter()).map(|(p, c)| p * c).sum();
                for (c, p) in col.iter_mut().zip(prev) {
                    *c -= proj * p;
                }
            }
        }
        let norm = col.iter().map(|c| c * c).sum::<f64>().sqrt();
        if norm > RANK_EPS * scale {
            col.iter_mut().for_each(|c| *c /= norm);
        } else {
            col.iter_mut().for_each(|c| *c = 0.0);
        }
    }
}
