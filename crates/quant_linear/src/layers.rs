//! Layers Module - Quantized linear layer and its parts
//!
//! - storage: weight sources and the mutually exclusive storage modes
//! - lora: per-adapter low-rank overlays
//! - linear: QuantLinear (load / forward / unload / rank reduction)

use candle_core::{Result, Tensor};

pub mod linear;
pub mod lora;
pub mod storage;

pub use linear::{ForwardOptions, ForwardOutput, Intermediates, QuantLinear};
pub use lora::LoraAdapters;
pub use storage::{StorageMode, WeightSource};

// --- Helper Trait for Robust Operations ---
pub(crate) trait TensorExt {
    fn matmul_robust(&self, rhs: &Tensor) -> Result<Tensor>;
}

impl TensorExt for Tensor {
    /// `[..., K] @ [K, N] -> [..., N]` for any lhs rank >= 1.
    fn matmul_robust(&self, rhs: &Tensor) -> Result<Tensor> {
        let lhs = self.contiguous()?;
        let lhs_rank = lhs.rank();

        // [Hybrid Guard] Ensure rhs is on same device as lhs
        let rhs = if rhs.device().same_device(lhs.device()) {
            rhs.contiguous()?
        } else {
            rhs.to_device(lhs.device())?.contiguous()?
        };

        if lhs_rank == 1 {
            lhs.unsqueeze(0)?.matmul(&rhs)?.squeeze(0)
        } else if lhs_rank == 2 {
            lhs.matmul(&rhs)
        } else {
            let flattened = lhs.flatten(0, lhs_rank - 2)?;
            let out = flattened.matmul(&rhs)?;
            let mut new_shape = lhs.dims()[..lhs_rank - 1].to_vec();
            new_shape.push(out.dim(1)?);
            out.reshape(new_shape)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_matmul_robust_ranks() -> Result<()> {
        let w = Tensor::ones((3, 2), candle_core::DType::F32, &Device::Cpu)?;
        let x1 = Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu)?;
        assert_eq!(x1.matmul_robust(&w)?.to_vec1::<f32>()?, vec![6.0, 6.0]);

        let x3 = Tensor::ones((2, 4, 3), candle_core::DType::F32, &Device::Cpu)?;
        assert_eq!(x3.matmul_robust(&w)?.dims(), &[2, 4, 2]);

        // transposed (strided) rhs
        let wt = Tensor::ones((2, 3), candle_core::DType::F32, &Device::Cpu)?.t()?;
        assert_eq!(x1.matmul_robust(&wt)?.to_vec1::<f32>()?, vec![6.0, 6.0]);
        Ok(())
    }
}
