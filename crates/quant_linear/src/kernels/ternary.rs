use candle_core::{DType, Device, Result, Tensor};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use super::cpu::ternary_gemm;
use super::packing::TernaryPlane;
use super::{QuantKernel, TensorMap, BIAS_KEY, SCALES_KEY, WEIGHT_PACKED_KEY};
use crate::scratch::ScratchSlice;

/// Row count at which the kernel reconstructs into scratch and runs a dense matmul.
pub const RECONSTRUCT_ROWS: usize = 32;

/// Handle for a multi-base 1.58-bit matrix.
#[derive(Debug)]
pub struct TernaryMatrix {
    planes: Vec<TernaryPlane>, // each [out, in]
    bias: Option<Vec<f32>>,
    in_features: usize,
    out_features: usize,
    device: Device,
    scratch: ScratchSlice,
}

impl TernaryMatrix {
    pub fn num_bases(&self) -> usize {
        self.planes.len()
    }

    /// Weight values in `[in, out]` order.
    fn dense_values(&self) -> Vec<f32> {
        let (k, n) = (self.in_features, self.out_features);
        let mut values = vec![0.0f32; k * n];
        for plane in &self.planes {
            for j in 0..n {
                for i in 0..k {
                    values[i * n + j] += plane.get(j, i);
                }
            }
        }
        values
    }
}

/// CPU reference backend for the packed ternary format.
///
/// Tensors may live on any device; packed codes are pulled to host memory at
/// build time and results are moved back to the activation's device.
#[derive(Debug, Default)]
pub struct TernaryKernel {
    live_handles: AtomicUsize,
}

impl TernaryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles built and not yet freed.
    pub fn live_handles(&self) -> usize {
        self.live_handles.load(Ordering::SeqCst)
    }

    fn dense_from_scratch(&self, input: &Tensor, handle: &TernaryMatrix) -> Result<Tensor> {
        let (k, n) = (handle.in_features, handle.out_features);
        let w = handle
            .scratch
            .with_f16(&handle.dense_values(), |values| {
                Tensor::from_vec(values, (k, n), &Device::Cpu)
            })?;
        let x = input
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .contiguous()?;
        let mut out = x.matmul(&w)?;
        if let Some(bias) = &handle.bias {
            out = out.broadcast_add(&Tensor::from_slice(bias, (n,), &Device::Cpu)?)?;
        }
        out.to_device(input.device())
    }
}

impl QuantKernel for TernaryKernel {
    type Handle = TernaryMatrix;

    fn build_handle(&self, tensors: &TensorMap, scratch: &ScratchSlice) -> Result<TernaryMatrix> {
        let packed = match tensors.get(WEIGHT_PACKED_KEY) {
            Some(t) => t,
            None => candle_core::bail!("missing tensor {}", WEIGHT_PACKED_KEY),
        };
        let scales = match tensors.get(SCALES_KEY) {
            Some(t) => t,
            None => candle_core::bail!("missing tensor {}", SCALES_KEY),
        };

        let (out_dim, in_q, num_bases) = packed.dims3()?;
        let in_dim = in_q * 4;
        if num_bases == 0 {
            candle_core::bail!("{} has no bases", WEIGHT_PACKED_KEY);
        }
        if scales.dims1()? != num_bases {
            candle_core::bail!(
                "scales hold {} entries but weight_packed has {} bases",
                scales.dims1()?,
                num_bases
            );
        }
        let needed = in_dim * out_dim * 2;
        if scratch.len() < needed {
            candle_core::bail!(
                "insufficient scratch: [{}, {}] needs {} bytes, slice has {}",
                in_dim,
                out_dim,
                needed,
                scratch.len()
            );
        }

        let device = packed.device().clone();
        // F32 checkpoints store the bytes as floats; the cast recovers them.
        let raw = packed
            .to_device(&Device::Cpu)?
            .to_dtype(DType::U8)?
            .flatten_all()?
            .to_vec1::<u8>()?;
        let scales = scales
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;

        let mut planes = Vec::with_capacity(num_bases);
        for (base, &scale) in scales.iter().enumerate() {
            let codes: Vec<u8> = raw.iter().skip(base).step_by(num_bases).copied().collect();
            planes.push(TernaryPlane::from_codes(codes, scale, out_dim, in_dim)?);
        }

        let bias = match tensors.get(BIAS_KEY) {
            Some(b) => {
                if b.dims1()? != out_dim {
                    candle_core::bail!("bias has {} entries, expected {}", b.dims1()?, out_dim);
                }
                Some(b.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
            }
            None => None,
        };

        self.live_handles.fetch_add(1, Ordering::SeqCst);
        debug!(in_dim, out_dim, num_bases, "built ternary handle");

        Ok(TernaryMatrix {
            planes,
            bias,
            in_features: in_dim,
            out_features: out_dim,
            device,
            scratch: scratch.clone(),
        })
    }

    fn free_handle(&self, handle: TernaryMatrix) {
        debug!(
            in_dim = handle.in_features,
            out_dim = handle.out_features,
            "freed ternary handle"
        );
        drop(handle);
        self.live_handles.fetch_sub(1, Ordering::SeqCst);
    }

    fn handle_shape(&self, handle: &TernaryMatrix) -> (usize, usize) {
        (handle.in_features, handle.out_features)
    }

    fn fused_gemm(
        &self,
        input: &Tensor,
        handle: &TernaryMatrix,
        use_alt_kernel: bool,
    ) -> Result<Tensor> {
        let (m, k) = input.dims2()?;
        if k != handle.in_features {
            candle_core::bail!(
                "Shape mismatch: Input [{}, {}] vs Weight [{}, {}]",
                m,
                k,
                handle.out_features,
                handle.in_features
            );
        }

        if m >= RECONSTRUCT_ROWS && !use_alt_kernel {
            return self.dense_from_scratch(input, handle);
        }

        let x_vec = input
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let out = ternary_gemm(&x_vec, m, k, &handle.planes, handle.bias.as_deref());
        Tensor::from_vec(out, (m, handle.out_features), &Device::Cpu)?.to_device(input.device())
    }

    fn reconstruct_dense(&self, handle: &TernaryMatrix) -> Result<Tensor> {
        Tensor::from_vec(
            handle.dense_values(),
            (handle.in_features, handle.out_features),
            &Device::Cpu,
        )?
        .to_device(&handle.device)
    }
}
