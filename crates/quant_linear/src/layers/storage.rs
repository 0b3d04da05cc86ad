//! WeightSource / Storage - What a layer can be loaded from and how it holds it

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use std::collections::HashMap;
use std::sync::Arc;

use crate::kernels::{QuantKernel, TensorMap, BIAS_KEY, SCALES_KEY, WEIGHT_PACKED_KEY};
use crate::scratch::ScratchSlice;

/// Largest base count probed when detecting a packed checkpoint.
const MAX_BASES: usize = 8;

/// Input to `QuantLinear::load`.
#[derive(Debug, Clone)]
pub enum WeightSource {
    /// Named component tensors for the quantized kernel (bias under `"bias"`).
    Quantized(TensorMap),
    /// Dense `[out, in]` weight, no bias.
    Dense(Tensor),
    /// Dense `[out, in]` weight and `[out]` bias.
    DenseWithBias(Tensor, Tensor),
}

impl WeightSource {
    pub fn has_bias(&self) -> bool {
        match self {
            WeightSource::Quantized(tensors) => tensors.contains_key(BIAS_KEY),
            WeightSource::Dense(_) => false,
            WeightSource::DenseWithBias(..) => true,
        }
    }

    /// Reads a layer's tensors from a checkpoint prefix.
    ///
    /// Packed format is detected via `scales` (base count probed 1..=8),
    /// otherwise `weight` is read densely. Bias is taken iff the checkpoint has one.
    pub fn from_var_builder(vb: VarBuilder, in_features: usize, out_features: usize) -> Result<Self> {
        let bias = if vb.contains_tensor(BIAS_KEY) {
            Some(vb.get((out_features,), BIAS_KEY)?)
        } else {
            None
        };

        if vb.contains_tensor(SCALES_KEY) {
            for nb in 1..=MAX_BASES {
                if let Ok(scales) = vb.get((nb,), SCALES_KEY) {
                    let packed =
                        vb.get((out_features, in_features / 4, nb), WEIGHT_PACKED_KEY)?;
                    let mut tensors = HashMap::new();
                    tensors.insert(WEIGHT_PACKED_KEY.to_string(), packed);
                    tensors.insert(SCALES_KEY.to_string(), scales);
                    if let Some(b) = bias {
                        tensors.insert(BIAS_KEY.to_string(), b);
                    }
                    return Ok(WeightSource::Quantized(tensors));
                }
            }
            candle_core::bail!("{} present but holds more than {} bases", SCALES_KEY, MAX_BASES);
        }

        let weight = vb.get((out_features, in_features), "weight")?;
        Ok(match bias {
            Some(b) => WeightSource::DenseWithBias(weight, b),
            None => WeightSource::Dense(weight),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Empty,
    Dense,
    Quantized,
}

/// Owned kernel handle; freed exactly once when dropped.
pub(crate) struct QuantHandle<K: QuantKernel> {
    kernel: Arc<K>,
    // Always `Some` until `drop`
    handle: Option<K::Handle>,
}

impl<K: QuantKernel> QuantHandle<K> {
    pub(crate) fn new(kernel: Arc<K>, handle: K::Handle) -> Self {
        Self {
            kernel,
            handle: Some(handle),
        }
    }

    pub(crate) fn get(&self) -> &K::Handle {
        match &self.handle {
            Some(h) => h,
            None => unreachable!("QuantHandle accessed after free"),
        }
    }
}

impl<K: QuantKernel> Drop for QuantHandle<K> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.kernel.free_handle(handle);
        }
    }
}

/// At most one weight representation at a time.
pub(crate) enum Storage<K: QuantKernel> {
    Empty,
    Dense {
        weight: Tensor, // [out, in]
        bias: Option<Tensor>,
    },
    // Field order is drop order: the handle may reference the backing tensors.
    Quantized {
        handle: QuantHandle<K>,
        tensors: TensorMap,
        scratch: ScratchSlice,
    },
}

impl<K: QuantKernel> Storage<K> {
    pub(crate) fn mode(&self) -> StorageMode {
        match self {
            Storage::Empty => StorageMode::Empty,
            Storage::Dense { .. } => StorageMode::Dense,
            Storage::Quantized { .. } => StorageMode::Quantized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FreeCounter {
        freed: AtomicUsize,
    }

    impl QuantKernel for FreeCounter {
        type Handle = ();

        fn build_handle(&self, _: &TensorMap, _: &ScratchSlice) -> Result<()> {
            Ok(())
        }

        fn free_handle(&self, _: ()) {
            self.freed.fetch_add(1, Ordering::SeqCst);
        }

        fn handle_shape(&self, _: &()) -> (usize, usize) {
            (0, 0)
        }

        fn fused_gemm(&self, input: &Tensor, _: &(), _: bool) -> Result<Tensor> {
            Ok(input.clone())
        }

        fn reconstruct_dense(&self, _: &()) -> Result<Tensor> {
            Tensor::zeros((1, 1), DType::F32, &Device::Cpu)
        }
    }

    #[test]
    fn test_quant_handle_frees_once_on_drop() {
        let kernel = Arc::new(FreeCounter::default());
        let storage: Storage<FreeCounter> = Storage::Quantized {
            handle: QuantHandle::new(kernel.clone(), ()),
            tensors: HashMap::new(),
            scratch: ScratchSlice::standalone(0, 0),
        };
        assert_eq!(storage.mode(), StorageMode::Quantized);
        assert_eq!(kernel.freed.load(Ordering::SeqCst), 0);
        drop(storage);
        assert_eq!(kernel.freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_source_bias_detection() -> Result<()> {
        let w = Tensor::zeros((4, 4), DType::F32, &Device::Cpu)?;
        let b = Tensor::zeros(4, DType::F32, &Device::Cpu)?;
        assert!(!WeightSource::Dense(w.clone()).has_bias());
        assert!(WeightSource::DenseWithBias(w.clone(), b.clone()).has_bias());

        let mut tensors = HashMap::new();
        tensors.insert(WEIGHT_PACKED_KEY.to_string(), w);
        assert!(!WeightSource::Quantized(tensors.clone()).has_bias());
        tensors.insert(BIAS_KEY.to_string(), b);
        assert!(WeightSource::Quantized(tensors).has_bias());
        Ok(())
    }

    #[test]
    fn test_from_var_builder_dense_and_packed() -> Result<()> {
        let device = Device::Cpu;

        let mut dense = HashMap::new();
        dense.insert("weight".to_string(), Tensor::ones((8, 4), DType::F32, &device)?);
        dense.insert("bias".to_string(), Tensor::zeros(8, DType::F32, &device)?);
        let vb = VarBuilder::from_tensors(dense, DType::F32, &device);
        assert!(matches!(
            WeightSource::from_var_builder(vb, 4, 8)?,
            WeightSource::DenseWithBias(..)
        ));

        let mut packed = HashMap::new();
        packed.insert(
            WEIGHT_PACKED_KEY.to_string(),
            Tensor::zeros((8, 1, 3), DType::F32, &device)?,
        );
        packed.insert(SCALES_KEY.to_string(), Tensor::ones(3, DType::F32, &device)?);
        let vb = VarBuilder::from_tensors(packed, DType::F32, &device);
        match WeightSource::from_var_builder(vb, 4, 8)? {
            WeightSource::Quantized(t) => {
                assert_eq!(t[WEIGHT_PACKED_KEY].dims(), &[8, 1, 3]);
                assert!(!t.contains_key(BIAS_KEY));
            }
            other => panic!("expected packed source, got {:?}", other),
        }
        Ok(())
    }
}
