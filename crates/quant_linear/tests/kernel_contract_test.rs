//! Layer behavior against a stand-in kernel that records what it is asked to do.

use candle_core::{DType, Device, Tensor};
use quant_linear::{
    ForwardOptions, LinearError, ModelConfig, QuantKernel, QuantLinear, ScratchAllocator,
    ScratchPool, ScratchSlice, StorageMode, TensorMap, WeightSource,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Reports a fixed shape and fills outputs with a constant.
#[derive(Default)]
struct RecordingKernel {
    shape: (usize, usize),
    fail_build: bool,
    built: AtomicUsize,
    freed: AtomicUsize,
    fused_calls: AtomicUsize,
    last_alt: AtomicBool,
}

impl RecordingKernel {
    fn with_shape(in_features: usize, out_features: usize) -> Self {
        Self {
            shape: (in_features, out_features),
            ..Default::default()
        }
    }
}

impl QuantKernel for RecordingKernel {
    type Handle = usize;

    fn build_handle(
        &self,
        _tensors: &TensorMap,
        scratch: &ScratchSlice,
    ) -> candle_core::Result<usize> {
        if self.fail_build {
            candle_core::bail!("device rejected the matrix");
        }
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(scratch.len())
    }

    fn free_handle(&self, _handle: usize) {
        self.freed.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_shape(&self, _handle: &usize) -> (usize, usize) {
        self.shape
    }

    fn fused_gemm(
        &self,
        input: &Tensor,
        _handle: &usize,
        use_alt_kernel: bool,
    ) -> candle_core::Result<Tensor> {
        self.fused_calls.fetch_add(1, Ordering::SeqCst);
        self.last_alt.store(use_alt_kernel, Ordering::SeqCst);
        let rows = input.dim(0)?;
        Tensor::full(7.0f32, (rows, self.shape.1), input.device())
    }

    fn reconstruct_dense(&self, _handle: &usize) -> candle_core::Result<Tensor> {
        Tensor::ones(self.shape, DType::F32, &Device::Cpu)
    }
}

/// Counts passes and hands out standalone slices.
#[derive(Default)]
struct CountingAllocator {
    passes: AtomicUsize,
    requested: AtomicUsize,
    device: AtomicUsize,
}

impl ScratchAllocator for CountingAllocator {
    fn begin_allocation_pass(&self, device_idx: usize) -> quant_linear::Result<()> {
        self.passes.fetch_add(1, Ordering::SeqCst);
        self.device.store(device_idx, Ordering::SeqCst);
        Ok(())
    }

    fn get_slice(&self, device_idx: usize, size_bytes: usize) -> quant_linear::Result<ScratchSlice> {
        self.requested.store(size_bytes, Ordering::SeqCst);
        Ok(ScratchSlice::standalone(device_idx, size_bytes))
    }
}

fn layer_with(kernel: Arc<RecordingKernel>) -> QuantLinear<RecordingKernel> {
    QuantLinear::new(
        "model.layers.1.mlp.gate_proj",
        8,
        32,
        false,
        &ModelConfig::new(16, 1, 0),
        &Device::Cpu,
        kernel,
    )
}

#[test]
fn test_load_requests_dequant_scratch() -> anyhow::Result<()> {
    let kernel = Arc::new(RecordingKernel::with_shape(8, 32));
    let mut layer = layer_with(kernel.clone());
    let allocator = CountingAllocator::default();

    layer.load(WeightSource::Quantized(HashMap::new()), &allocator)?;
    assert_eq!(allocator.passes.load(Ordering::SeqCst), 1);
    assert_eq!(allocator.requested.load(Ordering::SeqCst), layer.temp_dq_size());
    assert_eq!(kernel.built.load(Ordering::SeqCst), 1);
    assert_eq!(layer.storage_mode(), StorageMode::Quantized);
    Ok(())
}

#[test]
fn test_forward_dispatch_flags_reach_kernel() -> anyhow::Result<()> {
    let kernel = Arc::new(RecordingKernel::with_shape(8, 32));
    let mut layer = layer_with(kernel.clone());
    layer.load(
        WeightSource::Quantized(HashMap::new()),
        &CountingAllocator::default(),
    )?;
    let x = Tensor::ones((3, 8), DType::F32, &Device::Cpu)?;

    let y = layer.forward(&x, &ForwardOptions::new().alt_kernel())?.into_tensor();
    assert_eq!(kernel.fused_calls.load(Ordering::SeqCst), 1);
    assert!(kernel.last_alt.load(Ordering::SeqCst));
    assert_eq!(y.to_vec2::<f32>()?, vec![vec![7.0; 32]; 3]);

    // Reconstruction bypasses the fused kernel: ones weight sums the 8 inputs
    let y = layer.forward(&x, &ForwardOptions::new().reconstruct())?.into_tensor();
    assert_eq!(kernel.fused_calls.load(Ordering::SeqCst), 1);
    assert_eq!(y.to_vec2::<f32>()?, vec![vec![8.0; 32]; 3]);
    Ok(())
}

#[test]
fn test_handle_freed_exactly_once() -> anyhow::Result<()> {
    let kernel = Arc::new(RecordingKernel::with_shape(8, 32));
    let mut layer = layer_with(kernel.clone());
    let allocator = CountingAllocator::default();

    layer.load(WeightSource::Quantized(HashMap::new()), &allocator)?;
    layer.load(WeightSource::Quantized(HashMap::new()), &allocator)?;
    assert_eq!(kernel.freed.load(Ordering::SeqCst), 1);

    layer.unload();
    layer.unload();
    assert_eq!(kernel.freed.load(Ordering::SeqCst), 2);

    layer.load(WeightSource::Quantized(HashMap::new()), &allocator)?;
    drop(layer);
    assert_eq!(kernel.built.load(Ordering::SeqCst), 3);
    assert_eq!(kernel.freed.load(Ordering::SeqCst), 3);
    Ok(())
}

#[test]
fn test_shape_mismatch_frees_handle() -> anyhow::Result<()> {
    let kernel = Arc::new(RecordingKernel::with_shape(8, 24));
    let mut layer = layer_with(kernel.clone());

    let err = layer
        .load(
            WeightSource::Quantized(HashMap::new()),
            &CountingAllocator::default(),
        )
        .unwrap_err();
    match err {
        LinearError::ShapeMismatch {
            expected, actual, ..
        } => {
            assert_eq!(expected, vec![8, 32]);
            assert_eq!(actual, vec![8, 24]);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(kernel.built.load(Ordering::SeqCst), 1);
    assert_eq!(kernel.freed.load(Ordering::SeqCst), 1);
    assert_eq!(layer.storage_mode(), StorageMode::Empty);
    Ok(())
}

#[test]
fn test_build_failure_leaves_layer_empty() -> anyhow::Result<()> {
    let kernel = Arc::new(RecordingKernel {
        shape: (8, 32),
        fail_build: true,
        ..Default::default()
    });
    let mut layer = layer_with(kernel.clone());
    let pool = ScratchPool::new();
    pool.reserve(0, layer.scratch_space())?;

    let err = layer
        .load(WeightSource::Quantized(HashMap::new()), &pool)
        .unwrap_err();
    assert!(matches!(err, LinearError::Kernel(_)));
    assert!(err.to_string().contains("device rejected the matrix"));
    assert_eq!(kernel.freed.load(Ordering::SeqCst), 0);
    assert_eq!(layer.storage_mode(), StorageMode::Empty);
    Ok(())
}

#[test]
fn test_scratch_requested_on_configured_device() -> anyhow::Result<()> {
    let kernel = Arc::new(RecordingKernel::with_shape(8, 32));
    let mut layer = QuantLinear::new(
        "model.layers.1.mlp.gate_proj",
        8,
        32,
        false,
        &ModelConfig::new(16, 1, 2),
        &Device::Cpu,
        kernel,
    );
    let allocator = CountingAllocator::default();
    layer.load(WeightSource::Quantized(HashMap::new()), &allocator)?;
    assert_eq!(allocator.device.load(Ordering::SeqCst), 2);

    // Pool arenas are keyed the same way
    let pool = ScratchPool::new();
    pool.reserve(0, layer.scratch_space())?;
    assert!(matches!(
        layer.load(WeightSource::Quantized(HashMap::new()), &pool),
        Err(LinearError::ScratchUnavailable { device: 2 })
    ));
    Ok(())
}
