//! Quant Linear
//!
//! A linear layer whose weight is held either as a dense matrix or as a
//! quantized handle built by a pluggable kernel, with per-device scratch
//! allocation, optional LoRA overlays and low-rank reduction of dense weights.
//!
//! ```no_run
//! use std::sync::Arc;
//! use candle_core::{DType, Device, Tensor};
//! use quant_linear::{ForwardOptions, ModelConfig, QuantLinear, ScratchPool, TernaryKernel, WeightSource};
//!
//! # fn main() -> quant_linear::Result<()> {
//! let device = Device::Cpu;
//! let config = ModelConfig::default();
//! let mut layer: QuantLinear = QuantLinear::new(
//!     "model.layers.0.mlp.up_proj", 64, 100, false, &config, &device, Arc::new(TernaryKernel::new()),
//! );
//! let pool = ScratchPool::new();
//! pool.reserve(config.device_idx, layer.scratch_space())?;
//! layer.load(WeightSource::Dense(Tensor::zeros((100, 64), DType::F32, &device)?), &pool)?;
//! let y = layer.forward(&Tensor::ones((2, 64), DType::F32, &device)?, &ForwardOptions::default())?;
//! let y = layer.trim_padding(y.hidden_states())?;
//! # Ok(()) }
//! ```

pub mod config;
pub mod error;
pub mod kernels;
pub mod layers;
pub mod low_rank;
pub mod scratch;

pub use config::ModelConfig;
pub use error::{LinearError, Result};
pub use kernels::{pack_ternary, QuantKernel, TensorMap, TernaryKernel, TernaryMatrix};
pub use layers::{
    ForwardOptions, ForwardOutput, Intermediates, LoraAdapters, QuantLinear, StorageMode,
    WeightSource,
};
pub use low_rank::{LowRankApprox, LowRankFactors, RandomizedSvd};
pub use scratch::{ScratchAllocator, ScratchPool, ScratchSlice};
