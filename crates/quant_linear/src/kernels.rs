//! Kernels Module - Quantized matmul backends
//!
//! The layer only talks to a backend through [`QuantKernel`]. The backend owns
//! the packed layout; the layer owns the handle's lifetime.
//! - packing: 1.58-bit ternary planes and the multi-base tensor map
//! - cpu: streaming-dequantization GEMM (rayon, AVX2)
//! - ternary: the [`QuantKernel`] built on the two above

use candle_core::{Result, Tensor};
use std::collections::HashMap;

use crate::scratch::ScratchSlice;

pub mod cpu;
pub mod packing;
pub mod ternary;

pub use packing::{pack_ternary, TernaryPlane};
pub use ternary::{TernaryKernel, TernaryMatrix};

/// Packed weight codes in a quantized tensor map.
pub const WEIGHT_PACKED_KEY: &str = "weight_packed";
/// Per-base scales in a quantized tensor map.
pub const SCALES_KEY: &str = "scales";
/// Optional bias in a quantized tensor map.
pub const BIAS_KEY: &str = "bias";

/// Named component tensors of a quantized weight.
pub type TensorMap = HashMap<String, Tensor>;

/// External quantized-matmul backend.
pub trait QuantKernel: Send + Sync {
    type Handle: Send + Sync;

    /// Builds the opaque handle. `scratch` is the layer's dequantization buffer.
    fn build_handle(&self, tensors: &TensorMap, scratch: &ScratchSlice) -> Result<Self::Handle>;

    fn free_handle(&self, handle: Self::Handle);

    /// `(in_features, out_features)` of the matrix behind `handle`.
    fn handle_shape(&self, handle: &Self::Handle) -> (usize, usize);

    /// `input` is `[rows, in]`; returns `[rows, out]` with any bias applied.
    fn fused_gemm(&self, input: &Tensor, handle: &Self::Handle, use_alt_kernel: bool)
        -> Result<Tensor>;

    /// Dense `[in, out]` reconstruction of the weight.
    fn reconstruct_dense(&self, handle: &Self::Handle) -> Result<Tensor>;
}
