//! Scratch Module - Sizing policy and device scratch allocation
//!
//! A quantized layer needs two workspaces:
//! - dequantization buffer: half-precision `[in, out]` reconstruction
//! - forward buffer: f32 `[rows, out]` output for the largest batch
//!
//! Both are reserved as the layer's footprint. The device arena is sized once
//! for the worst layer in the stack and sliced per layer on each allocation pass.

use crate::error::Result;

pub mod arena;

pub use arena::{ScratchPool, ScratchSlice};

/// Output widths are padded up to a multiple of this.
pub const PAD_ALIGN: usize = 32;

/// Slack appended to every scratch buffer.
pub const SCRATCH_SLACK: usize = 128;

/// Bytes per element of the dequantization buffer (f16).
const DQ_ELEM_BYTES: usize = 2;

/// Bytes per element of the forward buffer (f32).
const FWD_ELEM_BYTES: usize = 4;

/// Columns needed to bring `out_features` up to the next multiple of [`PAD_ALIGN`].
pub fn pad32(out_features: usize) -> usize {
    (PAD_ALIGN - out_features % PAD_ALIGN) % PAD_ALIGN
}

// Sizes saturate at `usize::MAX` instead of wrapping; an allocator then
// reports the request as exhausted.

pub fn temp_dq_size(in_features: usize, out_features: usize) -> usize {
    in_features
        .saturating_mul(out_features)
        .saturating_mul(DQ_ELEM_BYTES)
        .saturating_add(SCRATCH_SLACK)
}

pub fn temp_fwd_size(out_features: usize, max_input_len: usize, max_batch_size: usize) -> usize {
    out_features
        .saturating_mul(max_input_len)
        .saturating_mul(max_batch_size)
        .saturating_mul(FWD_ELEM_BYTES)
        .saturating_add(SCRATCH_SLACK)
}

/// Total footprint of one layer: both buffers, even though a forward call uses one.
pub fn scratch_space(
    in_features: usize,
    out_features: usize,
    max_input_len: usize,
    max_batch_size: usize,
) -> usize {
    temp_dq_size(in_features, out_features)
        .saturating_add(temp_fwd_size(out_features, max_input_len, max_batch_size))
}

/// Per-device scratch provider injected into `QuantLinear::load`.
pub trait ScratchAllocator {
    /// Starts a new allocation turn on the device; resets its cursor.
    fn begin_allocation_pass(&self, device_idx: usize) -> Result<()>;

    fn get_slice(&self, device_idx: usize, size_bytes: usize) -> Result<ScratchSlice>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad32_bounds() {
        for out in 1..=300 {
            let p = pad32(out);
            assert!(p < PAD_ALIGN);
            assert_eq!((out + p) % PAD_ALIGN, 0, "out={}", out);
        }
        assert_eq!(pad32(32), 0);
        assert_eq!(pad32(33), 31);
        assert_eq!(pad32(4096), 0);
        assert_eq!(pad32(11008), 0);
        assert_eq!(pad32(100), 28);
    }

    #[test]
    fn test_buffer_formulas() {
        assert_eq!(temp_dq_size(4096, 4096), 4096 * 4096 * 2 + 128);
        assert_eq!(temp_dq_size(1, 1), 130);
        assert_eq!(temp_fwd_size(4096, 2048, 1), 4096 * 2048 * 4 + 128);
        assert_eq!(temp_fwd_size(32, 16, 8), 32 * 16 * 8 * 4 + 128);
    }

    #[test]
    fn test_oversized_layers_saturate() {
        let huge = usize::MAX / 2;
        assert_eq!(temp_dq_size(huge, 4), usize::MAX);
        assert_eq!(temp_fwd_size(huge, 2, 2), usize::MAX);
        assert_eq!(scratch_space(huge, 4, 1, 1), usize::MAX);
        assert_eq!(scratch_space(1, 1, 1, 1), 130 + 132);
    }

    #[test]
    fn test_scratch_space_is_sum() {
        let (i, o, l, b) = (256, 512, 64, 2);
        assert_eq!(
            scratch_space(i, o, l, b),
            temp_dq_size(i, o) + temp_fwd_size(o, l, b)
        );
    }
}
