//! QuantLinear - Linear layer over a dense or quantized weight
//!
//! Lifecycle: `Empty -> load -> {Dense, Quantized} -> forward* -> unload -> Empty`.
//! `rank_reduce` is only valid on a dense layer.

use candle_core::{Device, DeviceLocation, Module, Tensor};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::lora::LoraAdapters;
use super::storage::{QuantHandle, Storage, StorageMode, WeightSource};
use super::TensorExt;
use crate::config::ModelConfig;
use crate::error::{LinearError, Result};
use crate::kernels::{QuantKernel, TensorMap, TernaryKernel, BIAS_KEY};
use crate::low_rank::{LowRankApprox, RandomizedSvd};
use crate::scratch::{self, ScratchAllocator};

/// Per-call switches for [`QuantLinear::forward`].
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    /// Use the dense reconstruction even when a quantized handle is present
    pub force_reconstruct: bool,
    /// Passed to the kernel's fused GEMM
    pub force_alt_kernel: bool,
    /// LoRA adapters to overlay, in order
    pub loras: Vec<String>,
    /// Wrap the result in [`Intermediates`]
    pub intermediates: bool,
}

impl ForwardOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconstruct(mut self) -> Self {
        self.force_reconstruct = true;
        self
    }

    pub fn alt_kernel(mut self) -> Self {
        self.force_alt_kernel = true;
        self
    }

    pub fn with_loras<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.loras = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn intermediates(mut self) -> Self {
        self.intermediates = true;
        self
    }
}

/// Named results for callers chaining several modules.
#[derive(Debug, Clone)]
pub struct Intermediates {
    pub hidden_states: Tensor,
}

#[derive(Debug, Clone)]
pub enum ForwardOutput {
    Hidden(Tensor),
    Intermediates(Intermediates),
}

impl ForwardOutput {
    pub fn hidden_states(&self) -> &Tensor {
        match self {
            ForwardOutput::Hidden(t) => t,
            ForwardOutput::Intermediates(i) => &i.hidden_states,
        }
    }

    pub fn into_tensor(self) -> Tensor {
        match self {
            ForwardOutput::Hidden(t) => t,
            ForwardOutput::Intermediates(i) => i.hidden_states,
        }
    }
}

/// Linear layer holding either a dense weight or a quantized kernel handle.
///
/// Not internally synchronized: `load`, `unload` and `rank_reduce` take
/// `&mut self`, `forward` only reads.
pub struct QuantLinear<K: QuantKernel = TernaryKernel> {
    key: String,
    in_features: usize,
    out_features: usize,
    padding: usize,
    has_bias: bool,
    config: ModelConfig,
    device: Device,
    kernel: Arc<K>,
    storage: Storage<K>,
    loras: LoraAdapters,
}

impl<K: QuantKernel> QuantLinear<K> {
    /// New empty layer. `out_features` is padded up to a multiple of 32.
    ///
    /// Scratch is requested on `config.device_idx`. For an accelerator
    /// `device` its ordinal must equal that index, which `load` checks.
    pub fn new(
        key: impl Into<String>,
        in_features: usize,
        out_features: usize,
        has_bias: bool,
        config: &ModelConfig,
        device: &Device,
        kernel: Arc<K>,
    ) -> Self {
        let padding = scratch::pad32(out_features);
        Self {
            key: key.into(),
            in_features,
            out_features: out_features + padding,
            padding,
            has_bias,
            config: *config,
            device: device.clone(),
            kernel,
            storage: Storage::Empty,
            loras: LoraAdapters::new(),
        }
    }

    /// Toggles output padding. Any loaded weight is released.
    pub fn with_pad32(mut self, pad32: bool) -> Self {
        self.unload();
        let original = self.original_out_features();
        self.padding = if pad32 { scratch::pad32(original) } else { 0 };
        self.out_features = original + self.padding;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Padded output width.
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn original_out_features(&self) -> usize {
        self.out_features - self.padding
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn has_bias(&self) -> bool {
        self.has_bias
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn kernel(&self) -> &Arc<K> {
        &self.kernel
    }

    pub fn matrix_shape(&self) -> (usize, usize) {
        (self.in_features, self.out_features)
    }

    pub fn numel(&self) -> usize {
        self.in_features.saturating_mul(self.out_features)
    }

    pub fn temp_dq_size(&self) -> usize {
        scratch::temp_dq_size(self.in_features, self.out_features)
    }

    pub fn temp_fwd_size(&self) -> usize {
        scratch::temp_fwd_size(
            self.out_features,
            self.config.max_input_len,
            self.config.max_batch_size,
        )
    }

    pub fn scratch_space(&self) -> usize {
        scratch::scratch_space(
            self.in_features,
            self.out_features,
            self.config.max_input_len,
            self.config.max_batch_size,
        )
    }

    pub fn scratch_space_fixed(&self) -> usize {
        self.scratch_space()
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.storage.mode()
    }

    pub fn is_quant(&self) -> bool {
        self.storage.mode() == StorageMode::Quantized
    }

    /// Populates the layer from `source`.
    ///
    /// Quantized sources take a fresh scratch slice of `temp_dq_size()` bytes
    /// from `allocator` on the layer's device before the handle is built.
    pub fn load(&mut self, source: WeightSource, allocator: &dyn ScratchAllocator) -> Result<()> {
        if source.has_bias() != self.has_bias {
            let reason = if self.has_bias {
                "has no bias but bias expected"
            } else {
                "has bias but bias is not expected"
            };
            return Err(LinearError::consistency(&self.key, reason));
        }

        if self.storage.mode() != StorageMode::Empty {
            warn!(key = %self.key, "load on a populated layer, unloading first");
            self.unload();
        }

        self.storage = match source {
            WeightSource::Dense(weight) => self.dense_storage(weight, None)?,
            WeightSource::DenseWithBias(weight, bias) => self.dense_storage(weight, Some(bias))?,
            WeightSource::Quantized(tensors) => self.quantized_storage(tensors, allocator)?,
        };
        Ok(())
    }

    fn dense_storage(&self, weight: Tensor, bias: Option<Tensor>) -> Result<Storage<K>> {
        let (rows, cols) = weight.dims2()?;
        if cols != self.in_features || !self.is_storable_width(rows) {
            return Err(LinearError::shape(
                &self.key,
                &[self.original_out_features(), self.in_features],
                &[rows, cols],
            ));
        }
        let weight = self.pad_rows(weight.to_device(&self.device)?, rows)?;

        let bias = match bias {
            Some(b) => {
                let len = b.dims1()?;
                if !self.is_storable_width(len) {
                    return Err(LinearError::shape(
                        &self.key,
                        &[self.original_out_features()],
                        &[len],
                    ));
                }
                Some(self.pad_rows(b.to_device(&self.device)?, len)?)
            }
            None => None,
        };

        debug!(key = %self.key, in_features = self.in_features, out_features = self.out_features, "loaded dense weight");
        Ok(Storage::Dense { weight, bias })
    }

    fn quantized_storage(
        &self,
        tensors: TensorMap,
        allocator: &dyn ScratchAllocator,
    ) -> Result<Storage<K>> {
        let device_idx = self.scratch_device_idx()?;
        allocator.begin_allocation_pass(device_idx)?;
        let scratch = allocator.get_slice(device_idx, self.temp_dq_size())?;

        let raw = self
            .kernel
            .build_handle(&tensors, &scratch)
            .map_err(LinearError::Kernel)?;
        // Owned from here on: any early return frees it.
        let handle = QuantHandle::new(self.kernel.clone(), raw);

        let (hin, hout) = self.kernel.handle_shape(handle.get());
        if (hin, hout) != (self.in_features, self.out_features) {
            return Err(LinearError::shape(
                &self.key,
                &[self.in_features, self.out_features],
                &[hin, hout],
            ));
        }

        info!(
            key = %self.key,
            in_features = hin,
            out_features = hout,
            scratch_bytes = scratch.len(),
            "built quantized handle"
        );
        Ok(Storage::Quantized {
            handle,
            tensors,
            scratch,
        })
    }

    /// Arena index for this layer's scratch, checked against the tensor device.
    fn scratch_device_idx(&self) -> Result<usize> {
        let idx = self.config.device_idx;
        match self.device.location() {
            DeviceLocation::Cpu => Ok(idx),
            DeviceLocation::Cuda { gpu_id } | DeviceLocation::Metal { gpu_id } if gpu_id == idx => {
                Ok(idx)
            }
            DeviceLocation::Cuda { gpu_id } | DeviceLocation::Metal { gpu_id } => {
                Err(LinearError::invalid(
                    &self.key,
                    format!(
                        "layer lives on device {} but config.device_idx is {}",
                        gpu_id, idx
                    ),
                ))
            }
        }
    }

    /// Widths a dense source may have along the output dimension.
    fn is_storable_width(&self, width: usize) -> bool {
        width == self.original_out_features() || width == self.out_features
    }

    /// Zero-pads dim 0 from `rows` up to `out_features`.
    fn pad_rows(&self, t: Tensor, rows: usize) -> Result<Tensor> {
        if rows == self.out_features {
            return Ok(t);
        }
        Ok(t.pad_with_zeros(0, 0, self.out_features - rows)?.contiguous()?)
    }

    /// Releases the weight. No-op on an empty layer.
    pub fn unload(&mut self) {
        match std::mem::replace(&mut self.storage, Storage::Empty) {
            Storage::Empty => {}
            Storage::Dense { .. } => {
                info!(key = %self.key, "released dense weight");
            }
            Storage::Quantized {
                handle,
                tensors,
                scratch,
            } => {
                // Handle first: it may reference the backing tensors.
                drop(handle);
                drop(tensors);
                drop(scratch);
                info!(key = %self.key, "released quantized handle");
            }
        }
    }

    /// Dense `[in, out]` view of the weight, reconstructed if quantized.
    pub fn get_weight_tensor_dq(&self) -> Result<Tensor> {
        match &self.storage {
            Storage::Empty => Err(LinearError::no_data(&self.key)),
            Storage::Dense { weight, .. } => Ok(weight.t()?),
            Storage::Quantized { handle, .. } => self
                .kernel
                .reconstruct_dense(handle.get())
                .map_err(LinearError::Kernel),
        }
    }

    /// `Ok(None)` when the layer has no bias.
    pub fn get_bias_tensor(&self) -> Result<Option<Tensor>> {
        match &self.storage {
            Storage::Empty => Err(LinearError::no_data(&self.key)),
            Storage::Dense { bias, .. } => Ok(bias.clone()),
            Storage::Quantized { tensors, .. } => Ok(tensors.get(BIAS_KEY).cloned()),
        }
    }

    /// `x: [..., in]` -> `[..., out_features]` (padded width).
    pub fn forward(&self, x: &Tensor, opts: &ForwardOptions) -> Result<ForwardOutput> {
        match x.dims().last() {
            Some(&d) if d == self.in_features => {}
            _ => {
                let mut expected = x.dims().to_vec();
                match expected.last_mut() {
                    Some(last) => *last = self.in_features,
                    None => expected.push(self.in_features),
                }
                return Err(LinearError::shape(&self.key, &expected, x.dims()));
            }
        }

        let out = match &self.storage {
            Storage::Quantized { handle, .. } if !opts.force_reconstruct => {
                debug!(key = %self.key, alt = opts.force_alt_kernel, "fused quantized forward");
                self.forward_fused(x, handle.get(), opts.force_alt_kernel)?
            }
            _ => self.forward_reconstructed(x)?,
        };

        let out = self.loras.apply(&self.key, x, out, &opts.loras)?;

        Ok(if opts.intermediates {
            ForwardOutput::Intermediates(Intermediates { hidden_states: out })
        } else {
            ForwardOutput::Hidden(out)
        })
    }

    fn forward_fused(&self, x: &Tensor, handle: &K::Handle, alt: bool) -> Result<Tensor> {
        let dims = x.dims();
        let rank = dims.len();
        let flat = if rank == 1 {
            x.unsqueeze(0)?
        } else {
            x.flatten(0, rank - 2)?
        };

        let out = self
            .kernel
            .fused_gemm(&flat.contiguous()?, handle, alt)
            .map_err(LinearError::Kernel)?;

        let mut shape = dims[..rank - 1].to_vec();
        shape.push(self.out_features);
        Ok(out.reshape(shape)?.to_dtype(x.dtype())?)
    }

    fn forward_reconstructed(&self, x: &Tensor) -> Result<Tensor> {
        let weight = self.get_weight_tensor_dq()?;
        let mut out = x.to_dtype(weight.dtype())?.matmul_robust(&weight)?;
        if self.has_bias {
            if let Some(bias) = self.get_bias_tensor()? {
                let bias = bias.to_dtype(out.dtype())?.to_device(out.device())?;
                out = out.broadcast_add(&bias)?;
            }
        }
        Ok(out.to_dtype(x.dtype())?)
    }

    /// Narrows the last dimension back to the unpadded width.
    pub fn trim_padding(&self, t: &Tensor) -> Result<Tensor> {
        if self.padding == 0 {
            return Ok(t.clone());
        }
        let last = t.rank().checked_sub(1).ok_or_else(|| {
            LinearError::shape(&self.key, &[self.out_features], t.dims())
        })?;
        Ok(t.narrow(last, 0, self.original_out_features())?)
    }

    // --- LoRA ---

    pub fn loras(&self) -> &LoraAdapters {
        &self.loras
    }

    pub fn lora_ids(&self) -> Vec<String> {
        self.loras.ids()
    }

    /// Registers `A: [in, r]` for `id`.
    pub fn set_lora_a(&mut self, id: &str, a: Tensor) -> Result<()> {
        let (rows, rank) = a.dims2()?;
        if rows != self.in_features {
            return Err(LinearError::shape(&self.key, &[self.in_features, rank], &[rows, rank]));
        }
        if let Some(b) = self.loras.get_b(id) {
            self.check_lora_rank(id, rank, b.dim(0)?)?;
        }
        debug!(key = %self.key, id, rank, "set LoRA A");
        self.loras.set_a(id, a.to_device(&self.device)?);
        Ok(())
    }

    /// Registers `B: [r, out]` for `id`; unpadded widths are zero-padded.
    pub fn set_lora_b(&mut self, id: &str, b: Tensor) -> Result<()> {
        let (rank, cols) = b.dims2()?;
        if !self.is_storable_width(cols) {
            return Err(LinearError::shape(
                &self.key,
                &[rank, self.original_out_features()],
                &[rank, cols],
            ));
        }
        if let Some(a) = self.loras.get_a(id) {
            self.check_lora_rank(id, a.dim(1)?, rank)?;
        }
        let b = if cols == self.out_features {
            b
        } else {
            b.pad_with_zeros(1, 0, self.out_features - cols)?
        };
        debug!(key = %self.key, id, rank, "set LoRA B");
        self.loras.set_b(id, b.to_device(&self.device)?.contiguous()?);
        Ok(())
    }

    /// Registers a complete adapter; nothing is stored if either factor is rejected.
    pub fn add_lora(&mut self, id: &str, a: Tensor, b: Tensor) -> Result<()> {
        let (_, rank_a) = a.dims2()?;
        let (rank_b, _) = b.dims2()?;
        self.check_lora_rank(id, rank_a, rank_b)?;
        let previous = (self.loras.get_a(id).cloned(), self.loras.get_b(id).cloned());
        self.loras.remove(id);

        let result = self
            .set_lora_a(id, a)
            .and_then(|_| self.set_lora_b(id, b));
        if result.is_err() {
            self.loras.remove(id);
            if let Some(a) = previous.0 {
                self.loras.set_a(id, a);
            }
            if let Some(b) = previous.1 {
                self.loras.set_b(id, b);
            }
        }
        result
    }

    pub fn remove_lora(&mut self, id: &str) -> bool {
        self.loras.remove(id)
    }

    fn check_lora_rank(&self, id: &str, rank_a: usize, rank_b: usize) -> Result<()> {
        if rank_a != rank_b {
            return Err(LinearError::consistency(
                &self.key,
                format!("LoRA {} rank mismatch: A has {}, B has {}", id, rank_a, rank_b),
            ));
        }
        Ok(())
    }

    // --- Rank reduction ---

    /// Replaces the dense weight with its rank `floor(k * min(in, out))` approximation.
    pub fn rank_reduce(&mut self, k: f64) -> Result<()> {
        self.rank_reduce_with(k, &RandomizedSvd::default())
    }

    pub fn rank_reduce_with(&mut self, k: f64, oracle: &dyn LowRankApprox) -> Result<()> {
        let weight = match &self.storage {
            Storage::Quantized { .. } => {
                return Err(LinearError::invalid(&self.key, "can't rank-reduce quantized layer"))
            }
            Storage::Empty => return Err(LinearError::no_data(&self.key)),
            Storage::Dense { weight, .. } => weight,
        };
        if !(k > 0.0 && k <= 1.0) {
            return Err(LinearError::invalid(
                &self.key,
                format!("relative rank {} outside (0, 1]", k),
            ));
        }

        let max_rank = self.in_features.min(self.out_features);
        let desired_rank = (max_rank as f64 * k).floor() as usize;
        if desired_rank == 0 {
            return Err(LinearError::invalid(
                &self.key,
                format!("relative rank {} rounds to rank 0 of {}", k, max_rank),
            ));
        }

        let factors = oracle.factorize(weight, desired_rank)?;
        let approx = factors
            .reconstruct()?
            .to_dtype(weight.dtype())?
            .to_device(weight.device())?;

        debug!(key = %self.key, desired_rank, max_rank, "rank-reduced weight");
        if let Storage::Dense { weight, .. } = &mut self.storage {
            *weight = approx;
        }
        Ok(())
    }
}

impl<K: QuantKernel> Module for QuantLinear<K> {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        QuantLinear::<K>::forward(self, xs, &ForwardOptions::default())
            .map(ForwardOutput::into_tensor)
            .map_err(candle_core::Error::wrap)
    }
}
