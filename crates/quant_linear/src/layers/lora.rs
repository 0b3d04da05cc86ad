//! LoraAdapters - Per-adapter low-rank additive corrections
//!
//! For adapter `id`: `y += (x @ A[id]) @ B[id]`, `A: [in, r]`, `B: [r, out]`.

use candle_core::Tensor;
use std::collections::{BTreeSet, HashMap};

use super::TensorExt;
use crate::error::{LinearError, Result};

/// Two maps keyed by the same adapter ids.
///
/// They are filled independently so that a half-registered adapter is
/// reported at forward time instead of being silently ignored.
#[derive(Debug, Clone, Default)]
pub struct LoraAdapters {
    a: HashMap<String, Tensor>,
    b: HashMap<String, Tensor>,
}

impl LoraAdapters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_a(&mut self, id: &str, a: Tensor) {
        self.a.insert(id.to_string(), a);
    }

    pub fn set_b(&mut self, id: &str, b: Tensor) {
        self.b.insert(id.to_string(), b);
    }

    pub fn get_a(&self, id: &str) -> Option<&Tensor> {
        self.a.get(id)
    }

    pub fn get_b(&self, id: &str) -> Option<&Tensor> {
        self.b.get(id)
    }

    /// Drops both factors of `id`. Returns whether anything was removed.
    pub fn remove(&mut self, id: &str) -> bool {
        let had_a = self.a.remove(id).is_some();
        let had_b = self.b.remove(id).is_some();
        had_a || had_b
    }

    /// Every id present in either map, sorted.
    pub fn ids(&self) -> Vec<String> {
        let ids: BTreeSet<&String> = self.a.keys().chain(self.b.keys()).collect();
        ids.into_iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.a.is_empty() && self.b.is_empty()
    }

    /// Both factors for `id`, `None` if the adapter is absent from both maps.
    pub fn pair(&self, key: &str, id: &str) -> Result<Option<(&Tensor, &Tensor)>> {
        match (self.a.get(id), self.b.get(id)) {
            (Some(a), Some(b)) => Ok(Some((a, b))),
            (None, None) => Ok(None),
            (Some(_), None) => Err(LinearError::consistency(
                key,
                format!("LoRA {} has A without matching B", id),
            )),
            (None, Some(_)) => Err(LinearError::consistency(
                key,
                format!("LoRA {} has B without matching A", id),
            )),
        }
    }

    /// Adds the correction of every requested adapter to `out`.
    pub fn apply(&self, key: &str, x: &Tensor, out: Tensor, ids: &[String]) -> Result<Tensor> {
        let mut out = out;
        for id in ids {
            if let Some((a, b)) = self.pair(key, id)? {
                let temp = x.to_dtype(a.dtype())?.matmul_robust(a)?;
                let delta = temp
                    .matmul_robust(b)?
                    .to_dtype(out.dtype())?
                    .to_device(out.device())?;
                out = (out + delta)?;
            }
        }
        Ok(out)
    }
}
