//! ModelConfig - Model-wide limits read by every linear layer

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{LinearError, Result};

fn default_max_input_len() -> usize {
    2048
}

fn default_max_batch_size() -> usize {
    1
}

/// Model-wide configuration a layer reads to size its scratch buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModelConfig {
    #[serde(default = "default_max_input_len", alias = "max_seq_len")]
    pub max_input_len: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Index of the device the layers (and their scratch arena) live on
    #[serde(default)]
    pub device_idx: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            max_input_len: default_max_input_len(),
            max_batch_size: default_max_batch_size(),
            device_idx: 0,
        }
    }
}

impl ModelConfig {
    pub fn new(max_input_len: usize, max_batch_size: usize, device_idx: usize) -> Self {
        Self {
            max_input_len,
            max_batch_size,
            device_idx,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| LinearError::Config(e.to_string()))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LinearError::Config(format!("failed to read {:?}: {}", path, e)))?;
        Self::from_json_str(&text)
    }
}
