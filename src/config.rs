//! Model configuration.
//!
//! Defaults match the deployed checkpoint: 16384-entry image codebook,
//! 128-byte caption prefix, 16×16 token grid, 24 layers, 1024 model dim.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Size of the byte vocabulary appended after the image codebook.
/// Caption bytes are stored as `codebook_size + byte`.
pub const BYTE_VOCAB: usize = 256;

/// Transformer configuration.
///
/// Immutable once the model is built. `vocab_size` and `token_count` are
/// derived: the vocabulary is the image codebook plus one token per byte
/// value, and the token budget is the caption prefix plus the image grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of discrete codes in the image codebook.
    #[serde(default = "default_codebook_size")]
    pub codebook_size: usize,

    /// Length of the caption byte prefix.
    #[serde(default = "default_caption_bytes")]
    pub caption_bytes: usize,

    /// Number of image tokens per sample (grid cells, e.g. 16×16 = 256).
    #[serde(default = "default_grid_tokens")]
    pub grid_tokens: usize,

    /// Number of transformer blocks.
    #[serde(default = "default_layer_count")]
    pub layer_count: usize,

    /// Hidden dimension.
    #[serde(default = "default_model_dim")]
    pub model_dim: usize,

    /// Dimension per attention head. Must divide `model_dim`.
    #[serde(default = "default_head_dim")]
    pub head_dim: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            codebook_size: default_codebook_size(),
            caption_bytes: default_caption_bytes(),
            grid_tokens: default_grid_tokens(),
            layer_count: default_layer_count(),
            model_dim: default_model_dim(),
            head_dim: default_head_dim(),
        }
    }
}

impl ModelConfig {
    /// Total vocabulary: image codebook + byte vocabulary.
    pub fn vocab_size(&self) -> usize {
        self.codebook_size + BYTE_VOCAB
    }

    /// Maximum sequence length: caption prefix + image grid.
    pub fn token_count(&self) -> usize {
        self.caption_bytes + self.grid_tokens
    }

    /// Number of attention heads.
    pub fn num_heads(&self) -> usize {
        self.model_dim / self.head_dim
    }

    /// Check the structural invariants before any tensor math runs.
    pub fn validate(&self) -> Result<()> {
        if self.head_dim == 0 || self.model_dim % self.head_dim != 0 {
            return Err(Error::Config(format!(
                "model_dim {} must be a multiple of head_dim {}",
                self.model_dim, self.head_dim
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "head_dim {} must be even for rotary embeddings",
                self.head_dim
            )));
        }
        if self.layer_count == 0 {
            return Err(Error::Config("layer_count must be at least 1".into()));
        }
        if self.caption_bytes == 0 || self.grid_tokens == 0 {
            return Err(Error::Config(
                "caption_bytes and grid_tokens must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_codebook_size() -> usize {
    16384
}
fn default_caption_bytes() -> usize {
    128
}
fn default_grid_tokens() -> usize {
    256
}
fn default_layer_count() -> usize {
    24
}
fn default_model_dim() -> usize {
    1024
}
fn default_head_dim() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = ModelConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.vocab_size(), 16384 + 256);
        assert_eq!(cfg.token_count(), 128 + 256);
        assert_eq!(cfg.num_heads(), 16);
    }

    #[test]
    fn rejects_indivisible_head_dim() {
        let cfg = ModelConfig {
            model_dim: 100,
            head_dim: 64,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_odd_head_dim() {
        let cfg = ModelConfig {
            model_dim: 63,
            head_dim: 7,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
