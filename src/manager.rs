//! Generation manager.
//!
//! Owns the loaded model and hands out token streams to the serving layer.
//! Each request gets its own KV cache and runs on the blocking thread pool;
//! the async side consumes tokens through a bounded channel. If the receiver
//! is dropped (client gone), the blocking side notices on the next send and
//! abandons the run.

use std::path::PathBuf;
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::caption;
use crate::model::{ImageDecoder, SampleOptions, Transformer};
use crate::{Error, ModelConfig, Result};

/// Manager configuration, typically deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Path to the safetensors checkpoint.
    pub checkpoint: PathBuf,

    /// Model shape. Defaults match the deployed checkpoint.
    #[serde(default)]
    pub model: ModelConfig,

    /// CUDA device ordinal; ignored when CUDA is unavailable.
    #[serde(default)]
    pub cuda_device: usize,

    /// Compute dtype: "f32", "f16" or "bf16".
    #[serde(default = "default_dtype")]
    pub dtype: String,

    /// Capacity of the per-request token channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_dtype() -> String {
    "f32".to_string()
}

fn default_channel_capacity() -> usize {
    32
}

fn parse_dtype(name: &str) -> Result<DType> {
    match name {
        "f32" => Ok(DType::F32),
        "f16" => Ok(DType::F16),
        "bf16" => Ok(DType::BF16),
        other => Err(Error::Config(format!("unknown dtype {other:?}"))),
    }
}

/// Best available device for the given CUDA ordinal.
pub fn preferred_device(ordinal: usize) -> Device {
    Device::cuda_if_available(ordinal).unwrap_or(Device::Cpu)
}

/// Loaded model plus everything the serving layer needs to run requests.
pub struct GenerationManager {
    model: Arc<Transformer>,
    config: ModelConfig,
    decoder: Option<Arc<dyn ImageDecoder>>,
    device: Device,
    channel_capacity: usize,
}

impl GenerationManager {
    /// Load the checkpoint and build the model. A missing or unreadable
    /// checkpoint is fatal.
    pub fn load(config: ManagerConfig) -> Result<Self> {
        if !config.checkpoint.exists() {
            return Err(Error::Checkpoint(format!(
                "checkpoint not found: {}",
                config.checkpoint.display()
            )));
        }
        config.model.validate()?;
        let device = preferred_device(config.cuda_device);
        let dtype = parse_dtype(&config.dtype)?;
        tracing::info!(
            checkpoint = %config.checkpoint.display(),
            device = ?device,
            dtype = ?dtype,
            "loading model"
        );
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&config.checkpoint], dtype, &device)?
        };
        let model = Transformer::new(&config.model, vb)?;
        tracing::info!(
            layers = config.model.layer_count,
            vocab = config.model.vocab_size(),
            tokens = config.model.token_count(),
            "model ready"
        );
        Ok(Self {
            model: Arc::new(model),
            config: config.model,
            decoder: None,
            device,
            channel_capacity: config.channel_capacity,
        })
    }

    /// Wrap an already-built model. Used by tests and embedders.
    pub fn from_model(model: Transformer, device: Device) -> Self {
        let config = model.config().clone();
        Self {
            model: Arc::new(model),
            config,
            decoder: None,
            device,
            channel_capacity: default_channel_capacity(),
        }
    }

    /// Attach an image decoder for `render`.
    pub fn with_decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    /// Start a generation run for `prompt` and stream its grid tokens.
    ///
    /// The run executes on the blocking pool. Dropping the receiver cancels
    /// it at the next token boundary. An `Err` item terminates the stream.
    pub fn stream(
        &self,
        prompt: String,
        guidance_scale: Option<f64>,
        seed: Option<u64>,
    ) -> mpsc::Receiver<Result<u32>> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let model = Arc::clone(&self.model);
        let config = self.config.clone();
        let device = self.device.clone();

        tokio::task::spawn_blocking(move || {
            let prefix = match caption::caption_tensor(&prompt, &config, &device) {
                Ok(prefix) => prefix,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            };
            let opts = SampleOptions {
                cfg_scale: guidance_scale,
                seed,
                ..Default::default()
            };
            let stream = match model.generate(&prefix, opts) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            };
            for item in stream {
                let failed = item.is_err();
                if tx.blocking_send(item).is_err() {
                    tracing::debug!("receiver dropped, abandoning generation");
                    return;
                }
                if failed {
                    return;
                }
            }
        });
        rx
    }

    /// Decode a full token grid into image bytes.
    pub fn render(&self, tokens: &[u32]) -> Result<Vec<u8>> {
        let decoder = self
            .decoder
            .as_ref()
            .ok_or_else(|| Error::Request("no image decoder configured".into()))?;
        if tokens.len() != decoder.grid_tokens() {
            return Err(Error::Request(format!(
                "expected {} grid tokens, got {}",
                decoder.grid_tokens(),
                tokens.len()
            )));
        }
        decoder.decode(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::decoder::testing::EchoDecoder;
    use candle_nn::{VarBuilder, VarMap};

    fn tiny_manager() -> GenerationManager {
        let config = ModelConfig {
            codebook_size: 8,
            caption_bytes: 4,
            grid_tokens: 6,
            layer_count: 1,
            model_dim: 8,
            head_dim: 4,
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Transformer::new(&config, vb).unwrap();
        GenerationManager::from_model(model, Device::Cpu)
    }

    #[test]
    fn missing_checkpoint_is_fatal() {
        let config: ManagerConfig = serde_json::from_str(
            r#"{ "checkpoint": "/nonexistent/model.safetensors" }"#,
        )
        .unwrap();
        assert_eq!(config.dtype, "f32");
        assert_eq!(config.channel_capacity, 32);
        assert!(matches!(
            GenerationManager::load(config),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn rejects_unknown_dtype() {
        assert!(matches!(parse_dtype("f64"), Err(Error::Config(_))));
        assert!(parse_dtype("bf16").is_ok());
    }

    #[tokio::test]
    async fn stream_emits_the_grid_budget() {
        let manager = tiny_manager();
        let grid = manager.model_config().grid_tokens;
        let mut rx = manager.stream("test".to_string(), None, Some(1));
        let mut tokens = Vec::new();
        while let Some(item) = rx.recv().await {
            tokens.push(item.unwrap());
        }
        assert_eq!(tokens.len(), grid);
    }

    #[tokio::test]
    async fn dropping_the_receiver_stops_the_run() {
        let manager = tiny_manager();
        let mut rx = manager.stream("test".to_string(), Some(2.0), Some(1));
        let first = rx.recv().await.unwrap().unwrap();
        assert!((first as usize) < manager.model_config().vocab_size());
        drop(rx);
        // The blocking task exits on its next send; nothing to observe
        // beyond not hanging.
    }

    #[test]
    fn render_requires_a_decoder() {
        let manager = tiny_manager();
        assert!(matches!(manager.render(&[0; 6]), Err(Error::Request(_))));
    }

    #[test]
    fn render_checks_the_grid_size() {
        let manager = tiny_manager().with_decoder(Arc::new(EchoDecoder { grid: 6 }));
        assert!(matches!(manager.render(&[0; 5]), Err(Error::Request(_))));
        let bytes = manager.render(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(bytes.len(), 12);
    }
}
