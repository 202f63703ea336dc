//! Causal transformer over caption-byte + image-codebook tokens.
//!
//! A stack of pre-norm blocks (attention + GELU feed-forward), a token
//! embedding table, and a zero-initialized unembedding projection. The zero
//! init gives a uniform distribution over the vocabulary at the start of
//! training — a deliberate choice, not an accident of the loader.
//!
//! Two entry points share the block stack:
//! - [`Transformer::forward_full`] — whole sequence, no cache (training)
//! - [`Transformer::forward_step`] — new tokens only, against a [`KvCache`]
//!   holding everything decoded so far (generation)

pub mod attention;
pub mod cache;
pub mod mask;
pub mod rope;

use candle_core::backprop::GradStore;
use candle_core::{DType, Module, Tensor};
use candle_nn::{embedding, layer_norm, linear_no_bias, Embedding, LayerNorm, Linear, VarBuilder};
use candle_nn::{Init, VarMap};

use crate::{ModelConfig, Result};
use attention::CausalSelfAttention;
use cache::KvCache;
use rope::{RotaryEmbedding, ROPE_BASE};

const NORM_EPS: f64 = 1e-5;

/// One transformer block: pre-norm attention and pre-norm feed-forward,
/// both residual.
struct Block {
    attn: CausalSelfAttention,
    norm1: LayerNorm,
    norm2: LayerNorm,
    lin1: Linear,
    lin2: Linear,
}

impl Block {
    fn new(config: &ModelConfig, causal_mask: Tensor, vb: VarBuilder) -> Result<Self> {
        let dim = config.model_dim;
        Ok(Self {
            attn: CausalSelfAttention::new(config, causal_mask, vb.pp("attn"))?,
            norm1: layer_norm(dim, NORM_EPS, vb.pp("norm1"))?,
            norm2: layer_norm(dim, NORM_EPS, vb.pp("norm2"))?,
            lin1: linear_no_bias(dim, dim * 2, vb.pp("lin1"))?,
            lin2: linear_no_bias(dim * 2, dim, vb.pp("lin2"))?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rope: &RotaryEmbedding,
        cache: Option<&mut cache::KvCacheLayer>,
    ) -> Result<Tensor> {
        let h = (x + self.attn.forward(&self.norm1.forward(x)?, rope, cache)?)?;
        let mlp = self
            .lin2
            .forward(&self.lin1.forward(&self.norm2.forward(&h)?)?.gelu()?)?;
        (h + mlp).map_err(Into::into)
    }
}

/// The autoregressive token model.
pub struct Transformer {
    config: ModelConfig,
    embed: Embedding,
    blocks: Vec<Block>,
    norm_out: LayerNorm,
    unembed: Linear,
    rope: RotaryEmbedding,
}

impl Transformer {
    /// Build the model from a [`VarBuilder`] — either a `VarMap` for fresh
    /// initialization or mmaped safetensors for a trained checkpoint.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let rope = RotaryEmbedding::new(
            config.head_dim,
            config.token_count(),
            ROPE_BASE,
            vb.device(),
        )?;
        let causal_mask = mask::causal_mask(config.token_count(), vb.dtype(), vb.device())?;

        let embed = embedding(config.vocab_size(), config.model_dim, vb.pp("embed"))?;
        let blocks = (0..config.layer_count)
            .map(|i| Block::new(config, causal_mask.clone(), vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let norm_out = layer_norm(config.model_dim, NORM_EPS, vb.pp("norm_out"))?;

        // Zero-initialized unembedding: uniform initial token distribution.
        let unembed_weight = vb.pp("unembed").get_with_hints(
            (config.vocab_size(), config.model_dim),
            "weight",
            Init::Const(0.0),
        )?;
        let unembed = Linear::new(unembed_weight, None);

        Ok(Self {
            config: config.clone(),
            embed,
            blocks,
            norm_out,
            unembed,
            rope,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Fresh per-session cache sized to this model's layer stack.
    pub fn new_cache(&self) -> KvCache {
        KvCache::new(self.config.layer_count)
    }

    /// Full-sequence forward pass (training path, no cache).
    ///
    /// `tokens`: `[B, T]` indices. Returns logits `[B, T, vocab]`.
    pub fn forward_full(&self, tokens: &Tensor) -> Result<Tensor> {
        self.forward_inner(tokens, None)
    }

    /// Incremental forward pass over the newly produced tokens only.
    ///
    /// The cache must hold everything that precedes `tokens`; it grows by
    /// `tokens`' time length. Returns logits `[B, T_new, vocab]`.
    pub fn forward_step(&self, tokens: &Tensor, cache: &mut KvCache) -> Result<Tensor> {
        self.forward_inner(tokens, Some(cache))
    }

    fn forward_inner(&self, tokens: &Tensor, mut cache: Option<&mut KvCache>) -> Result<Tensor> {
        let mut h = self.embed.forward(tokens)?;
        for (i, block) in self.blocks.iter().enumerate() {
            h = match cache.as_mut() {
                Some(c) => block.forward(&h, &self.rope, Some(c.layer_mut(i)))?,
                None => block.forward(&h, &self.rope, None)?,
            };
        }
        let h = self.norm_out.forward(&h)?;
        self.unembed.forward(&h).map_err(Into::into)
    }
}

/// Aggregate L2 norm over all parameters in `varmap`.
pub fn param_norm(varmap: &VarMap) -> Result<f32> {
    let mut total = 0.0f64;
    for var in varmap.all_vars() {
        let sq: f32 = var
            .to_dtype(DType::F32)?
            .sqr()?
            .sum_all()?
            .to_scalar()?;
        total += f64::from(sq);
    }
    Ok(total.sqrt() as f32)
}

/// Aggregate L2 norm over the gradients of all parameters in `varmap`.
///
/// A parameter without a gradient is logged as a warning and skipped;
/// training continues.
pub fn grad_norm(varmap: &VarMap, grads: &GradStore) -> Result<f32> {
    let vars = varmap.data().lock().unwrap();
    let mut total = 0.0f64;
    for (name, var) in vars.iter() {
        match grads.get(var) {
            Some(grad) => {
                let sq: f32 = grad
                    .to_dtype(DType::F32)?
                    .sqr()?
                    .sum_all()?
                    .to_scalar()?;
                total += f64::from(sq);
            }
            None => tracing::warn!(param = %name, "parameter has no gradient"),
        }
    }
    Ok(total.sqrt() as f32)
}
