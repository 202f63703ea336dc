//! Causal self-attention with incremental decoding.
//!
//! Bias-free q/k/v/out projections. Query and key are each scaled by
//! `head_dim^(-1/4)` before rotation so their product carries the usual
//! `head_dim^(-1/2)` factor while keeping intermediate magnitudes small.
//! With a cache handle, the freshly rotated key/value of the new time slice
//! is appended to the layer history and attention runs against the full
//! accumulated sequence.

use candle_core::{Module, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use super::cache::KvCacheLayer;
use super::rope::RotaryEmbedding;
use crate::{Error, ModelConfig, Result};

pub struct CausalSelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    /// Shared `[token_count, token_count]` additive causal mask.
    mask: Tensor,
    num_heads: usize,
    head_dim: usize,
    token_count: usize,
}

impl CausalSelfAttention {
    pub fn new(config: &ModelConfig, mask: Tensor, vb: VarBuilder) -> Result<Self> {
        let dim = config.model_dim;
        Ok(Self {
            q_proj: linear_no_bias(dim, dim, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(dim, dim, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(dim, dim, vb.pp("v_proj"))?,
            out_proj: linear_no_bias(dim, dim, vb.pp("out_proj"))?,
            mask,
            num_heads: config.num_heads(),
            head_dim: config.head_dim,
            token_count: config.token_count(),
        })
    }

    /// `[B, T, C]` → `[B, H, T, C/H]`
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, time, _) = x.dims3()?;
        Ok(x.reshape((batch, time, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// `[B, H, T, C/H]` → `[B, T, C]`
    fn merge_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, _, time, _) = x.dims4()?;
        Ok(x.transpose(1, 2)?
            .reshape((batch, time, self.num_heads * self.head_dim))?)
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, T, C]` (normalized hidden states)
    /// - `cache`: incremental-decoding handle; `None` for the full-sequence
    ///   (training) path.
    ///
    /// Returns `[B, T, C]`.
    pub fn forward(
        &self,
        x: &Tensor,
        rope: &RotaryEmbedding,
        cache: Option<&mut KvCacheLayer>,
    ) -> Result<Tensor> {
        let (_batch, time, _) = x.dims3()?;
        let offset = cache.as_ref().map(|c| c.len()).unwrap_or(0);
        if offset + time > self.token_count {
            return Err(Error::precondition(format!(
                "sequence offset {offset} + {time} exceeds token budget {}",
                self.token_count
            )));
        }

        let scale = (self.head_dim as f64).powf(-0.25);
        let q = (self.split_heads(&self.q_proj.forward(x)?)? * scale)?;
        let k_new = (self.split_heads(&self.k_proj.forward(x)?)? * scale)?;
        let v_new = self.split_heads(&self.v_proj.forward(x)?)?;

        // Every key is rotated exactly once, at its absolute position,
        // before entering the cache.
        let q = rope.apply(&q, offset)?;
        let k_new = rope.apply(&k_new, offset)?;

        let (k, v) = match cache {
            Some(layer) => layer.append(&k_new, &v_new)?,
            None => (k_new, v_new),
        };
        let total = k.dims()[2];

        // scores: [B, H, T, total]
        let scores = q
            .contiguous()?
            .matmul(&k.transpose(2, 3)?.contiguous()?)?;
        let mask = self
            .mask
            .narrow(0, offset, time)?
            .narrow(1, 0, total)?
            .to_dtype(scores.dtype())?;
        let scores = scores.broadcast_add(&mask)?;

        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = probs.matmul(&v.contiguous()?)?;
        self.out_proj
            .forward(&self.merge_heads(&out)?)
            .map_err(Into::into)
    }
}
