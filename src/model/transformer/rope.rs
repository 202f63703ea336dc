//! Rotary position embedding (RoPE).
//!
//! Torchtune-style interleaved RoPE with `base = 10000`: the head dimension
//! is treated as `head_dim / 2` complex pairs `(x0, x1)` and each pair at
//! absolute position `p` is rotated by `θ(p, i) = p · base^(-2i / head_dim)`.
//!
//! The cos/sin tables are precomputed once per model and shared read-only by
//! every attention layer and every generation session.

use candle_core::{DType, Device, Tensor, D};

use crate::{Error, Result};

/// Default frequency base.
pub const ROPE_BASE: f64 = 10000.0;

/// Pre-computed rotary embedding tables.
pub struct RotaryEmbedding {
    /// `[max_tokens, head_dim / 2]`
    cos: Tensor,
    /// `[max_tokens, head_dim / 2]`
    sin: Tensor,
    max_tokens: usize,
}

impl RotaryEmbedding {
    /// Build the rotation tables for positions `0..max_tokens`.
    pub fn new(head_dim: usize, max_tokens: usize, base: f64, device: &Device) -> Result<Self> {
        let half_dim = head_dim / 2;

        // theta_i = base^(-2i / head_dim) for i in 0..half_dim
        let theta: Vec<f64> = (0..half_dim)
            .map(|i| base.powf(-2.0 * i as f64 / head_dim as f64))
            .collect();
        let theta = Tensor::from_vec(theta, (1, half_dim), device)?;

        let positions: Vec<f64> = (0..max_tokens).map(|p| p as f64).collect();
        let positions = Tensor::from_vec(positions, (max_tokens, 1), device)?;

        // angles = outer(positions, theta) → [max_tokens, half_dim]
        let angles = positions.matmul(&theta)?;

        Ok(Self {
            cos: angles.cos()?.to_dtype(DType::F32)?,
            sin: angles.sin()?.to_dtype(DType::F32)?,
            max_tokens,
        })
    }

    /// Maximum position the tables cover.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Rotate `x` of shape `[B, H, T, D]` as if its time axis starts at
    /// absolute position `offset`.
    ///
    /// Rotation is applied in f32 regardless of the input dtype; the result
    /// is cast back.
    pub fn apply(&self, x: &Tensor, offset: usize) -> Result<Tensor> {
        let (batch, heads, time, dim) = x.dims4()?;
        if offset + time > self.max_tokens {
            return Err(Error::precondition(format!(
                "rope offset {offset} + time {time} exceeds max tokens {}",
                self.max_tokens
            )));
        }

        let x_dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?.contiguous()?;

        // Split into interleaved pairs: [B, H, T, D/2, 2]
        let pairs = x.reshape((batch, heads, time, dim / 2, 2))?;
        let x0 = pairs.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?;
        let x1 = pairs.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?;

        // Table rows for the absolute positions, broadcast over [B, H].
        let cos = self
            .cos
            .narrow(0, offset, time)?
            .reshape((1, 1, time, dim / 2))?;
        let sin = self
            .sin
            .narrow(0, offset, time)?
            .reshape((1, 1, time, dim / 2))?;

        // (x0, x1) → (x0·cos − x1·sin, x0·sin + x1·cos)
        let r0 = (x0.broadcast_mul(&cos)? - x1.broadcast_mul(&sin)?)?;
        let r1 = (x0.broadcast_mul(&sin)? + x1.broadcast_mul(&cos)?)?;

        let out = Tensor::stack(&[&r0, &r1], D::Minus1)?.reshape((batch, heads, time, dim))?;
        out.to_dtype(x_dtype).map_err(Into::into)
    }
}
