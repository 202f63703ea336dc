//! Key/value cache for incremental decoding.
//!
//! One entry per transformer layer. Each entry accumulates the keys and
//! values of every position decoded so far, growing by exactly one step per
//! decoding iteration. A cache belongs to a single generation session and is
//! freed when that session's stream is dropped — it is never shared.
//!
//! Invariant: keys are rotated (and scaled) at their absolute position
//! *before* insertion. The cache stores finished keys and never re-rotates.

use candle_core::Tensor;

use crate::Result;

/// Per-layer accumulated key/value history, shape `[B, H, T, D]`.
#[derive(Default)]
pub struct KvCacheLayer {
    kv: Option<(Tensor, Tensor)>,
}

impl KvCacheLayer {
    /// Number of cached time steps.
    pub fn len(&self) -> usize {
        match &self.kv {
            Some((k, _)) => k.dims()[2],
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append freshly projected (already rotated) keys/values along the time
    /// axis and return the full accumulated history for this step.
    pub fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (k, v) = match self.kv.take() {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[&prev_k, k], 2)?,
                Tensor::cat(&[&prev_v, v], 2)?,
            ),
            None => (k.clone(), v.clone()),
        };
        self.kv = Some((k.clone(), v.clone()));
        Ok((k, v))
    }
}

/// Full-model cache: one [`KvCacheLayer`] per transformer block.
pub struct KvCache {
    layers: Vec<KvCacheLayer>,
}

impl KvCache {
    pub fn new(layer_count: usize) -> Self {
        Self {
            layers: (0..layer_count).map(|_| KvCacheLayer::default()).collect(),
        }
    }

    /// Number of cached time steps (identical across layers by construction).
    pub fn len(&self) -> usize {
        self.layers.first().map(KvCacheLayer::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn layer_mut(&mut self, index: usize) -> &mut KvCacheLayer {
        &mut self.layers[index]
    }
}
