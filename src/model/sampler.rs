//! Token sampling and streaming.
//!
//! [`Transformer::generate`] returns a [`TokenStream`] — a pull-based
//! iterator that advances the incremental forward pass one token per
//! `next()` call, so the caller drives the loop and can stop at any point.
//! Dropping the stream frees its KV cache. For cross-task cancellation
//! (e.g. a client hanging up on the daemon) an optional shared flag is
//! checked before each step commits to a forward pass.
//!
//! Sampling is Gumbel-max: `argmax(logits + g)` with `g = -ln(-ln(U))`
//! drawn per vocabulary entry, equivalent to multinomial sampling from
//! `softmax(logits)` without the normalization. With a classifier-free
//! guidance scale `s`, the batch is doubled (row 0 conditional, row 1 an
//! all-zero-token unconditional duplicate) and the logits combined as
//! `s·cond + (1−s)·uncond` before sampling; the sampled token is fed back
//! to both halves so their timelines stay in lockstep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor, D};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::transformer::cache::KvCache;
use super::transformer::Transformer;
use crate::{Error, Result};

/// Options for one generation run.
#[derive(Debug, Clone, Default)]
pub struct SampleOptions {
    /// Classifier-free guidance scale. `None` disables guidance;
    /// `Some(1.0)` is arithmetically identical to the conditional logits.
    pub cfg_scale: Option<f64>,
    /// Noise seed. `None` = random seed per run.
    pub seed: Option<u64>,
    /// Cooperative cancellation flag, checked before each step.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Transformer {
    /// Start a generation run from a `[1, prefix_len]` token prefix.
    ///
    /// Emits exactly `token_count − prefix_len` tokens unless cancelled or a
    /// step fails. The stream owns its KV cache; concurrent runs are
    /// independent.
    pub fn generate(&self, prefix: &Tensor, opts: SampleOptions) -> Result<TokenStream<'_>> {
        let (batch, prefix_len) = prefix.dims2()?;
        if batch != 1 {
            return Err(Error::precondition(format!(
                "generation prefix must have batch 1, got {batch}"
            )));
        }
        let token_count = self.config().token_count();
        if prefix_len == 0 || prefix_len > token_count {
            return Err(Error::precondition(format!(
                "prefix length {prefix_len} outside 1..={token_count}"
            )));
        }

        let prefix = prefix.to_dtype(DType::U32)?;
        // Guidance doubles the batch: row 0 conditional, row 1 the
        // zero-token (caption-free) unconditional duplicate.
        let prev = if opts.cfg_scale.is_some() {
            Tensor::cat(&[&prefix, &prefix.zeros_like()?], 0)?
        } else {
            prefix
        };

        let seed = opts.seed.unwrap_or_else(|| rand::rng().random());
        Ok(TokenStream {
            model: self,
            cache: self.new_cache(),
            prev,
            remaining: token_count - prefix_len,
            rng: ChaCha8Rng::seed_from_u64(seed),
            cfg_scale: opts.cfg_scale,
            cancel: opts.cancel,
            failed: false,
        })
    }

    /// Run a generation to completion and collect the tokens.
    pub fn sample(&self, prefix: &Tensor, opts: SampleOptions) -> Result<Vec<u32>> {
        self.generate(prefix, opts)?.collect()
    }
}

/// A live generation run. See [`Transformer::generate`].
pub struct TokenStream<'m> {
    model: &'m Transformer,
    cache: KvCache,
    /// `[B, T]` — the whole prefix on the first step, then `[B, 1]`.
    prev: Tensor,
    remaining: usize,
    rng: ChaCha8Rng,
    cfg_scale: Option<f64>,
    cancel: Option<Arc<AtomicBool>>,
    failed: bool,
}

impl TokenStream<'_> {
    /// Tokens still to be emitted on the non-cancelled path.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    fn step(&mut self) -> Result<u32> {
        let logits = self.model.forward_step(&self.prev, &mut self.cache)?;
        let time = logits.dims()[1];
        let logits = logits
            .narrow(1, time - 1, 1)?
            .squeeze(1)?
            .to_dtype(DType::F32)?;

        let guided = match self.cfg_scale {
            Some(scale) => {
                let cond = logits.narrow(0, 0, 1)?;
                let uncond = logits.narrow(0, 1, 1)?;
                // s·cond + (1−s)·uncond — exactly `cond` at s = 1.
                ((cond * scale)? + (uncond * (1.0 - scale))?)?
            }
            None => logits,
        };

        let (rows, vocab) = guided.dims2()?;
        let gumbel = gumbel_noise((rows, vocab), &mut self.rng, guided.device())?;
        let sampled = (guided + gumbel)?.argmax(D::Minus1)?;

        // The only point a step materializes device values; a failure here
        // terminates the stream without retracting emitted tokens.
        let token = sampled.to_vec1::<u32>()?[0];

        // Both guidance halves receive the same chosen token.
        let dup = if self.cfg_scale.is_some() { 2 } else { 1 };
        let device = self.prev.device().clone();
        self.prev = Tensor::from_vec(vec![token; dup], (dup, 1), &device)?;
        Ok(token)
    }
}

impl Iterator for TokenStream<'_> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        // Cancellation is checked before committing to the forward pass;
        // a started step always runs to completion.
        if let Some(cancel) = &self.cancel {
            if cancel.load(Ordering::Relaxed) {
                self.remaining = 0;
                return None;
            }
        }
        match self.step() {
            Ok(token) => {
                self.remaining -= 1;
                Some(Ok(token))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// i.i.d. Gumbel noise `-ln(-ln(U))`, `U` uniform in (0, 1), row-major.
fn gumbel_noise(
    shape: (usize, usize),
    rng: &mut ChaCha8Rng,
    device: &Device,
) -> Result<Tensor> {
    let (rows, cols) = shape;
    let mut noise = Vec::with_capacity(rows * cols);
    for _ in 0..rows * cols {
        let u: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
        noise.push((-(-u.ln()).ln()) as f32);
    }
    Tensor::from_vec(noise, shape, device).map_err(Into::into)
}
