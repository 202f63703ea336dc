//! pictoken-rs — autoregressive token generation for text-conditioned
//! image synthesis, built on [candle](https://github.com/huggingface/candle).
//!
//! A caption is encoded as a fixed-width byte-token prefix, a causal
//! transformer with rotary position embeddings continues it one grid token
//! at a time, and a separately-trained VQ-VAE decoder (behind the
//! [`model::ImageDecoder`] trait) turns the finished grid into pixels.
//!
//! ```text
//!  caption ──▶ byte tokens ─┐
//!                           ├─▶ Transformer ──▶ TokenStream ──▶ grid tokens
//!  CFG zero prefix ─────────┘    (KV cache,         │
//!                                 Gumbel-max,       ▼
//!                                 guidance)    ImageDecoder ──▶ image bytes
//! ```
//!
//! Generation is pull-based: [`model::Transformer::generate`] returns an
//! iterator the caller drives, so cancellation is just dropping it. The
//! [`manager::GenerationManager`] wraps this for the async daemon, running
//! each request on the blocking pool and streaming tokens over a channel.

pub mod caption;
pub mod config;
mod error;
pub mod manager;
pub mod model;
pub mod serve;

pub use config::ModelConfig;
pub use error::{Error, Result};
