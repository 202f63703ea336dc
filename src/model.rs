//! Model components: the causal transformer, token sampling, and the
//! decoder boundary.

pub mod decoder;
pub mod sampler;
pub mod transformer;

pub use decoder::ImageDecoder;
pub use sampler::{SampleOptions, TokenStream};
pub use transformer::Transformer;
