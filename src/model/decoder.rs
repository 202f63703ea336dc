//! Boundary to the image-token decoder.
//!
//! The generation stack stops at grid tokens; turning a full grid back
//! into pixels is the job of a separately-trained VQ-VAE decoder that
//! lives behind this trait.

use crate::Result;

/// Decodes a complete grid of codebook tokens into encoded image bytes.
pub trait ImageDecoder: Send + Sync {
    /// Number of grid tokens a full image holds.
    fn grid_tokens(&self) -> usize;

    /// Decode `tokens` (length [`Self::grid_tokens`], values inside the
    /// codebook) into an encoded image, e.g. a PNG.
    fn decode(&self, tokens: &[u32]) -> Result<Vec<u8>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Decoder stub that renders each token as one little-endian pair.
    pub struct EchoDecoder {
        pub grid: usize,
    }

    impl ImageDecoder for EchoDecoder {
        fn grid_tokens(&self) -> usize {
            self.grid
        }

        fn decode(&self, tokens: &[u32]) -> Result<Vec<u8>> {
            Ok(tokens
                .iter()
                .flat_map(|t| (*t as u16).to_le_bytes())
                .collect())
        }
    }
}
