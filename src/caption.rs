//! Caption tokenization.
//!
//! Captions are encoded as raw UTF-8 bytes, one token per byte, offset past
//! the image codebook so the two vocabularies never collide. The caption
//! field has a fixed width: longer captions are truncated, shorter ones
//! padded with raw token 0 — the same token the all-zero unconditional
//! guidance row is made of, so an empty caption and that row coincide.

use candle_core::{Device, Tensor};

use crate::{ModelConfig, Result};

/// Encode `caption` into exactly `config.caption_bytes` byte tokens.
pub fn caption_tokens(caption: &str, config: &ModelConfig) -> Vec<u32> {
    let offset = config.codebook_size as u32;
    let mut tokens: Vec<u32> = caption
        .bytes()
        .take(config.caption_bytes)
        .map(|b| offset + b as u32)
        .collect();
    tokens.resize(config.caption_bytes, 0);
    tokens
}

/// Encode `caption` as a `[1, caption_bytes]` prefix tensor.
pub fn caption_tensor(caption: &str, config: &ModelConfig, device: &Device) -> Result<Tensor> {
    let tokens = caption_tokens(caption, config);
    Tensor::from_vec(tokens, (1, config.caption_bytes), device).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig {
            caption_bytes: 8,
            ..Default::default()
        }
    }

    #[test]
    fn bytes_are_offset_past_the_codebook() {
        let config = config();
        let tokens = caption_tokens("ab", &config);
        let offset = config.codebook_size as u32;
        assert_eq!(tokens[0], offset + b'a' as u32);
        assert_eq!(tokens[1], offset + b'b' as u32);
    }

    #[test]
    fn short_captions_are_zero_padded() {
        let config = config();
        let tokens = caption_tokens("hi", &config);
        assert_eq!(tokens.len(), 8);
        assert!(tokens[2..].iter().all(|t| *t == 0));
    }

    #[test]
    fn empty_caption_matches_the_unconditional_row() {
        // The guidance path duplicates the prefix as all zeros; an empty
        // caption must encode to exactly that row.
        let config = config();
        assert_eq!(caption_tokens("", &config), vec![0; 8]);
    }

    #[test]
    fn long_captions_are_truncated() {
        let config = config();
        let tokens = caption_tokens("a caption longer than the field", &config);
        assert_eq!(tokens.len(), 8);
    }

    #[test]
    fn truncation_counts_bytes_not_chars() {
        let config = config();
        // 'é' is two UTF-8 bytes; four of them fill the 8-byte field.
        let tokens = caption_tokens("éééééé", &config);
        assert_eq!(tokens.len(), 8);
        let offset = config.codebook_size as u32;
        assert!(tokens.iter().all(|t| *t > offset));
    }

    #[test]
    fn tensor_shape_matches_the_field() {
        let config = config();
        let t = caption_tensor("hello", &config, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 8]);
    }
}
