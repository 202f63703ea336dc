//! Causal attention mask.
//!
//! A single additive `[token_count, token_count]` lower-triangular mask is
//! built once per model: 0.0 on and below the diagonal, dtype-min above.
//! Incremental decoding slices the sub-rectangle
//! `[offset .. offset + new, 0 .. total]` so a new token attends to the
//! full cached history but never to the future.

use candle_core::{DType, Device, Tensor};

use crate::Result;

/// Build the full additive causal mask for sequences up to `token_count`.
pub fn causal_mask(token_count: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let min_val = match dtype {
        DType::F32 => f64::from(f32::MIN),
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    };

    let mut mask_data = vec![0.0f64; token_count * token_count];
    for i in 0..token_count {
        for j in (i + 1)..token_count {
            mask_data[i * token_count + j] = min_val;
        }
    }

    let mask = Tensor::from_vec(mask_data, (token_count, token_count), device)?.to_dtype(dtype)?;
    Ok(mask)
}
