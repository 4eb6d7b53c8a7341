//! Additive attention-mask construction.
//!
//! Masks are additive biases: 0.0 for visible positions, a large negative
//! value for masked ones, broadcastable against `[B, H, S, S]` attention
//! scores.

use candle_core::{DType, Tensor};

use crate::Result;

/// Large negative value standing in for -inf; finite so that fully masked
/// rows still softmax without producing NaNs.
pub fn mask_min(dtype: DType) -> f64 {
    match dtype {
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// Turn a key-padding mask `[B, S]` (1 = valid, 0 = padding) into an
/// additive bias `[B, 1, 1, S]` that hides padded keys from every query.
pub fn key_padding_bias(valid_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let mask = valid_mask.to_dtype(DType::F32)?;
    // (mask - 1) * |min|: 0 where valid, min where padded.
    let bias = ((mask - 1.0)? * mask_min(dtype).abs())?;
    Ok(bias.unsqueeze(1)?.unsqueeze(1)?.to_dtype(dtype)?)
}

/// Lift a 2-D additive mask `[S, S]` to the 4-D broadcast layout
/// `[1, 1, S, S]`.
pub fn lift_attn_mask(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    Ok(mask.unsqueeze(0)?.unsqueeze(0)?.to_dtype(dtype)?)
}
