//! Self-attention layer of the refinement stack.
//!
//! Pre-norm transformer layer: the position bias is added to queries and
//! keys only, values come from the normalized sequence, and a two-layer
//! feed-forward block with a 2× expansion follows. Attention is fully
//! bidirectional.

use candle_core::{Module, Tensor};
use candle_nn::{Activation, Dropout, LayerNorm, VarBuilder};

use super::attention::MultiHeadSelfAttention;
use crate::{Error, Result};

/// Resolve a feed-forward nonlinearity by name.
///
/// Unsupported names are a configuration error, surfaced before any weights
/// are created.
pub fn activation_from_name(name: &str) -> Result<Activation> {
    match name {
        "relu" => Ok(Activation::Relu),
        "gelu" => Ok(Activation::Gelu),
        other => Err(Error::Config(format!(
            "activation should be relu/gelu, not {other}"
        ))),
    }
}

pub struct SelfAttentionLayer {
    self_attn: MultiHeadSelfAttention,
    linear1: candle_nn::Linear,
    linear2: candle_nn::Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
    activation: Activation,
    dropout: Dropout,
}

impl SelfAttentionLayer {
    pub fn new(
        dim_embd: usize,
        n_head: usize,
        dim_mlp: usize,
        dropout: f32,
        activation: &str,
        vb: VarBuilder,
    ) -> Result<Self> {
        let activation = activation_from_name(activation)?;
        if dim_embd % n_head != 0 {
            return Err(Error::Config(format!(
                "dim_embd ({dim_embd}) must be divisible by n_head ({n_head})"
            )));
        }
        Ok(Self {
            self_attn: MultiHeadSelfAttention::new(dim_embd, n_head, vb.pp("self_attn"))?,
            linear1: candle_nn::linear(dim_embd, dim_mlp, vb.pp("linear1"))?,
            linear2: candle_nn::linear(dim_mlp, dim_embd, vb.pp("linear2"))?,
            norm1: candle_nn::layer_norm(dim_embd, 1e-5, vb.pp("norm1"))?,
            norm2: candle_nn::layer_norm(dim_embd, 1e-5, vb.pp("norm2"))?,
            activation,
            dropout: Dropout::new(dropout),
        })
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, S, D]`
    /// - `pos`: optional position bias, broadcastable to `[B, S, D]`; added
    ///   to queries and keys only
    /// - `attn_mask`: optional additive mask `[S, S]`
    /// - `key_padding_mask`: optional `[B, S]` (1 = valid)
    /// - `train`: enables stochastic dropout (inference passes false)
    pub fn forward(
        &self,
        x: &Tensor,
        pos: Option<&Tensor>,
        attn_mask: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        // Self-attention with residual.
        let normed = self.norm1.forward(x)?;
        let qk = match pos {
            Some(pos) => normed.broadcast_add(pos)?,
            None => normed.clone(),
        };
        let attn = self
            .self_attn
            .forward(&qk, &qk, &normed, attn_mask, key_padding_mask)?;
        let attn = self.dropout.forward(&attn, train)?;
        let x = (x + attn)?;

        // Feed-forward with residual.
        let normed = self.norm2.forward(&x)?;
        let h = self.linear1.forward(&normed)?;
        let h = h.apply(&self.activation)?;
        let h = self.dropout.forward(&h, train)?;
        let h = self.linear2.forward(&h)?;
        let h = self.dropout.forward(&h, train)?;
        Ok((x + h)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn layer_preserves_shape() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let layer = SelfAttentionLayer::new(32, 4, 64, 0.0, "gelu", vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 21, 32), &dev).unwrap();
        let pos = Tensor::randn(0f32, 1.0, (1, 21, 32), &dev).unwrap();
        let y = layer.forward(&x, Some(&pos), None, None, false).unwrap();
        assert_eq!(y.dims(), &[2, 21, 32]);
    }

    #[test]
    fn unknown_activation_is_config_error() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let err = SelfAttentionLayer::new(32, 4, 64, 0.0, "swish", vb);
        assert!(matches!(err, Err(crate::Error::Config(_))));
    }

    #[test]
    fn zero_dropout_forward_is_deterministic() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let layer = SelfAttentionLayer::new(16, 2, 32, 0.0, "relu", vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 5, 16), &dev).unwrap();
        let a: Vec<f32> = layer
            .forward(&x, None, None, None, false)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = layer
            .forward(&x, None, None, None, false)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }
}
