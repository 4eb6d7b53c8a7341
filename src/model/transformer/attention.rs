//! Multi-head self-attention for the refinement stack.
//!
//! Standard scaled dot-product attention, fully bidirectional. Queries and
//! keys arrive separately from values so the caller can add a position bias
//! to q/k while leaving the values untouched.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::mask::{key_padding_bias, lift_attn_mask};
use crate::Result;

pub struct MultiHeadSelfAttention {
    q_proj: candle_nn::Linear,
    k_proj: candle_nn::Linear,
    v_proj: candle_nn::Linear,
    out_proj: candle_nn::Linear,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadSelfAttention {
    pub fn new(dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let q_proj = candle_nn::linear(dim, dim, vb.pp("q_proj"))?;
        let k_proj = candle_nn::linear(dim, dim, vb.pp("k_proj"))?;
        let v_proj = candle_nn::linear(dim, dim, vb.pp("v_proj"))?;
        let out_proj = candle_nn::linear(dim, dim, vb.pp("out_proj"))?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads,
            head_dim: dim / num_heads,
        })
    }

    /// Forward pass.
    ///
    /// - `queries`, `keys`: `[B, S, D]` — typically the normalized sequence
    ///   plus a position bias
    /// - `values`: `[B, S, D]` — the normalized sequence without the bias
    /// - `attn_mask`: optional additive mask `[S, S]`
    /// - `key_padding_mask`: optional `[B, S]` (1 = valid, 0 = padding)
    ///
    /// Returns `[B, S, D]`.
    pub fn forward(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        values: &Tensor,
        attn_mask: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch, seq_len, _dim) = queries.dims3()?;

        let split_heads = |x: &Tensor| -> Result<Tensor> {
            Ok(x
                .reshape((batch, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split_heads(&self.q_proj.forward(queries)?)?;
        let k = split_heads(&self.k_proj.forward(keys)?)?;
        let v = split_heads(&self.v_proj.forward(values)?)?;

        let scale = (self.head_dim as f64).powf(-0.5);
        let mut scores = (q.matmul(&k.transpose(2, 3)?)? * scale)?; // [B, H, S, S]

        if let Some(mask) = attn_mask {
            let bias = lift_attn_mask(mask, scores.dtype())?;
            scores = scores.broadcast_add(&bias)?;
        }
        if let Some(valid) = key_padding_mask {
            let bias = key_padding_bias(valid, scores.dtype())?;
            scores = scores.broadcast_add(&bias)?;
        }

        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = weights.matmul(&v)?; // [B, H, S, Dh]
        let out = out
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        self.out_proj.forward(&out).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    fn attention(dev: &Device, dim: usize, heads: usize) -> MultiHeadSelfAttention {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        MultiHeadSelfAttention::new(dim, heads, vb).unwrap()
    }

    #[test]
    fn output_shape_matches_input() {
        let dev = Device::Cpu;
        let attn = attention(&dev, 32, 4);
        let x = Tensor::randn(0f32, 1.0, (2, 9, 32), &dev).unwrap();
        let y = attn.forward(&x, &x, &x, None, None).unwrap();
        assert_eq!(y.dims(), &[2, 9, 32]);
    }

    #[test]
    fn padded_keys_do_not_change_valid_output() {
        let dev = Device::Cpu;
        let attn = attention(&dev, 16, 2);

        // Same three valid tokens, second batch row padded to five.
        let x = Tensor::randn(0f32, 1.0, (1, 3, 16), &dev).unwrap();
        let pad = Tensor::randn(0f32, 1.0, (1, 2, 16), &dev).unwrap();
        let x_padded = Tensor::cat(&[&x, &pad], 1).unwrap();
        let valid = Tensor::new(&[[1f32, 1.0, 1.0, 0.0, 0.0]], &dev).unwrap();

        let y_short = attn.forward(&x, &x, &x, None, None).unwrap();
        let y_padded = attn
            .forward(&x_padded, &x_padded, &x_padded, None, Some(&valid))
            .unwrap();

        let a: Vec<f32> = y_short.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = y_padded
            .narrow(1, 0, 3)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5, "{x} vs {y}");
        }
    }

    #[test]
    fn additive_mask_blocks_attention() {
        let dev = Device::Cpu;
        let attn = attention(&dev, 16, 2);
        let x = Tensor::randn(0f32, 1.0, (1, 4, 16), &dev).unwrap();

        // Mask hiding the last key from every query = padding out the key.
        let mut mask = vec![0f32; 16];
        for row in 0..4 {
            mask[row * 4 + 3] = f32::MIN;
        }
        let attn_mask = Tensor::from_vec(mask, (4, 4), &dev).unwrap();
        let valid = Tensor::new(&[[1f32, 1.0, 1.0, 0.0]], &dev).unwrap();

        let via_mask = attn.forward(&x, &x, &x, Some(&attn_mask), None).unwrap();
        let via_padding = attn.forward(&x, &x, &x, None, Some(&valid)).unwrap();
        let a: Vec<f32> = via_mask.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = via_padding.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }
}
