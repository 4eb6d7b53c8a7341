//! Positional embeddings for the refinement stack.
//!
//! Two interchangeable strategies:
//! - [`LearnedPositionEmbedding`] — a flat trainable table over the whole
//!   token sequence; the main path.
//! - [`PositionEmbeddingSine`] — the standard sinusoidal spatial embedding
//!   generalized to images, computed per scale grid and concatenated in
//!   pyramid order.

use std::f64::consts::PI;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::{Error, Result};

/// Flat learned position table `[total_tokens, dim_embd]`, zero-initialized.
pub struct LearnedPositionEmbedding {
    weight: Tensor,
}

impl LearnedPositionEmbedding {
    pub fn new(total_tokens: usize, dim_embd: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (total_tokens, dim_embd),
            "weight",
            candle_nn::Init::Const(0.0),
        )?;
        Ok(Self { weight })
    }

    /// Position bias `[1, total_tokens, dim_embd]`, broadcast over the batch
    /// by the attention layers.
    pub fn forward(&self) -> Result<Tensor> {
        Ok(self.weight.unsqueeze(0)?)
    }
}

/// Sinusoidal spatial position embedding.
///
/// For a spatial grid with a validity mask, cumulative valid-pixel counts
/// along each axis give unnormalized positions; sine/cosine pairs at
/// geometrically spaced frequencies encode them, y-axis channels first.
pub struct PositionEmbeddingSine {
    num_pos_feats: usize,
    temperature: f64,
    normalize: bool,
    scale: f64,
}

impl PositionEmbeddingSine {
    /// `scale` may only be overridden when `normalize` is on — positions are
    /// otherwise unbounded and the override would be meaningless.
    pub fn new(
        num_pos_feats: usize,
        temperature: f64,
        normalize: bool,
        scale: Option<f64>,
    ) -> Result<Self> {
        if scale.is_some() && !normalize {
            return Err(Error::Config(
                "position scale override requires normalize=true".into(),
            ));
        }
        if num_pos_feats % 2 != 0 {
            return Err(Error::Config(format!(
                "num_pos_feats must be even for sin/cos pairing, got {num_pos_feats}"
            )));
        }
        Ok(Self {
            num_pos_feats,
            temperature,
            normalize,
            scale: scale.unwrap_or(2.0 * PI),
        })
    }

    /// Embed a validity mask `[B, H, W]` (1 = valid) into
    /// `[B, 2·num_pos_feats, H, W]`.
    pub fn forward(&self, valid_mask: &Tensor) -> Result<Tensor> {
        let (_b, h, w) = valid_mask.dims3()?;
        let mask = valid_mask.to_dtype(DType::F32)?;
        let mut y_embed = mask.cumsum(1)?;
        let mut x_embed = mask.cumsum(2)?;
        if self.normalize {
            let eps = 1e-6;
            let y_last = y_embed.narrow(1, h - 1, 1)?; // [B, 1, W]
            let x_last = x_embed.narrow(2, w - 1, 1)?; // [B, H, 1]
            y_embed = (y_embed.broadcast_div(&(y_last + eps)?)? * self.scale)?;
            x_embed = (x_embed.broadcast_div(&(x_last + eps)?)? * self.scale)?;
        }

        // Half the features carry sine, half cosine, at frequencies
        // temperature^(2k / num_pos_feats).
        let half = self.num_pos_feats / 2;
        let freqs: Vec<f32> = (0..half)
            .map(|k| {
                self.temperature
                    .powf(2.0 * k as f64 / self.num_pos_feats as f64) as f32
            })
            .collect();
        let dim_t = Tensor::from_vec(freqs, half, valid_mask.device())?;

        let pos_y = self.interleaved(&y_embed, &dim_t)?; // [B, H, W, F]
        let pos_x = self.interleaved(&x_embed, &dim_t)?;
        let pos = Tensor::cat(&[&pos_y, &pos_x], 3)?; // [B, H, W, 2F]
        Ok(pos.permute((0, 3, 1, 2))?.contiguous()?)
    }

    /// All-valid convenience: embed a bare `(batch, h, w)` grid.
    pub fn forward_shape(
        &self,
        batch: usize,
        h: usize,
        w: usize,
        device: &Device,
    ) -> Result<Tensor> {
        let ones = Tensor::ones((batch, h, w), DType::F32, device)?;
        self.forward(&ones)
    }

    /// `[B, H, W]` positions → `[B, H, W, num_pos_feats]` with sin/cos
    /// interleaved per frequency (sin on even channels, cos on odd).
    fn interleaved(&self, embed: &Tensor, dim_t: &Tensor) -> Result<Tensor> {
        let scaled = embed.unsqueeze(3)?.broadcast_div(dim_t)?; // [B, H, W, F/2]
        let sin = scaled.sin()?;
        let cos = scaled.cos()?;
        let pair = Tensor::stack(&[&sin, &cos], 4)?; // [B, H, W, F/2, 2]
        Ok(pair.flatten(3, 4)?)
    }
}
