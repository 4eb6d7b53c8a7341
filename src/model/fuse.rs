//! Optional feature-refinement plug-ins for the restoration path.
//!
//! Both adjust the reconstructed latent using the degraded input's latent
//! as a reference, behind the shared [`FeatureRefinement`] capability:
//!
//! - [`AdaIn`] — adaptive instance normalization; transfers the degraded
//!   latent's per-channel mean/std onto the reconstruction (color and
//!   illumination consistency). Parameter-free.
//! - [`FuseSftBlock`] — learned SFT-style fusion: scale and shift maps
//!   predicted from the concatenated pair, blended with weight `w`.

use candle_core::{Module, Tensor};
use candle_nn::{Activation, Conv2d, Conv2dConfig, VarBuilder};

use super::vqvae::blocks::ResBlock;
use crate::Result;

/// A refinement step applied to the reconstructed latent before decoding.
pub trait FeatureRefinement {
    /// - `restored`: the reconstruction `[B, C, H, W]`
    /// - `degraded`: the low-quality input latent, same shape
    /// - `w`: blend weight in `[0, 1]`
    fn refine(&self, restored: &Tensor, degraded: &Tensor, w: f64) -> Result<Tensor>;
}

/// Per-channel spatial mean and std of a 4-D feature map.
pub fn calc_mean_std(feat: &Tensor, eps: f64) -> Result<(Tensor, Tensor)> {
    let (b, c, _h, _w) = feat.dims4()?;
    let flat = feat.reshape((b, c, ()))?;
    let mean = flat.mean_keepdim(2)?; // [B, C, 1]
    let centered = flat.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(2)?;
    let std = (var + eps)?.sqrt()?;
    Ok((mean.reshape((b, c, 1, 1))?, std.reshape((b, c, 1, 1))?))
}

/// Adaptive instance normalization: re-statistic `content` to match `style`.
pub fn adaptive_instance_normalization(content: &Tensor, style: &Tensor) -> Result<Tensor> {
    let (style_mean, style_std) = calc_mean_std(style, 1e-5)?;
    let (content_mean, content_std) = calc_mean_std(content, 1e-5)?;
    let normalized = content
        .broadcast_sub(&content_mean)?
        .broadcast_div(&content_std)?;
    Ok(normalized
        .broadcast_mul(&style_std)?
        .broadcast_add(&style_mean)?)
}

/// Stateless AdaIN refinement.
pub struct AdaIn;

impl FeatureRefinement for AdaIn {
    fn refine(&self, restored: &Tensor, degraded: &Tensor, _w: f64) -> Result<Tensor> {
        adaptive_instance_normalization(restored, degraded)
    }
}

fn conv_pair(in_ch: usize, out_ch: usize, vb: VarBuilder) -> Result<(Conv2d, Conv2d)> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    let first = candle_nn::conv2d(in_ch, out_ch, 3, cfg, vb.pp("0"))?;
    let second = candle_nn::conv2d(out_ch, out_ch, 3, cfg, vb.pp("2"))?;
    Ok((first, second))
}

/// Learned SFT fusion block.
///
/// The degraded and restored latents are concatenated and encoded by a
/// residual block; scale and shift maps predicted from that encoding
/// modulate the restored latent, and the modulation is blended back with
/// weight `w` (`w = 0` leaves the reconstruction untouched).
pub struct FuseSftBlock {
    encode_enc: ResBlock,
    scale: (Conv2d, Conv2d),
    shift: (Conv2d, Conv2d),
    leaky: Activation,
}

impl FuseSftBlock {
    pub fn new(in_ch: usize, out_ch: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            encode_enc: ResBlock::new(2 * in_ch, out_ch, vb.pp("encode_enc"))?,
            scale: conv_pair(in_ch, out_ch, vb.pp("scale"))?,
            shift: conv_pair(in_ch, out_ch, vb.pp("shift"))?,
            leaky: Activation::LeakyRelu(0.2),
        })
    }

    fn branch(&self, pair: &(Conv2d, Conv2d), x: &Tensor) -> Result<Tensor> {
        let h = pair.0.forward(x)?;
        let h = h.apply(&self.leaky)?;
        pair.1.forward(&h).map_err(Into::into)
    }
}

impl FeatureRefinement for FuseSftBlock {
    fn refine(&self, restored: &Tensor, degraded: &Tensor, w: f64) -> Result<Tensor> {
        let enc = self
            .encode_enc
            .forward(&Tensor::cat(&[degraded, restored], 1)?)?;
        let scale = self.branch(&self.scale, &enc)?;
        let shift = self.branch(&self.shift, &enc)?;
        let modulated = (restored.mul(&scale)? + shift)?;
        Ok((restored + (modulated * w)?)?)
    }
}
