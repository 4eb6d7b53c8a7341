//! Multi-scale residual vector quantizer.
//!
//! Turns a continuous latent `[B, C, H, W]` into a pyramid of discrete code
//! indices, one tensor per configured scale. Quantization is residual: each
//! scale snaps a downsampled view of the remaining residual to its nearest
//! codebook entry, the dequantized contribution is upsampled, passed through
//! a shared refinement convolution and subtracted before the next scale.
//!
//! `quantize_to_indices` is the indices-only mode used by the code
//! predictor; [`MultiScaleQuantizer::reconstruct`] rebuilds the approximated
//! latent from a pyramid (predicted or ground-truth) for the decode path.

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

use crate::config::VqvaeConfig;
use crate::{Error, Result};

/// Residual-refinement convolution shared across scales: a 3×3 conv mixed
/// with its input at a fixed ratio.
#[derive(Debug, Clone)]
struct PhiConv {
    conv: Conv2d,
    ratio: f64,
}

impl PhiConv {
    fn new(channels: usize, ratio: f64, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(channels, channels, 3, cfg, vb.pp("conv"))?;
        Ok(Self { conv, ratio })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let refined = self.conv.forward(x)?;
        Ok(((x * (1.0 - self.ratio))? + (refined * self.ratio)?)?)
    }
}

pub struct MultiScaleQuantizer {
    /// Codebook weight `[vocab_size, z_channels]`.
    codebook: Tensor,
    phi: Vec<PhiConv>,
    scales: Vec<(usize, usize)>,
    vocab_size: usize,
}

impl MultiScaleQuantizer {
    pub fn new(cfg: &VqvaeConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let codebook = vb.get_with_hints(
            (cfg.vocab_size, cfg.z_channels),
            "codebook.weight",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let mut phi = Vec::with_capacity(cfg.share_quant_resi);
        for i in 0..cfg.share_quant_resi {
            phi.push(PhiConv::new(
                cfg.z_channels,
                cfg.quant_resi,
                vb.pp(format!("phi.{i}")),
            )?);
        }
        Ok(Self {
            codebook,
            phi,
            scales: cfg.scales.clone(),
            vocab_size: cfg.vocab_size,
        })
    }

    /// The configured scale list, in pyramid order.
    pub fn scales(&self) -> &[(usize, usize)] {
        &self.scales
    }

    /// Refinement conv assigned to scale `si`: the `share_quant_resi` convs
    /// are spread evenly over the pyramid.
    fn phi_for_scale(&self, si: usize) -> &PhiConv {
        let k = self.scales.len();
        let idx = if k <= 1 {
            0
        } else {
            (si * (self.phi.len() - 1) + (k - 1) / 2) / (k - 1)
        };
        &self.phi[idx.min(self.phi.len() - 1)]
    }

    /// Nearest codebook index for each row of `flat` `[N, C]` → `[N]` (u32).
    fn nearest_codes(&self, flat: &Tensor) -> Result<Tensor> {
        let n = flat.dim(0)?;
        // ‖f − e‖² = ‖f‖² − 2·f·eᵀ + ‖e‖², argmin over the vocabulary.
        let f2 = flat.sqr()?.sum_keepdim(1)?; // [N, 1]
        let e2 = self
            .codebook
            .sqr()?
            .sum_keepdim(1)?
            .reshape((1, self.vocab_size))?; // [1, V]
        let fe = flat.matmul(&self.codebook.t()?)?; // [N, V]
        let dist = (f2.broadcast_as((n, self.vocab_size))?
            + e2.broadcast_as((n, self.vocab_size))?)?;
        let dist = (dist - (fe * 2.0)?)?;
        dist.argmin(1).map_err(Into::into)
    }

    /// Dequantize one scale's indices `[B, ph·pw]` to a feature map
    /// `[B, C, ph, pw]`.
    fn dequantize(&self, indices: &Tensor, ph: usize, pw: usize) -> Result<Tensor> {
        let (b, _l) = indices.dims2()?;
        let flat = indices.flatten_all()?;
        let values = self.codebook.index_select(&flat, 0)?; // [B·ph·pw, C]
        let c = values.dim(1)?;
        Ok(values
            .reshape((b, ph, pw, c))?
            .permute((0, 3, 1, 2))?
            .contiguous()?)
    }

    /// Indices-only quantization: the full residual pyramid, one `u32`
    /// tensor `[B, ph·pw]` per scale, in pyramid order.
    pub fn quantize_to_indices(&self, latent: &Tensor) -> Result<Vec<Tensor>> {
        let (b, c, h, w) = latent.dims4()?;
        let mut residual = latent.clone();
        let mut pyramid = Vec::with_capacity(self.scales.len());
        for (si, &(ph, pw)) in self.scales.iter().enumerate() {
            let z = resize_bilinear(&residual, ph, pw)?; // [B, C, ph, pw]
            let flat = z
                .permute((0, 2, 3, 1))?
                .contiguous()?
                .reshape((b * ph * pw, c))?;
            let indices = self.nearest_codes(&flat)?.reshape((b, ph * pw))?;

            let contribution = self.dequantize(&indices, ph, pw)?;
            let contribution = resize_bilinear(&contribution, h, w)?;
            let contribution = self.phi_for_scale(si).forward(&contribution)?;
            residual = (residual - contribution)?;
            pyramid.push(indices);
        }
        Ok(pyramid)
    }

    /// Rebuild the approximated latent from an index pyramid.
    pub fn reconstruct(&self, pyramid: &[Tensor]) -> Result<Tensor> {
        if pyramid.len() != self.scales.len() {
            return Err(Error::Config(format!(
                "pyramid has {} levels, quantizer is configured for {}",
                pyramid.len(),
                self.scales.len()
            )));
        }
        let (lh, lw) = *self.scales.last().expect("validated: scales non-empty");
        let mut fhat: Option<Tensor> = None;
        for (si, (indices, &(ph, pw))) in pyramid.iter().zip(self.scales.iter()).enumerate() {
            let contribution = self.dequantize(indices, ph, pw)?;
            let contribution = resize_bilinear(&contribution, lh, lw)?;
            let contribution = self.phi_for_scale(si).forward(&contribution)?;
            fhat = Some(match fhat {
                Some(acc) => (acc + contribution)?,
                None => contribution,
            });
        }
        fhat.ok_or_else(|| Error::Config("empty pyramid".into()))
    }
}

/// Deterministic bilinear resize expressed as two matrix products.
///
/// candle only ships nearest-neighbor upsampling, so the interpolation
/// weights are built explicitly: `y = W_h · x · W_wᵀ` with half-pixel
/// sample centers. Used for both down- and up-sampling inside the
/// quantizer's residual loop.
pub fn resize_bilinear(x: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    if (h, w) == (out_h, out_w) {
        return Ok(x.clone());
    }
    let wh = interp_matrix(out_h, h, x)?; // [out_h, h]
    let ww = interp_matrix(out_w, w, x)?; // [out_w, w]
    let flat = x.reshape((b * c, h, w))?;
    let rows = wh.broadcast_matmul(&flat)?; // [B·C, out_h, w]
    let out = rows.broadcast_matmul(&ww.t()?)?; // [B·C, out_h, out_w]
    Ok(out.reshape((b, c, out_h, out_w))?)
}

/// Interpolation weight matrix `[out_len, in_len]`, half-pixel centers,
/// edges clamped.
fn interp_matrix(out_len: usize, in_len: usize, like: &Tensor) -> Result<Tensor> {
    let mut weights = vec![0f32; out_len * in_len];
    let ratio = in_len as f64 / out_len as f64;
    for (i, row) in weights.chunks_mut(in_len).enumerate() {
        let src = ((i as f64 + 0.5) * ratio - 0.5).clamp(0.0, (in_len - 1) as f64);
        let lo = src.floor() as usize;
        let hi = (lo + 1).min(in_len - 1);
        let frac = (src - lo as f64) as f32;
        row[lo] += 1.0 - frac;
        row[hi] += frac;
    }
    let m = Tensor::from_vec(weights, (out_len, in_len), like.device())?;
    Ok(m.to_dtype(like.dtype())?)
}
