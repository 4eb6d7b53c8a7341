//! Shared convolutional building blocks for the VQVAE encoder/decoder.
//!
//! GroupNorm(32) + SiLU throughout, VQGAN-style.

use candle_core::{Module, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, VarBuilder};

use crate::Result;

/// GroupNorm with 32 groups, the normalization used everywhere in this net.
pub fn group_norm32(channels: usize, vb: VarBuilder) -> Result<GroupNorm> {
    candle_nn::group_norm(32, channels, 1e-6, vb).map_err(Into::into)
}

fn conv3x3(in_ch: usize, out_ch: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    candle_nn::conv2d(in_ch, out_ch, 3, cfg, vb).map_err(Into::into)
}

/// Residual block: norm → SiLU → conv → norm → SiLU → conv, with a 1×1
/// shortcut when the channel count changes.
#[derive(Debug, Clone)]
pub struct ResBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    nin_shortcut: Option<Conv2d>,
}

impl ResBlock {
    pub fn new(in_ch: usize, out_ch: usize, vb: VarBuilder) -> Result<Self> {
        let norm1 = group_norm32(in_ch, vb.pp("norm1"))?;
        let conv1 = conv3x3(in_ch, out_ch, vb.pp("conv1"))?;
        let norm2 = group_norm32(out_ch, vb.pp("norm2"))?;
        let conv2 = conv3x3(out_ch, out_ch, vb.pp("conv2"))?;
        let nin_shortcut = if in_ch != out_ch {
            Some(candle_nn::conv2d(
                in_ch,
                out_ch,
                1,
                Default::default(),
                vb.pp("nin_shortcut"),
            )?)
        } else {
            None
        };
        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
            nin_shortcut,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.norm1.forward(x)?;
        let h = h.silu()?;
        let h = self.conv1.forward(&h)?;
        let h = self.norm2.forward(&h)?;
        let h = h.silu()?;
        let h = self.conv2.forward(&h)?;
        let residual = match &self.nin_shortcut {
            Some(conv) => conv.forward(x)?,
            None => x.clone(),
        };
        Ok((h + residual)?)
    }
}

/// Single-head spatial self-attention over the feature map (1×1 projections).
#[derive(Debug, Clone)]
pub struct AttnBlock {
    norm: GroupNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj_out: Conv2d,
}

impl AttnBlock {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv1x1 = |name: &str| -> Result<Conv2d> {
            candle_nn::conv2d(channels, channels, 1, Default::default(), vb.pp(name))
                .map_err(Into::into)
        };
        Ok(Self {
            norm: group_norm32(channels, vb.pp("norm"))?,
            q: conv1x1("q")?,
            k: conv1x1("k")?,
            v: conv1x1("v")?,
            proj_out: conv1x1("proj_out")?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        let hidden = self.norm.forward(x)?;
        let q = self.q.forward(&hidden)?;
        let k = self.k.forward(&hidden)?;
        let v = self.v.forward(&hidden)?;

        // [B, C, H, W] → [B, HW, C] / [B, C, HW]
        let q = q.reshape((b, c, h * w))?.transpose(1, 2)?.contiguous()?;
        let k = k.reshape((b, c, h * w))?;
        let v = v.reshape((b, c, h * w))?;

        let scale = (c as f64).powf(-0.5);
        let attn = (q.matmul(&k)? * scale)?; // [B, HW, HW]
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;

        // [B, C, HW] · [B, HW, HW]^T → [B, C, HW]
        let out = v.matmul(&attn.transpose(1, 2)?.contiguous()?)?;
        let out = out.reshape((b, c, h, w))?;
        let out = self.proj_out.forward(&out)?;
        Ok((x + out)?)
    }
}

/// Strided-conv downsampling with asymmetric (right/bottom) padding.
#[derive(Debug, Clone)]
pub struct Downsample {
    conv: Conv2d,
}

impl Downsample {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            stride: 2,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(channels, channels, 3, cfg, vb.pp("conv"))?;
        Ok(Self { conv })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // Pad right and bottom by one so a 3×3/stride-2 conv halves exactly.
        let x = x.pad_with_zeros(D::Minus1, 0, 1)?;
        let x = x.pad_with_zeros(D::Minus2, 0, 1)?;
        self.conv.forward(&x).map_err(Into::into)
    }
}

/// Nearest-neighbor 2× upsampling followed by a 3×3 conv.
#[derive(Debug, Clone)]
pub struct Upsample {
    conv: Conv2d,
}

impl Upsample {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv = conv3x3(channels, channels, vb.pp("conv"))?;
        Ok(Self { conv })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        let x = x.upsample_nearest2d(h * 2, w * 2)?;
        self.conv.forward(&x).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;

    #[test]
    fn res_block_changes_channels() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let block = ResBlock::new(32, 64, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 32, 8, 8), &dev).unwrap();
        let y = block.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 64, 8, 8]);
    }

    #[test]
    fn attn_block_preserves_shape() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let block = AttnBlock::new(32, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 32, 4, 4), &dev).unwrap();
        let y = block.forward(&x).unwrap();
        assert_eq!(y.dims(), x.dims());
    }

    #[test]
    fn down_and_up_sample() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let down = Downsample::new(32, vb.pp("down")).unwrap();
        let up = Upsample::new(32, vb.pp("up")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 32, 16, 16), &dev).unwrap();
        let d = down.forward(&x).unwrap();
        assert_eq!(d.dims(), &[1, 32, 8, 8]);
        let u = up.forward(&d).unwrap();
        assert_eq!(u.dims(), &[1, 32, 16, 16]);
    }
}
