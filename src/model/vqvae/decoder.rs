//! VQVAE decoder — approximated latent back to an image.
//!
//! Mirror of the encoder: conv_in from `z_channels`, mid block with
//! attention, then the resolution levels in reverse with 2× upsampling
//! between them.

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, VarBuilder};

use super::blocks::{group_norm32, AttnBlock, ResBlock, Upsample};
use crate::config::VqvaeConfig;
use crate::Result;

struct UpLevel {
    blocks: Vec<ResBlock>,
    upsample: Option<Upsample>,
}

pub struct Decoder {
    conv_in: Conv2d,
    mid_block1: ResBlock,
    mid_attn: AttnBlock,
    mid_block2: ResBlock,
    up: Vec<UpLevel>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Decoder {
    pub fn new(cfg: &VqvaeConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let mut block_in = cfg.ch * cfg.ch_mult.last().copied().unwrap_or(1);
        let conv_in = candle_nn::conv2d(cfg.z_channels, block_in, 3, conv_cfg, vb.pp("conv_in"))?;

        let mid_block1 = ResBlock::new(block_in, block_in, vb.pp("mid.block_1"))?;
        let mid_attn = AttnBlock::new(block_in, vb.pp("mid.attn_1"))?;
        let mid_block2 = ResBlock::new(block_in, block_in, vb.pp("mid.block_2"))?;

        // Levels run from the coarsest (latent) resolution back up; one extra
        // residual block per level on the decode side, VQGAN-style.
        let mut up = Vec::with_capacity(cfg.ch_mult.len());
        for (level, &mult) in cfg.ch_mult.iter().enumerate().rev() {
            let block_out = cfg.ch * mult;
            let vb_level = vb.pp(format!("up.{level}"));
            let mut blocks = Vec::with_capacity(cfg.num_res_blocks + 1);
            for i in 0..=cfg.num_res_blocks {
                blocks.push(ResBlock::new(
                    block_in,
                    block_out,
                    vb_level.pp(format!("block.{i}")),
                )?);
                block_in = block_out;
            }
            let upsample = if level != 0 {
                Some(Upsample::new(block_in, vb_level.pp("upsample"))?)
            } else {
                None
            };
            up.push(UpLevel { blocks, upsample });
        }

        let norm_out = group_norm32(block_in, vb.pp("norm_out"))?;
        let conv_out = candle_nn::conv2d(block_in, 3, 3, conv_cfg, vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            mid_block1,
            mid_attn,
            mid_block2,
            up,
            norm_out,
            conv_out,
        })
    }

    /// `[B, z_channels, h, w]` → `[B, 3, h·f, w·f]`
    pub fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let h = self.conv_in.forward(z)?;
        let h = self.mid_block1.forward(&h)?;
        let h = self.mid_attn.forward(&h)?;
        let mut h = self.mid_block2.forward(&h)?;
        for level in &self.up {
            for block in &level.blocks {
                h = block.forward(&h)?;
            }
            if let Some(upsample) = &level.upsample {
                h = upsample.forward(&h)?;
            }
        }
        let h = self.norm_out.forward(&h)?;
        let h = h.silu()?;
        self.conv_out.forward(&h).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;

    #[test]
    fn decoder_mirrors_encoder_factor() {
        let cfg = VqvaeConfig {
            z_channels: 8,
            ch: 32,
            ch_mult: vec![1, 2],
            num_res_blocks: 1,
            scales: vec![(1, 1), (2, 2), (4, 4)],
            ..VqvaeConfig::default()
        };
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let decoder = Decoder::new(&cfg, vb).unwrap();
        let z = Tensor::randn(0f32, 1.0, (2, 8, 4, 4), &dev).unwrap();
        let img = decoder.forward(&z).unwrap();
        assert_eq!(img.dims(), &[2, 3, 8, 8]);
    }
}
