//! VQVAE encoder — image to continuous latent.
//!
//! ```text
//! [B, 3, 256, 256] ─→ conv_in(3, ch)
//!   ─→ per level: num_res_blocks × ResBlock, downsample ×2 between levels
//!   ─→ mid: ResBlock + AttnBlock + ResBlock
//!   ─→ GroupNorm + SiLU + conv_out(→ z_channels)          [B, 32, 16, 16]
//! ```

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, VarBuilder};

use super::blocks::{group_norm32, AttnBlock, Downsample, ResBlock};
use crate::config::VqvaeConfig;
use crate::Result;

struct DownLevel {
    blocks: Vec<ResBlock>,
    downsample: Option<Downsample>,
}

pub struct Encoder {
    conv_in: Conv2d,
    down: Vec<DownLevel>,
    mid_block1: ResBlock,
    mid_attn: AttnBlock,
    mid_block2: ResBlock,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Encoder {
    pub fn new(cfg: &VqvaeConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = candle_nn::conv2d(3, cfg.ch, 3, conv_cfg, vb.pp("conv_in"))?;

        let mut down = Vec::with_capacity(cfg.ch_mult.len());
        let mut block_in = cfg.ch;
        for (level, &mult) in cfg.ch_mult.iter().enumerate() {
            let block_out = cfg.ch * mult;
            let vb_level = vb.pp(format!("down.{level}"));
            let mut blocks = Vec::with_capacity(cfg.num_res_blocks);
            for i in 0..cfg.num_res_blocks {
                blocks.push(ResBlock::new(
                    block_in,
                    block_out,
                    vb_level.pp(format!("block.{i}")),
                )?);
                block_in = block_out;
            }
            let downsample = if level != cfg.ch_mult.len() - 1 {
                Some(Downsample::new(block_in, vb_level.pp("downsample"))?)
            } else {
                None
            };
            down.push(DownLevel { blocks, downsample });
        }

        let mid_block1 = ResBlock::new(block_in, block_in, vb.pp("mid.block_1"))?;
        let mid_attn = AttnBlock::new(block_in, vb.pp("mid.attn_1"))?;
        let mid_block2 = ResBlock::new(block_in, block_in, vb.pp("mid.block_2"))?;

        let norm_out = group_norm32(block_in, vb.pp("norm_out"))?;
        let conv_out = candle_nn::conv2d(block_in, cfg.z_channels, 3, conv_cfg, vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            down,
            mid_block1,
            mid_attn,
            mid_block2,
            norm_out,
            conv_out,
        })
    }

    /// `[B, 3, H, W]` → `[B, z_channels, H/f, W/f]`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = self.conv_in.forward(x)?;
        for level in &self.down {
            for block in &level.blocks {
                h = block.forward(&h)?;
            }
            if let Some(downsample) = &level.downsample {
                h = downsample.forward(&h)?;
            }
        }
        let h = self.mid_block1.forward(&h)?;
        let h = self.mid_attn.forward(&h)?;
        let h = self.mid_block2.forward(&h)?;
        let h = self.norm_out.forward(&h)?;
        let h = h.silu()?;
        self.conv_out.forward(&h).map_err(Into::into)
    }
}
