//! The code-refinement transformer.
//!
//! A stack of bidirectional pre-norm self-attention layers that jointly
//! refines the concatenated pyramid token embeddings, with a shared position
//! bias injected at every layer.
//!
//! - [`attention`] — multi-head scaled dot-product self-attention
//! - [`layers`] — one pre-norm layer (attention + GELU MLP)
//! - [`mask`] — additive attention/key-padding mask helpers
//! - [`position`] — learned and sinusoidal position-embedding strategies

pub mod attention;
pub mod layers;
pub mod mask;
pub mod position;

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::{CodeFormerConfig, PositionKind};
use crate::Result;
use layers::SelfAttentionLayer;
use position::{LearnedPositionEmbedding, PositionEmbeddingSine};

/// The full refinement stack: `n_layers` identical self-attention layers.
pub struct RefinementStack {
    layers: Vec<SelfAttentionLayer>,
}

impl RefinementStack {
    pub fn new(cfg: &CodeFormerConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(cfg.n_layers);
        for i in 0..cfg.n_layers {
            layers.push(SelfAttentionLayer::new(
                cfg.dim_embd,
                cfg.n_head,
                cfg.dim_mlp(),
                cfg.dropout,
                &cfg.activation,
                vb.pp(format!("layers.{i}")),
            )?);
        }
        Ok(Self { layers })
    }

    /// Run the whole stack, injecting the same position bias at every layer.
    pub fn forward(
        &self,
        x: &Tensor,
        pos: Option<&Tensor>,
        attn_mask: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let mut h = x.clone();
        for layer in &self.layers {
            h = layer.forward(&h, pos, attn_mask, key_padding_mask, train)?;
        }
        Ok(h)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

/// Position-bias strategy over the pyramid sequence.
///
/// Both variants produce a bias broadcastable to `[B, total_tokens,
/// dim_embd]`; the learned table is the main path, the sine variant derives
/// the bias from each scale's spatial grid.
pub enum PositionStrategy {
    Learned(LearnedPositionEmbedding),
    Sine(PositionEmbeddingSine),
}

impl PositionStrategy {
    pub fn new(cfg: &CodeFormerConfig, vb: VarBuilder) -> Result<Self> {
        match cfg.position {
            PositionKind::Learned => Ok(Self::Learned(LearnedPositionEmbedding::new(
                cfg.total_tokens(),
                cfg.dim_embd,
                vb,
            )?)),
            PositionKind::Sine => Ok(Self::Sine(PositionEmbeddingSine::new(
                cfg.dim_embd / 2,
                10_000.0,
                true,
                None,
            )?)),
        }
    }

    /// Whether this strategy carries trainable parameters.
    pub fn is_trainable(&self) -> bool {
        matches!(self, Self::Learned(_))
    }

    /// Position bias for the concatenated pyramid sequence.
    ///
    /// Learned: `[1, total_tokens, dim_embd]`. Sine: per-scale grids
    /// embedded and concatenated in pyramid order, `[1, total_tokens,
    /// dim_embd]`.
    pub fn sequence_bias(&self, scales: &[(usize, usize)], device: &Device) -> Result<Tensor> {
        match self {
            Self::Learned(learned) => learned.forward(),
            Self::Sine(sine) => {
                let mut parts = Vec::with_capacity(scales.len());
                for &(ph, pw) in scales {
                    let grid = sine.forward_shape(1, ph, pw, device)?; // [1, D, ph, pw]
                    let d = grid.dim(1)?;
                    parts.push(grid.reshape((1, d, ph * pw))?.transpose(1, 2)?);
                }
                Ok(Tensor::cat(&parts, 1)?.contiguous()?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    fn small_cfg() -> CodeFormerConfig {
        CodeFormerConfig {
            dim_embd: 32,
            n_head: 4,
            n_layers: 2,
            codebook_size: 64,
            vqvae: crate::config::VqvaeConfig {
                vocab_size: 64,
                scales: vec![(1, 1), (2, 2), (4, 4)],
                ..crate::config::VqvaeConfig::default()
            },
            ..CodeFormerConfig::default()
        }
    }

    #[test]
    fn stack_preserves_shape() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let cfg = small_cfg();
        let stack = RefinementStack::new(&cfg, vb).unwrap();
        assert_eq!(stack.num_layers(), 2);
        let x = Tensor::randn(0f32, 1.0, (2, 21, 32), &dev).unwrap();
        let y = stack.forward(&x, None, None, None, false).unwrap();
        assert_eq!(y.dims(), &[2, 21, 32]);
    }

    #[test]
    fn sine_strategy_covers_the_pyramid() {
        let dev = Device::Cpu;
        let cfg = CodeFormerConfig {
            position: PositionKind::Sine,
            ..small_cfg()
        };
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let strategy = PositionStrategy::new(&cfg, vb).unwrap();
        assert!(!strategy.is_trainable());
        let bias = strategy
            .sequence_bias(&cfg.vqvae.scales, &dev)
            .unwrap();
        assert_eq!(bias.dims(), &[1, 21, 32]);
    }

    #[test]
    fn learned_strategy_matches_sequence() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let cfg = small_cfg();
        let strategy = PositionStrategy::new(&cfg, vb).unwrap();
        assert!(strategy.is_trainable());
        let bias = strategy
            .sequence_bias(&cfg.vqvae.scales, &dev)
            .unwrap();
        assert_eq!(bias.dims(), &[1, 21, 32]);
    }
}
