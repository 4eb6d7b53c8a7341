//! The CodeFormer model — frozen VQVAE tokenizer + trainable code predictor.
//!
//! ## Forward pass
//!
//! ```text
//! image [B, 3, 256, 256]
//!   ─→ tokenizer encoder + quant conv          latent [B, 32, 16, 16]
//!   ─→ multi-scale quantizer (indices only)    pyramid of u32 [B, ph·pw]
//!   ─→ per-scale embedding bank, concatenated  tokens [B, 680, D]
//!   ─→ + position bias, N self-attention layers
//!   ─→ LayerNorm + Linear(no bias)             logits [B, 680, 4096]
//! ```
//!
//! The logits and the continuous latent are returned together; the
//! restoration path additionally argmaxes the logits back into a pyramid and
//! decodes it through the tokenizer's decoder.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, LayerNorm, VarBuilder, VarMap};

use crate::config::{CodeFormerConfig, RefinementKind};
use crate::model::fuse::{AdaIn, FeatureRefinement, FuseSftBlock};
use crate::model::transformer::{PositionStrategy, RefinementStack};
use crate::model::vqvae::Vqvae;
use crate::{weights, Error, Result};

/// Parameter groups of the full model, for the freezing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamGroup {
    Encoder,
    Decoder,
    Quantizer,
    QuantConv,
    PostQuantConv,
    TokenEmbedding,
    PositionEmbedding,
    RefinementStack,
    PredictionHead,
}

impl ParamGroup {
    pub const ALL: [ParamGroup; 9] = [
        ParamGroup::Encoder,
        ParamGroup::Decoder,
        ParamGroup::Quantizer,
        ParamGroup::QuantConv,
        ParamGroup::PostQuantConv,
        ParamGroup::TokenEmbedding,
        ParamGroup::PositionEmbedding,
        ParamGroup::RefinementStack,
        ParamGroup::PredictionHead,
    ];

    /// Whether this group belongs to the pretrained tokenizer.
    pub fn is_tokenizer(&self) -> bool {
        matches!(
            self,
            ParamGroup::Encoder
                | ParamGroup::Decoder
                | ParamGroup::Quantizer
                | ParamGroup::QuantConv
                | ParamGroup::PostQuantConv
        )
    }
}

/// Construction-time freezing table: which parameter groups are trainable.
///
/// The default freezes the whole tokenizer and trains only the code
/// predictor. The table is fixed for the model's lifetime.
#[derive(Debug, Clone)]
pub struct FreezePolicy {
    trainable: [bool; ParamGroup::ALL.len()],
}

impl Default for FreezePolicy {
    fn default() -> Self {
        let mut trainable = [false; ParamGroup::ALL.len()];
        for (slot, group) in trainable.iter_mut().zip(ParamGroup::ALL.iter()) {
            *slot = !group.is_tokenizer();
        }
        Self { trainable }
    }
}

impl FreezePolicy {
    pub fn is_trainable(&self, group: ParamGroup) -> bool {
        let idx = ParamGroup::ALL
            .iter()
            .position(|g| *g == group)
            .expect("ALL covers every group");
        self.trainable[idx]
    }

    pub fn trainable_groups(&self) -> Vec<ParamGroup> {
        ParamGroup::ALL
            .iter()
            .copied()
            .filter(|g| self.is_trainable(*g))
            .collect()
    }
}

/// Options accepted by the forward surfaces.
///
/// `w` and `adain` drive the restoration path's refinement plug-ins;
/// `code_only` skips decoding in [`CodeFormer::restore`]; the core
/// [`CodeFormer::predict_codes`] consumes only `detach_latent`.
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Blend weight for SFT fusion.
    pub w: f64,
    /// Detach the returned latent from the autograd graph.
    pub detach_latent: bool,
    /// Stop the restoration path after code prediction.
    pub code_only: bool,
    /// Force an AdaIN step in the restoration path.
    pub adain: bool,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            w: 0.0,
            detach_latent: true,
            code_only: false,
            adain: false,
        }
    }
}

/// Result of the core forward pass.
pub struct CodePrediction {
    /// `[B, total_tokens, codebook_size]` raw logits.
    pub logits: Tensor,
    /// `[B, z_channels, latent_h, latent_w]` continuous latent.
    pub latent: Tensor,
}

/// Result of the restoration pipeline.
pub struct Restoration {
    pub prediction: CodePrediction,
    /// Restored image batch; `None` when `code_only` was set.
    pub image: Option<Tensor>,
}

/// Per-scale embedding bank: one lookup table per pyramid level.
struct EmbeddingBank {
    tables: Vec<Embedding>,
}

impl EmbeddingBank {
    fn new(num_scales: usize, vocab: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let mut tables = Vec::with_capacity(num_scales);
        for i in 0..num_scales {
            tables.push(candle_nn::embedding(vocab, dim, vb.pp(format!("{i}")))?);
        }
        Ok(Self { tables })
    }

    /// Look up every level and concatenate in pyramid order:
    /// `[B, total_tokens, dim]`.
    fn embed_pyramid(&self, pyramid: &[Tensor]) -> Result<Tensor> {
        if pyramid.len() != self.tables.len() {
            return Err(Error::Config(format!(
                "pyramid has {} levels but the embedding bank has {} tables",
                pyramid.len(),
                self.tables.len()
            )));
        }
        let mut parts = Vec::with_capacity(pyramid.len());
        for (table, indices) in self.tables.iter().zip(pyramid.iter()) {
            parts.push(table.forward(indices)?);
        }
        Ok(Tensor::cat(&parts, 1)?)
    }
}

/// Index-prediction head: LayerNorm + bias-free projection to the codebook.
pub struct PredictionHead {
    norm: LayerNorm,
    proj: candle_nn::Linear,
}

impl PredictionHead {
    pub fn new(dim: usize, vocab: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm"))?,
            proj: candle_nn::linear_no_bias(dim, vocab, vb.pp("proj"))?,
        })
    }

    /// `[B, L, D]` → raw logits `[B, L, V]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.norm.forward(x)?;
        self.proj.forward(&h).map_err(Into::into)
    }
}

/// The full model.
pub struct CodeFormer {
    tokenizer: Vqvae,
    token_emb: EmbeddingBank,
    position: PositionStrategy,
    stack: RefinementStack,
    head: PredictionHead,
    fuse: Option<FuseSftBlock>,
    policy: FreezePolicy,
    config: CodeFormerConfig,
    device: Device,
}

impl CodeFormer {
    /// Build from two `VarBuilder`s: `tokenizer_vb` backs the frozen VQVAE
    /// (checkpoint-mapped or freshly initialized), `vb` backs every
    /// trainable group.
    pub fn new(
        config: &CodeFormerConfig,
        tokenizer_vb: VarBuilder,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        let device = vb.device().clone();
        let tokenizer = Vqvae::new(&config.vqvae, tokenizer_vb)?;
        let token_emb = EmbeddingBank::new(
            config.vqvae.scales.len(),
            config.codebook_size,
            config.dim_embd,
            vb.pp("token_emb"),
        )?;
        let position = PositionStrategy::new(config, vb.pp("position_emb"))?;
        let stack = RefinementStack::new(config, vb.pp("ft"))?;
        let head = PredictionHead::new(config.dim_embd, config.codebook_size, vb.pp("head"))?;
        let fuse = match config.refinement {
            RefinementKind::FuseSft => Some(FuseSftBlock::new(
                config.vqvae.z_channels,
                config.vqvae.z_channels,
                vb.pp("fuse"),
            )?),
            _ => None,
        };
        tracing::debug!(
            layers = config.n_layers,
            dim = config.dim_embd,
            tokens = config.total_tokens(),
            connect = ?config.connect_list,
            "built CodeFormer"
        );
        Ok(Self {
            tokenizer,
            token_emb,
            position,
            stack,
            head,
            fuse,
            policy: FreezePolicy::default(),
            config: config.clone(),
            device,
        })
    }

    /// Convenience constructor: trainable parameters go into `varmap`, the
    /// tokenizer is loaded from the configured checkpoint when present, or
    /// freshly initialized otherwise.
    pub fn from_varmap(
        config: &CodeFormerConfig,
        varmap: &VarMap,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer_vb = match &config.tokenizer_checkpoint {
            Some(path) => weights::load_safetensors(path, DType::F32, device)?,
            None => {
                // Fresh tokenizer init; its vars live in a private map that
                // is never handed to an optimizer.
                let frozen = VarMap::new();
                VarBuilder::from_varmap(&frozen, DType::F32, device)
            }
        };
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        Self::new(config, tokenizer_vb, vb)
    }

    pub fn config(&self) -> &CodeFormerConfig {
        &self.config
    }

    pub fn freeze_policy(&self) -> &FreezePolicy {
        &self.policy
    }

    pub fn tokenizer(&self) -> &Vqvae {
        &self.tokenizer
    }

    /// Core forward pass: image batch → (logits, latent).
    pub fn predict_codes(
        &self,
        images: &Tensor,
        opts: &ForwardOptions,
    ) -> Result<CodePrediction> {
        let latent = self.tokenizer.encode(images)?;
        let pyramid = self.tokenizer.quantize_to_indices(&latent)?;

        let tokens = self.token_emb.embed_pyramid(&pyramid)?;
        let pos = self
            .position
            .sequence_bias(&self.config.vqvae.scales, &self.device)?;
        let refined = self.stack.forward(&tokens, Some(&pos), None, None, false)?;
        let logits = self.head.forward(&refined)?;

        let latent = if opts.detach_latent {
            latent.detach()
        } else {
            latent
        };
        Ok(CodePrediction { logits, latent })
    }

    /// Split a flat `[B, total_tokens]` index tensor back into a pyramid.
    pub fn split_to_pyramid(&self, indices: &Tensor) -> Result<Vec<Tensor>> {
        let offsets = self.config.scale_offsets();
        let mut pyramid = Vec::with_capacity(offsets.len());
        for (&offset, &(ph, pw)) in offsets.iter().zip(self.config.vqvae.scales.iter()) {
            pyramid.push(indices.narrow(1, offset, ph * pw)?.contiguous()?);
        }
        Ok(pyramid)
    }

    /// Full restoration: predict codes, decode the argmax pyramid back to an
    /// image, with optional AdaIN / SFT-fusion refinement of the
    /// reconstructed latent.
    pub fn restore(&self, images: &Tensor, opts: &ForwardOptions) -> Result<Restoration> {
        let prediction = self.predict_codes(images, opts)?;
        if opts.code_only {
            return Ok(Restoration {
                prediction,
                image: None,
            });
        }

        let indices = prediction.logits.argmax(2)?; // [B, total_tokens]
        let pyramid = self.split_to_pyramid(&indices)?;
        let mut fhat = self.tokenizer.reconstruct(&pyramid)?;

        if opts.adain || self.config.refinement == RefinementKind::AdaIn {
            fhat = AdaIn.refine(&fhat, &prediction.latent, opts.w)?;
        }
        if let Some(fuse) = &self.fuse {
            fhat = fuse.refine(&fhat, &prediction.latent, opts.w)?;
        }

        let image = self.tokenizer.decode(&fhat)?;
        Ok(Restoration {
            prediction,
            image: Some(image),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PositionKind, VqvaeConfig};

    fn small_cfg() -> CodeFormerConfig {
        CodeFormerConfig {
            dim_embd: 32,
            n_head: 4,
            n_layers: 2,
            codebook_size: 64,
            vqvae: VqvaeConfig {
                vocab_size: 64,
                z_channels: 8,
                ch: 32,
                ch_mult: vec![1, 2],
                num_res_blocks: 1,
                scales: vec![(1, 1), (2, 2), (4, 4)],
                ..VqvaeConfig::default()
            },
            ..CodeFormerConfig::default()
        }
    }

    fn build(cfg: &CodeFormerConfig) -> (VarMap, CodeFormer) {
        let varmap = VarMap::new();
        let model = CodeFormer::from_varmap(cfg, &varmap, &Device::Cpu).unwrap();
        (varmap, model)
    }

    #[test]
    fn logits_and_latent_shapes() {
        let cfg = small_cfg();
        let (_varmap, model) = build(&cfg);
        let images = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &Device::Cpu).unwrap();
        let out = model
            .predict_codes(&images, &ForwardOptions::default())
            .unwrap();
        assert_eq!(out.logits.dims(), &[2, 21, 64]);
        assert_eq!(out.latent.dims(), &[2, 8, 4, 4]);
    }

    #[test]
    fn forward_is_deterministic() {
        let cfg = small_cfg();
        let (_varmap, model) = build(&cfg);
        let images = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), &Device::Cpu).unwrap();
        let opts = ForwardOptions::default();
        let a: Vec<f32> = model
            .predict_codes(&images, &opts)
            .unwrap()
            .logits
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = model
            .predict_codes(&images, &opts)
            .unwrap()
            .logits
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn pyramid_order_is_preserved_by_offsets() {
        let cfg = small_cfg();
        let (_varmap, model) = build(&cfg);
        let total = cfg.total_tokens();
        let flat = Tensor::arange(0u32, total as u32, &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap();
        let pyramid = model.split_to_pyramid(&flat).unwrap();
        assert_eq!(pyramid.len(), 3);
        // Each level is exactly the contiguous slice at its cumulative
        // offset.
        let first: Vec<u32> = pyramid[0].flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(first, vec![0]);
        let second: Vec<u32> = pyramid[1].flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(second, vec![1, 2, 3, 4]);
        let third: Vec<u32> = pyramid[2].flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(third, (5u32..21).collect::<Vec<_>>());
    }

    #[test]
    fn freezing_policy_trains_only_the_predictor() {
        let cfg = small_cfg();
        let (varmap, model) = build(&cfg);

        let policy = model.freeze_policy();
        for group in ParamGroup::ALL {
            assert_eq!(policy.is_trainable(group), !group.is_tokenizer());
        }

        // Every trainable var belongs to a predictor prefix; the tokenizer
        // registered nothing in the trainable map.
        let data = varmap.data().lock().unwrap();
        assert!(!data.is_empty());
        for name in data.keys() {
            assert!(
                name.starts_with("token_emb.")
                    || name.starts_with("position_emb.")
                    || name.starts_with("ft.")
                    || name.starts_with("head."),
                "unexpected trainable parameter: {name}"
            );
        }
    }

    #[test]
    fn restore_returns_image_batch() {
        let cfg = small_cfg();
        let (_varmap, model) = build(&cfg);
        let images = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), &Device::Cpu).unwrap();
        let out = model.restore(&images, &ForwardOptions::default()).unwrap();
        assert_eq!(out.image.unwrap().dims(), &[1, 3, 8, 8]);
    }

    #[test]
    fn code_only_skips_decoding() {
        let cfg = small_cfg();
        let (_varmap, model) = build(&cfg);
        let images = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), &Device::Cpu).unwrap();
        let opts = ForwardOptions {
            code_only: true,
            ..ForwardOptions::default()
        };
        let out = model.restore(&images, &opts).unwrap();
        assert!(out.image.is_none());
        assert_eq!(out.prediction.logits.dims(), &[1, 21, 64]);
    }

    #[test]
    fn sine_position_variant_runs() {
        let cfg = CodeFormerConfig {
            position: PositionKind::Sine,
            ..small_cfg()
        };
        let (_varmap, model) = build(&cfg);
        let images = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), &Device::Cpu).unwrap();
        let out = model
            .predict_codes(&images, &ForwardOptions::default())
            .unwrap();
        assert_eq!(out.logits.dims(), &[1, 21, 64]);
    }

    #[test]
    fn adain_refinement_variant_restores() {
        let cfg = CodeFormerConfig {
            refinement: RefinementKind::AdaIn,
            ..small_cfg()
        };
        let (_varmap, model) = build(&cfg);
        let images = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), &Device::Cpu).unwrap();
        let out = model.restore(&images, &ForwardOptions::default()).unwrap();
        assert_eq!(out.image.unwrap().dims(), &[1, 3, 8, 8]);
    }

    #[test]
    fn fuse_refinement_registers_trainable_fuse_block() {
        let cfg = CodeFormerConfig {
            refinement: RefinementKind::FuseSft,
            ..small_cfg()
        };
        let (varmap, model) = build(&cfg);
        let data = varmap.data().lock().unwrap();
        assert!(data.keys().any(|name| name.starts_with("fuse.")));
        drop(data);
        let images = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), &Device::Cpu).unwrap();
        let opts = ForwardOptions {
            w: 0.5,
            ..ForwardOptions::default()
        };
        let out = model.restore(&images, &opts).unwrap();
        assert_eq!(out.image.unwrap().dims(), &[1, 3, 8, 8]);
    }
}
