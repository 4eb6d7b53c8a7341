//! Configuration for the CodeFormer code-prediction model.
//!
//! Two layers of configuration:
//! - [`VqvaeConfig`] — the frozen tokenizer (encoder + multi-scale quantizer
//!   + decoder). Its scale list fixes the token sequence layout end-to-end.
//! - [`CodeFormerConfig`] — the trainable index-prediction transformer built
//!   on top, plus pipeline options.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Optional feature-refinement strategy applied in the restoration path.
///
/// `None` reproduces the plain decode; the other variants wire in one of the
/// plug-ins from [`crate::model::fuse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RefinementKind {
    #[default]
    None,
    /// Adaptive instance normalization toward the low-quality latent.
    AdaIn,
    /// SFT-style scale/shift fusion with blend weight `w`.
    FuseSft,
}

/// Positional-embedding strategy for the refinement stack.
///
/// The two variants are interchangeable: both produce a per-position bias of
/// width `dim_embd` over the concatenated pyramid sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PositionKind {
    /// Flat learned table over the whole token sequence (the main path).
    #[default]
    Learned,
    /// Sinusoidal spatial embedding computed per scale grid.
    Sine,
}

/// VQVAE tokenizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VqvaeConfig {
    /// Codebook vocabulary size shared by all scales.
    pub vocab_size: usize,
    /// Latent channel count produced by the encoder.
    pub z_channels: usize,
    /// Base channel width of the encoder/decoder.
    pub ch: usize,
    /// Channel multiplier per resolution level. The number of levels also
    /// fixes the downsampling factor: 2^(levels - 1).
    pub ch_mult: Vec<usize>,
    /// Residual blocks per resolution level.
    pub num_res_blocks: usize,
    /// Number of shared residual-refinement convolutions in the quantizer.
    pub share_quant_resi: usize,
    /// Mixing ratio of the refinement convolution output vs. its input.
    pub quant_resi: f64,
    /// Ordered scale list `(ph, pw)` — one pyramid level per entry. The last
    /// entry is the latent grid itself.
    pub scales: Vec<(usize, usize)>,
}

impl Default for VqvaeConfig {
    fn default() -> Self {
        Self {
            vocab_size: 4096,
            z_channels: 32,
            ch: 160,
            ch_mult: vec![1, 1, 2, 2, 4],
            num_res_blocks: 2,
            share_quant_resi: 4,
            quant_resi: 0.5,
            scales: [1usize, 2, 3, 4, 5, 6, 8, 10, 13, 16]
                .iter()
                .map(|&p| (p, p))
                .collect(),
        }
    }
}

impl VqvaeConfig {
    /// Total token sequence length: sum of ph·pw over all scales.
    pub fn total_tokens(&self) -> usize {
        self.scales.iter().map(|&(ph, pw)| ph * pw).sum()
    }

    /// Start offset of each scale's slice in the concatenated sequence.
    pub fn scale_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.scales.len());
        let mut acc = 0;
        for &(ph, pw) in &self.scales {
            offsets.push(acc);
            acc += ph * pw;
        }
        offsets
    }

    /// Spatial downsampling factor of the encoder.
    pub fn downsample_factor(&self) -> usize {
        1 << (self.ch_mult.len() - 1)
    }

    /// Latent grid size — the last (finest) scale.
    pub fn latent_size(&self) -> (usize, usize) {
        *self.scales.last().expect("validated: scales is non-empty")
    }

    /// Reject configurations that cannot produce a consistent pyramid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.scales.is_empty() {
            return Err(crate::Error::Config("scale list is empty".into()));
        }
        let (lh, lw) = self.latent_size();
        for &(ph, pw) in &self.scales {
            if ph == 0 || pw == 0 {
                return Err(crate::Error::Config(format!(
                    "scale ({ph}, {pw}) has a zero dimension"
                )));
            }
            if ph > lh || pw > lw {
                return Err(crate::Error::Config(format!(
                    "scale ({ph}, {pw}) exceeds the latent grid ({lh}, {lw})"
                )));
            }
        }
        if self.share_quant_resi == 0 {
            return Err(crate::Error::Config("share_quant_resi must be >= 1".into()));
        }
        Ok(())
    }
}

/// Top-level model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeFormerConfig {
    /// Token embedding dimension of the refinement stack.
    pub dim_embd: usize,
    /// Attention head count.
    pub n_head: usize,
    /// Number of self-attention layers.
    pub n_layers: usize,
    /// Codebook vocabulary size (must match the tokenizer's).
    pub codebook_size: usize,
    /// Attention / feed-forward dropout probability. Inactive at inference.
    pub dropout: f32,
    /// Feed-forward nonlinearity by name ("gelu" or "relu").
    pub activation: String,
    /// Positional-embedding strategy.
    pub position: PositionKind,
    /// Resolution labels for bookkeeping/display of connectable features.
    pub connect_list: Vec<String>,
    /// Refinement plug-in used by the restoration path.
    pub refinement: RefinementKind,
    /// Optional tokenizer checkpoint (safetensors).
    pub tokenizer_checkpoint: Option<PathBuf>,
    /// Tokenizer configuration.
    pub vqvae: VqvaeConfig,
}

impl Default for CodeFormerConfig {
    fn default() -> Self {
        Self {
            dim_embd: 640,
            n_head: 8,
            n_layers: 9,
            codebook_size: 4096,
            dropout: 0.0,
            activation: "gelu".to_string(),
            position: PositionKind::Learned,
            connect_list: vec!["32", "64", "128", "256"]
                .into_iter()
                .map(String::from)
                .collect(),
            refinement: RefinementKind::None,
            tokenizer_checkpoint: None,
            vqvae: VqvaeConfig::default(),
        }
    }
}

impl CodeFormerConfig {
    /// Feed-forward hidden width: 2× the embedding dimension.
    pub fn dim_mlp(&self) -> usize {
        self.dim_embd * 2
    }

    /// Total token sequence length of the pyramid.
    pub fn total_tokens(&self) -> usize {
        self.vqvae.total_tokens()
    }

    /// Start offset of each scale's slice in the concatenated sequence.
    pub fn scale_offsets(&self) -> Vec<usize> {
        self.vqvae.scale_offsets()
    }

    /// Reject inconsistent configurations before any weights are touched.
    pub fn validate(&self) -> crate::Result<()> {
        self.vqvae.validate()?;
        if self.dim_embd == 0 || self.n_head == 0 || self.n_layers == 0 {
            return Err(crate::Error::Config(
                "dim_embd, n_head and n_layers must all be >= 1".into(),
            ));
        }
        if self.dim_embd % self.n_head != 0 {
            return Err(crate::Error::Config(format!(
                "dim_embd ({}) must be divisible by n_head ({})",
                self.dim_embd, self.n_head
            )));
        }
        if self.position == PositionKind::Sine && self.dim_embd % 2 != 0 {
            return Err(crate::Error::Config(format!(
                "sine position embedding needs an even dim_embd, got {}",
                self.dim_embd
            )));
        }
        if self.codebook_size != self.vqvae.vocab_size {
            return Err(crate::Error::Config(format!(
                "codebook_size ({}) disagrees with tokenizer vocab_size ({})",
                self.codebook_size, self.vqvae.vocab_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = CodeFormerConfig::default();
        assert_eq!(cfg.dim_embd, 640);
        assert_eq!(cfg.n_head, 8);
        assert_eq!(cfg.n_layers, 9);
        assert_eq!(cfg.dim_mlp(), 1280);
        assert_eq!(cfg.total_tokens(), 680);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_scale_offsets_are_cumulative() {
        let cfg = VqvaeConfig::default();
        let offsets = cfg.scale_offsets();
        assert_eq!(offsets.len(), 10);
        assert_eq!(offsets[0], 0);
        assert_eq!(offsets[1], 1); // after 1×1
        assert_eq!(offsets[2], 5); // after 2×2
        assert_eq!(*offsets.last().unwrap(), 680 - 256); // before 16×16
    }

    #[test]
    fn test_latent_and_downsample() {
        let cfg = VqvaeConfig::default();
        assert_eq!(cfg.latent_size(), (16, 16));
        assert_eq!(cfg.downsample_factor(), 16);
    }

    #[test]
    fn test_validate_rejects_head_mismatch() {
        let cfg = CodeFormerConfig {
            dim_embd: 100,
            n_head: 8,
            ..CodeFormerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_scale() {
        let vqvae = VqvaeConfig {
            scales: vec![(1, 1), (32, 32), (16, 16)],
            ..VqvaeConfig::default()
        };
        assert!(vqvae.validate().is_err());
    }

    #[test]
    fn test_config_json_round_trip() {
        let cfg = CodeFormerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: CodeFormerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.total_tokens(), cfg.total_tokens());
        assert_eq!(back.refinement, RefinementKind::None);
    }
}
