//! VQVAE tokenizer — the pretrained image side of the model.
//!
//! - [`encoder`] — convolutional encoder (image → continuous latent)
//! - [`quantize`] — multi-scale residual quantizer (latent → index pyramid)
//! - [`decoder`] — convolutional decoder (approximated latent → image)
//! - [`blocks`] — shared ResBlock / attention / resampling blocks
//!
//! In the full model every parameter in here is frozen; only the code
//! predictor on top is trained.

pub mod blocks;
pub mod decoder;
pub mod encoder;
pub mod quantize;

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

use crate::config::VqvaeConfig;
use crate::Result;

use decoder::Decoder;
use encoder::Encoder;
use quantize::MultiScaleQuantizer;

/// The complete tokenizer: encoder, quantizer, decoder and the two
/// convolutions bracketing the quantizer.
pub struct Vqvae {
    encoder: Encoder,
    decoder: Decoder,
    quant_conv: Conv2d,
    post_quant_conv: Conv2d,
    quantize: MultiScaleQuantizer,
}

impl Vqvae {
    /// Build from a `VarBuilder` rooted at the tokenizer checkpoint layout
    /// (`encoder.*`, `decoder.*`, `quantize.*`, `quant_conv.*`,
    /// `post_quant_conv.*`).
    pub fn new(cfg: &VqvaeConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let encoder = Encoder::new(cfg, vb.pp("encoder"))?;
        let decoder = Decoder::new(cfg, vb.pp("decoder"))?;
        let quant_conv = candle_nn::conv2d(
            cfg.z_channels,
            cfg.z_channels,
            3,
            conv_cfg,
            vb.pp("quant_conv"),
        )?;
        let post_quant_conv = candle_nn::conv2d(
            cfg.z_channels,
            cfg.z_channels,
            3,
            conv_cfg,
            vb.pp("post_quant_conv"),
        )?;
        let quantize = MultiScaleQuantizer::new(cfg, vb.pp("quantize"))?;
        Ok(Self {
            encoder,
            decoder,
            quant_conv,
            post_quant_conv,
            quantize,
        })
    }

    /// Image batch → continuous latent (encoder + pre-quant conv).
    pub fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let z = self.encoder.forward(images)?;
        self.quant_conv.forward(&z).map_err(Into::into)
    }

    /// Continuous latent → index pyramid (indices-only mode).
    pub fn quantize_to_indices(&self, latent: &Tensor) -> Result<Vec<Tensor>> {
        self.quantize.quantize_to_indices(latent)
    }

    /// Index pyramid → approximated latent.
    pub fn reconstruct(&self, pyramid: &[Tensor]) -> Result<Tensor> {
        self.quantize.reconstruct(pyramid)
    }

    /// Approximated latent → image batch (post-quant conv + decoder).
    pub fn decode(&self, fhat: &Tensor) -> Result<Tensor> {
        let h = self.post_quant_conv.forward(fhat)?;
        self.decoder.forward(&h)
    }

    /// The configured scale list, in pyramid order.
    pub fn scales(&self) -> &[(usize, usize)] {
        self.quantize.scales()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    fn small_cfg() -> VqvaeConfig {
        VqvaeConfig {
            vocab_size: 64,
            z_channels: 8,
            ch: 32,
            ch_mult: vec![1, 2],
            num_res_blocks: 1,
            scales: vec![(1, 1), (2, 2), (4, 4)],
            ..VqvaeConfig::default()
        }
    }

    #[test]
    fn encode_quantize_decode_round_trip_shapes() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let vqvae = Vqvae::new(&small_cfg(), vb).unwrap();

        let images = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &dev).unwrap();
        let latent = vqvae.encode(&images).unwrap();
        assert_eq!(latent.dims(), &[2, 8, 4, 4]);

        let pyramid = vqvae.quantize_to_indices(&latent).unwrap();
        assert_eq!(pyramid.len(), 3);

        let fhat = vqvae.reconstruct(&pyramid).unwrap();
        assert_eq!(fhat.dims(), latent.dims());

        let restored = vqvae.decode(&fhat).unwrap();
        assert_eq!(restored.dims(), images.dims());
    }
}
