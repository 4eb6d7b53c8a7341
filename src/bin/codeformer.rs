//! CodeFormer CLI — face restoration and codebook-index prediction.
//!
//! Runs the code-prediction forward pass on an input image and optionally
//! decodes the predicted codes back into a restored image. Without a trained
//! predictor checkpoint the transformer runs from a fresh initialization —
//! useful for smoke-testing shapes and export plumbing.
//!
//! # Output
//!
//! Writes the restored image to --output and/or the predicted indices to
//! --codes-out, then prints a one-line JSON summary to stdout:
//!
//! ```json
//! {"output":"restored.png","tokens":680,"codebook":4096}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;

use codeformer_rs::{registry, weights, CodeFormer, ForwardOptions};

#[derive(Parser, Debug)]
#[command(
    name = "codeformer",
    about = "CodeFormer face restoration",
    long_about = "Predict VQVAE codebook indices for a face image and optionally decode\n\
                  them back into a restored image. Model variant is selected by name\n\
                  from the built-in registry."
)]
struct Args {
    /// Input image (PNG or JPEG). Omit to run on a synthetic gradient image.
    #[arg(long, short = 'i')]
    input: Option<PathBuf>,

    /// Restored image output path (PNG).
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Predicted code indices output path (JSON, one array per scale).
    #[arg(long)]
    codes_out: Option<PathBuf>,

    /// Model variant name from the registry.
    #[arg(long, default_value = "codeformer")]
    variant: String,

    /// Tokenizer (VQVAE) checkpoint, safetensors.
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// HuggingFace repo to fetch the tokenizer checkpoint from
    /// (used when --tokenizer is not given).
    #[arg(long)]
    tokenizer_repo: Option<String>,

    /// Filename inside --tokenizer-repo.
    #[arg(long, default_value = "vqvae.safetensors")]
    tokenizer_file: String,

    /// Trained predictor checkpoint, safetensors. Omit for fresh init.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Input resolution; images are resized to size×size.
    #[arg(long, default_value_t = 256)]
    size: usize,

    /// Blend weight for SFT fusion variants.
    #[arg(long, default_value_t = 0.0)]
    w: f64,

    /// Apply AdaIN refinement before decoding.
    #[arg(long)]
    adain: bool,

    /// Predict codes only — skip decoding.
    #[arg(long)]
    code_only: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = registry::variant(&args.variant).with_context(|| {
        format!(
            "unknown variant '{}'. Available: {}",
            args.variant,
            registry::variant_names().join(", ")
        )
    })?;

    let device = Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);

    // Resolve the tokenizer checkpoint: explicit path, hub fetch, or none.
    config.tokenizer_checkpoint = match (&args.tokenizer, &args.tokenizer_repo) {
        (Some(path), _) => Some(path.clone()),
        (None, Some(repo)) => Some(
            weights::fetch_checkpoint(repo, &args.tokenizer_file)
                .map_err(|e| anyhow::anyhow!("tokenizer fetch failed: {e}"))?,
        ),
        (None, None) => {
            tracing::warn!("no tokenizer checkpoint — running from fresh initialization");
            None
        }
    };

    let varmap = VarMap::new();
    let model = match &args.model {
        Some(path) => {
            let tokenizer_vb = match &config.tokenizer_checkpoint {
                Some(ckpt) => weights::load_safetensors(ckpt, DType::F32, &device)?,
                None => VarBuilder::from_varmap(&varmap, DType::F32, &device),
            };
            let model_vb = weights::load_safetensors(path, DType::F32, &device)?;
            CodeFormer::new(&config, tokenizer_vb, model_vb)?
        }
        None => CodeFormer::from_varmap(&config, &varmap, &device)?,
    };

    let images = match &args.input {
        Some(path) => load_image(path, args.size, &device)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => synthetic_image(args.size, &device)?,
    };

    let opts = ForwardOptions {
        w: args.w,
        adain: args.adain,
        code_only: args.code_only || args.output.is_none(),
        ..ForwardOptions::default()
    };

    tracing::info!(
        tokens = model.config().total_tokens(),
        layers = model.config().n_layers,
        "running restoration"
    );
    let result = model.restore(&images, &opts)?;

    if let Some(path) = &args.codes_out {
        let indices = result.prediction.logits.argmax(2)?;
        let pyramid = model.split_to_pyramid(&indices)?;
        let mut levels = Vec::with_capacity(pyramid.len());
        for level in &pyramid {
            let row: Vec<u32> = level.flatten_all()?.to_vec1()?;
            levels.push(row);
        }
        let doc = serde_json::json!({
            "scales": model.config().vqvae.scales,
            "indices": levels,
        });
        std::fs::write(path, serde_json::to_vec_pretty(&doc)?)?;
        tracing::info!(path = %path.display(), "wrote predicted codes");
    }

    if let (Some(path), Some(image)) = (&args.output, &result.image) {
        save_image(image, path)?;
        tracing::info!(path = %path.display(), "wrote restored image");
    }

    println!(
        r#"{{"output":{output},"codes":{codes},"tokens":{tokens},"codebook":{codebook}}}"#,
        output = json_opt_path(args.output.as_deref()),
        codes = json_opt_path(args.codes_out.as_deref()),
        tokens = model.config().total_tokens(),
        codebook = model.config().codebook_size,
    );

    Ok(())
}

fn json_opt_path(path: Option<&std::path::Path>) -> String {
    match path {
        Some(p) => format!("\"{}\"", p.display()),
        None => "null".to_string(),
    }
}

/// Load an image, resize to `size`×`size`, scale to `[-1, 1]`:
/// `[1, 3, size, size]`.
fn load_image(path: &std::path::Path, size: usize, device: &Device) -> anyhow::Result<Tensor> {
    let img = image::open(path)?
        .resize_exact(size as u32, size as u32, image::imageops::FilterType::Lanczos3)
        .to_rgb8();
    let mut data = vec![0f32; 3 * size * size];
    for (x, y, pixel) in img.enumerate_pixels() {
        for (c, &value) in pixel.0.iter().enumerate() {
            data[c * size * size + y as usize * size + x as usize] =
                value as f32 / 127.5 - 1.0;
        }
    }
    Ok(Tensor::from_vec(data, (1, 3, size, size), device)?)
}

/// Deterministic synthetic input: per-channel diagonal gradients.
fn synthetic_image(size: usize, device: &Device) -> anyhow::Result<Tensor> {
    let mut data = vec![0f32; 3 * size * size];
    for c in 0..3 {
        for y in 0..size {
            for x in 0..size {
                let v = ((x + (c + 1) * y) % size) as f32 / size as f32;
                data[c * size * size + y * size + x] = v * 2.0 - 1.0;
            }
        }
    }
    Ok(Tensor::from_vec(data, (1, 3, size, size), device)?)
}

/// Write a `[1, 3, H, W]` tensor in `[-1, 1]` as a PNG.
fn save_image(tensor: &Tensor, path: &std::path::Path) -> anyhow::Result<()> {
    let (_b, _c, h, w) = tensor.dims4()?;
    let data: Vec<f32> = tensor.flatten_all()?.to_vec1()?;
    let mut img = image::RgbImage::new(w as u32, h as u32);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        for c in 0..3 {
            let v = data[c * h * w + y as usize * w + x as usize];
            pixel.0[c] = (((v + 1.0) * 127.5).clamp(0.0, 255.0)) as u8;
        }
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    img.save(path)?;
    Ok(())
}
