//! Tokenizer checkpoint loading.
//!
//! Checkpoints are safetensors files whose tensor names follow the layout
//! produced by [`crate::model::vqvae::Vqvae::new`] (`encoder.*`,
//! `decoder.*`, `quantize.*`, `quant_conv.*`, `post_quant_conv.*`). A
//! mismatch in names or shapes surfaces as a weight-loading error on the
//! first parameter access — no partial load is observable.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;

use crate::{Error, Result};

/// Memory-map a safetensors checkpoint into a `VarBuilder`.
pub fn load_safetensors(
    path: &Path,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    if !path.exists() {
        return Err(Error::WeightLoad(format!(
            "checkpoint not found: {}",
            path.display()
        )));
    }
    tracing::info!(path = %path.display(), "loading tokenizer checkpoint");
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[path.to_path_buf()], dtype, device)
            .map_err(|e| Error::WeightLoad(format!("{}: {e}", path.display())))?
    };
    Ok(vb)
}

/// Download a tokenizer checkpoint from the HuggingFace Hub, returning the
/// local cache path.
pub fn fetch_checkpoint(repo_id: &str, filename: &str) -> Result<PathBuf> {
    tracing::info!(repo = repo_id, file = filename, "fetching checkpoint");
    let api = hf_hub::api::sync::Api::new().map_err(|e| Error::HfHub(e.to_string()))?;
    let path = api.model(repo_id.to_string()).get(filename)?;
    Ok(path)
}
