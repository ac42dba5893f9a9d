use std::path::Path;

use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;

use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Architecture {
    Llama,
    Qwen2,
}

impl Architecture {
    /// Reads `general.architecture`, falling back to the file name.
    fn detect(content: &gguf_file::Content, path: &Path) -> Result<Self, EngineError> {
        let declared = content
            .metadata
            .get("general.architecture")
            .and_then(|v| v.to_string().ok())
            .map(|s| s.to_lowercase());

        match declared.as_deref() {
            Some("llama") | Some("mistral") => return Ok(Self::Llama),
            Some("qwen2") => return Ok(Self::Qwen2),
            _ => {}
        }

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_lowercase();
        if stem.contains("qwen") {
            Ok(Self::Qwen2)
        } else if stem.contains("llama") || stem.contains("mistral") {
            Ok(Self::Llama)
        } else {
            Err(EngineError::UnsupportedArchitecture(
                declared.unwrap_or_else(|| "unknown".to_string()),
            ))
        }
    }
}

pub(super) enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl RuntimeModel {
    pub fn load_from_gguf(path: &Path, device: &Device) -> Result<Self, EngineError> {
        let mut file = std::fs::File::open(path).map_err(|source| EngineError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let content = gguf_file::Content::read(&mut file)?;
        let arch = Architecture::detect(&content, path)?;
        tracing::info!(model = %path.display(), ?arch, tensors = content.tensor_infos.len(), "loading gguf weights");

        match arch {
            Architecture::Llama => {
                let model = quantized_llama::ModelWeights::from_gguf(content, &mut file, device)?;
                Ok(Self::Llama(model))
            }
            Architecture::Qwen2 => {
                let model = quantized_qwen2::ModelWeights::from_gguf(content, &mut file, device)?;
                Ok(Self::Qwen2(model))
            }
        }
    }

    /// A position of 0 restarts the KV cache.
    pub fn forward(&mut self, input: &Tensor, position: usize) -> Result<Tensor, EngineError> {
        let logits = match self {
            Self::Llama(model) => model.forward(input, position)?,
            Self::Qwen2(model) => model.forward(input, position)?,
        };
        Ok(logits)
    }
}
