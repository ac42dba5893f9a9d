use std::path::{Path, PathBuf};

use tokenizers::Tokenizer;

/// Tokens that end an assistant turn across the supported model families.
const STOP_TOKENS: &[&str] = &[
    "</s>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<|endoftext|>",
    "<|im_end|>",
    "<|end|>",
];

/// Explicit hint first, then `tokenizer.json` beside the model, then the working dir.
pub(super) fn resolve_tokenizer_path(model_path: &Path, hint: Option<&Path>) -> Option<PathBuf> {
    if let Some(hint) = hint {
        if hint.exists() {
            return Some(hint.to_path_buf());
        }
        tracing::warn!(tokenizer = %hint.display(), "configured tokenizer not found, searching");
    }

    let beside_model = model_path
        .parent()
        .unwrap_or(Path::new("."))
        .join("tokenizer.json");
    if beside_model.exists() {
        return Some(beside_model);
    }

    [
        PathBuf::from("tokenizer.json"),
        Path::new("models").join("tokenizer.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
}

pub(super) fn stop_token_ids(tokenizer: &Tokenizer) -> Vec<u32> {
    let mut ids: Vec<u32> = STOP_TOKENS
        .iter()
        .filter_map(|t| tokenizer.token_to_id(t))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}
