//! Model file resolution
//!
//! A model is either a local GGUF path or a file on HuggingFace Hub written as
//! `hf://<owner>/<repo>/<file>`. Hub files are downloaded once and cached in
//! the HuggingFace cache directory (~/.cache/huggingface/hub/).

use crate::error::{LlamaCtxError, Result};
use hf_hub::{Repo, RepoType, api::sync::ApiBuilder};
use std::fmt;
use std::path::{Path, PathBuf};

const HF_SCHEME: &str = "hf://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    HuggingFace { repo_id: String, filename: String },
}

impl ModelSource {
    /// Parse a model location. Only the `hf://` prefix is special; everything
    /// else is taken as a filesystem path.
    pub fn parse(location: &str) -> Result<Self> {
        let Some(rest) = location.strip_prefix(HF_SCHEME) else {
            return Ok(ModelSource::Local(PathBuf::from(location)));
        };

        // owner/repo/path/inside/repo.gguf
        let mut parts = rest.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(repo), Some(filename))
                if !owner.is_empty() && !repo.is_empty() && !filename.is_empty() =>
            {
                Ok(ModelSource::HuggingFace {
                    repo_id: format!("{}/{}", owner, repo),
                    filename: filename.to_string(),
                })
            }
            _ => Err(LlamaCtxError::invalid(format!(
                "expected {}<owner>/<repo>/<file>, got {:?}",
                HF_SCHEME, location
            ))),
        }
    }

    /// Local path of the model, downloading it first if needed.
    pub fn resolve(&self) -> Result<PathBuf> {
        match self {
            ModelSource::Local(path) => Ok(path.clone()),
            ModelSource::HuggingFace { repo_id, filename } => download_gguf(repo_id, filename),
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Local(path) => write!(f, "{}", path.display()),
            ModelSource::HuggingFace { repo_id, filename } => {
                write!(f, "{}{}/{}", HF_SCHEME, repo_id, filename)
            }
        }
    }
}

impl From<&Path> for ModelSource {
    fn from(path: &Path) -> Self {
        ModelSource::Local(path.to_path_buf())
    }
}

/// Download a GGUF model from HuggingFace Hub
///
/// Returns the local path to the cached file.
///
/// # Environment Variables
/// * `HF_TOKEN` - HuggingFace API token (required for private repositories)
pub fn download_gguf(repo_id: &str, filename: &str) -> Result<PathBuf> {
    let mut builder = ApiBuilder::new();
    if let Ok(token) = std::env::var("HF_TOKEN") {
        builder = builder.with_token(Some(token));
    }
    let api = builder
        .build()
        .map_err(|e| LlamaCtxError::Download(e.into()))?;

    let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));

    tracing::info!("Downloading {} from {}...", filename, repo_id);

    let path = repo
        .get(filename)
        .map_err(|e| LlamaCtxError::Download(e.into()))?;

    tracing::info!("Downloaded to {:?}", path);

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_path() {
        let source = ModelSource::parse("models/tiny.gguf").unwrap();
        assert_eq!(source, ModelSource::Local(PathBuf::from("models/tiny.gguf")));
        assert_eq!(source.resolve().unwrap(), PathBuf::from("models/tiny.gguf"));
    }

    #[test]
    fn test_parse_hf() {
        let source =
            ModelSource::parse("hf://TheBloke/Llama-2-7B-GGUF/llama-2-7b.Q4_K_M.gguf").unwrap();
        assert_eq!(
            source,
            ModelSource::HuggingFace {
                repo_id: "TheBloke/Llama-2-7B-GGUF".to_string(),
                filename: "llama-2-7b.Q4_K_M.gguf".to_string(),
            }
        );
        assert_eq!(
            source.to_string(),
            "hf://TheBloke/Llama-2-7B-GGUF/llama-2-7b.Q4_K_M.gguf"
        );
    }

    #[test]
    fn test_parse_hf_nested_file() {
        let source = ModelSource::parse("hf://owner/repo/q4/model.gguf").unwrap();
        match source {
            ModelSource::HuggingFace { repo_id, filename } => {
                assert_eq!(repo_id, "owner/repo");
                assert_eq!(filename, "q4/model.gguf");
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_parse_hf_incomplete() {
        for location in ["hf://", "hf://owner", "hf://owner/repo", "hf://owner//file.gguf"] {
            assert!(
                matches!(
                    ModelSource::parse(location),
                    Err(LlamaCtxError::InvalidArgument(_))
                ),
                "{} should be rejected",
                location
            );
        }
    }
}
