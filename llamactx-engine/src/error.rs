//! Error types for context construction, tokenization and evaluation

/// Errors that can occur while loading a model or running an evaluation.
#[derive(Debug, thiserror::Error)]
pub enum LlamaCtxError {
    #[error("model load failed")]
    ModelLoad(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("tokenization failed")]
    Tokenizer(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The backend found no free slot in the sequence cache for the batch.
    #[error(
        "could not find a KV slot for the batch (try reducing the size of the batch or increase the context)"
    )]
    NoCacheSlot,

    #[error("evaluation failed")]
    Evaluation(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("another evaluation is outstanding on this context ({outstanding} queued or running)")]
    ConcurrentEvaluation { outstanding: usize },

    #[error("evaluation was cancelled before dispatch")]
    Cancelled,

    #[error("download failed")]
    Download(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl LlamaCtxError {
    /// `true` when the failure is a full sequence cache. The caller can retry
    /// with a smaller batch or a context with more capacity.
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, LlamaCtxError::NoCacheSlot)
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        LlamaCtxError::InvalidArgument(msg.into())
    }

    pub(crate) fn evaluation(msg: impl Into<String>) -> Self {
        LlamaCtxError::Evaluation(msg.into().into())
    }
}

pub type Result<T> = std::result::Result<T, LlamaCtxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_exhaustion_is_distinguishable() {
        assert!(LlamaCtxError::NoCacheSlot.is_capacity_exhausted());
        assert!(!LlamaCtxError::evaluation("Eval has failed").is_capacity_exhausted());
    }

    #[test]
    fn test_source_is_preserved() {
        use std::error::Error;
        let err = LlamaCtxError::evaluation("backend returned -1");
        assert_eq!(err.to_string(), "evaluation failed");
        assert_eq!(
            err.source().map(|s| s.to_string()).as_deref(),
            Some("backend returned -1")
        );
    }
}
