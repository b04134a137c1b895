//! Inference backend interface
//!
//! The engine never talks to llama.cpp directly. A loaded model is a
//! [`LoadedModel`]: a read-only vocabulary that can be shared across threads,
//! plus a factory for [`DecodeSession`]s. A session owns the backend's
//! execution state (its key/value cache) and is confined to the thread that
//! created it.

pub mod llamacpp;

use crate::context::{ContextConfig, TokenBatch};
use crate::error::Result;
use crate::token::TokenId;

pub use llamacpp::{LlamaCppModel, system_info};

/// A model whose weights and vocabulary are loaded.
pub trait LoadedModel: Send + Sync {
    /// Number of entries in the vocabulary.
    fn n_vocab(&self) -> usize;

    /// Convert text to token ids. No BOS or other special tokens are added.
    /// Any valid UTF-8 text, including interior NUL characters, is accepted.
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>>;

    /// Raw bytes of one token's text fragment. Control tokens yield an
    /// empty fragment.
    fn token_piece(&self, token: TokenId) -> Result<Vec<u8>>;

    fn token_bos(&self) -> TokenId;

    fn token_eos(&self) -> TokenId;

    fn token_nl(&self) -> TokenId;

    /// Whether [`LoadedModel::new_session`] can succeed. Vocab-only loads
    /// have no weights to evaluate.
    fn supports_evaluation(&self) -> bool {
        true
    }

    /// Create an execution context bound to this model.
    fn new_session(&self, config: &ContextConfig) -> Result<Box<dyn DecodeSession + '_>>;
}

/// Backend execution state for one sequence.
pub trait DecodeSession {
    /// Run one forward pass over `batch`.
    ///
    /// Fails with [`crate::LlamaCtxError::NoCacheSlot`] when the cache cannot
    /// hold the batch and with [`crate::LlamaCtxError::Evaluation`] otherwise.
    fn decode(&mut self, batch: &TokenBatch) -> Result<()>;

    /// Drop every cache entry of sequence 0 at `position` or later.
    fn discard_from(&mut self, position: usize) -> Result<()>;

    /// Scores for every vocabulary entry at batch item `index`, valid after a
    /// successful [`DecodeSession::decode`] that requested logits there.
    fn logits_ith(&self, index: usize) -> &[f32];
}
