//! Next-token selection
//!
//! ## Pipeline
//!
//! ```text
//! logits [n_vocab]
//!     │
//!     ▼ repetition penalties   (only with a non-empty repeat window)
//!     │
//!     ├── temperature <= 0 ──▶ greedy (argmax, lowest index wins ties)
//!     │
//!     ▼ top-k → tail-free → typical → top-p → temperature
//!     ▼ softmax + draw from the context's random source
//! token id
//! ```

mod candidates;

pub use candidates::{Candidates, TokenData};

use crate::error::{LlamaCtxError, Result};
use crate::token::TokenId;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Sampling configuration for one evaluation.
///
/// Field names serialize in camelCase (`topK`, `repeatPenaltyTokens`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvaluateOptions {
    /// 0.0 or below selects greedy decoding
    pub temperature: f32,
    /// 0 or below means the whole vocabulary
    pub top_k: i32,
    /// Nucleus mass, 1.0 disables
    pub top_p: f32,
    /// Tail-free z, 1.0 disables
    pub tfs_z: f32,
    /// Locally typical mass, 1.0 disables
    pub typical_p: f32,
    /// Lower bound on candidates kept by each filter
    pub min_keep: usize,
    /// Multiplicative penalty, 1.0 is neutral
    pub repeat_penalty: f32,
    /// Recent tokens to penalize. Penalties apply only when this is non-empty.
    pub repeat_penalty_tokens: Option<Vec<TokenId>>,
    /// Subtracted once per penalized entry, 0.0 is neutral
    pub repeat_penalty_presence_penalty: f32,
    /// Subtracted per occurrence, 0.0 is neutral
    pub repeat_penalty_frequency_penalty: f32,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: 40,
            top_p: 0.95,
            tfs_z: 1.0,
            typical_p: 1.0,
            min_keep: 1,
            repeat_penalty: 1.10,
            repeat_penalty_tokens: None,
            repeat_penalty_presence_penalty: 0.0,
            repeat_penalty_frequency_penalty: 0.0,
        }
    }
}

impl EvaluateOptions {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_k(mut self, top_k: i32) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_repeat_penalty(mut self, penalty: f32, window: Vec<TokenId>) -> Self {
        self.repeat_penalty = penalty;
        self.repeat_penalty_tokens = Some(window);
        self
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// The repeat window, if penalties apply to this evaluation.
    pub fn repeat_window(&self) -> Option<&[TokenId]> {
        self.repeat_penalty_tokens
            .as_deref()
            .filter(|window| !window.is_empty())
    }

    /// `top_k` clamped to `1..=n_vocab`, with `<= 0` meaning all.
    pub fn resolved_top_k(&self, n_vocab: usize) -> usize {
        match usize::try_from(self.top_k) {
            Ok(0) | Err(_) => n_vocab,
            Ok(k) => k.min(n_vocab),
        }
    }

    /// Check value ranges once, before any backend work.
    pub fn validate(&self, n_vocab: usize) -> Result<()> {
        if !self.temperature.is_finite() {
            return Err(LlamaCtxError::invalid("temperature must be finite"));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(LlamaCtxError::invalid("topP must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.tfs_z) {
            return Err(LlamaCtxError::invalid("tfsZ must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.typical_p) {
            return Err(LlamaCtxError::invalid("typicalP must be within [0, 1]"));
        }
        if self.min_keep == 0 {
            return Err(LlamaCtxError::invalid("minKeep must be at least 1"));
        }
        if !(self.repeat_penalty.is_finite() && self.repeat_penalty > 0.0) {
            return Err(LlamaCtxError::invalid(
                "repeatPenalty must be finite and positive",
            ));
        }
        if !self.repeat_penalty_presence_penalty.is_finite()
            || !self.repeat_penalty_frequency_penalty.is_finite()
        {
            return Err(LlamaCtxError::invalid(
                "presence and frequency penalties must be finite",
            ));
        }
        if let Some(bad) = self
            .repeat_penalty_tokens
            .iter()
            .flatten()
            .find(|t| !t.is_in_vocab(n_vocab))
        {
            return Err(LlamaCtxError::invalid(format!(
                "repeat penalty token {} is outside the vocabulary (size {})",
                bad, n_vocab
            )));
        }
        Ok(())
    }
}

/// Token selector owning the context's random source.
#[derive(Debug)]
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    /// Seeded for reproducible draws, or from OS entropy when `seed` is `None`.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Choose one token from the scores of the final batch position.
    pub fn sample(&mut self, logits: &[f32], options: &EvaluateOptions) -> Result<TokenId> {
        let mut candidates = Candidates::from_logits(logits);

        if let Some(window) = options.repeat_window() {
            candidates.apply_repetition_penalties(
                window,
                options.repeat_penalty,
                options.repeat_penalty_frequency_penalty,
                options.repeat_penalty_presence_penalty,
            );
        }

        if options.is_greedy() {
            return candidates
                .greedy()
                .ok_or_else(|| LlamaCtxError::evaluation("backend returned no logits"));
        }

        let min_keep = options.min_keep.max(1);
        candidates.top_k(options.resolved_top_k(logits.len()), min_keep);
        candidates.tail_free(options.tfs_z, min_keep);
        candidates.typical(options.typical_p, min_keep);
        candidates.top_p(options.top_p, min_keep);
        candidates.temperature(options.temperature);

        tracing::trace!("Sampling from {} candidates", candidates.len());
        candidates.sample(&mut self.rng)
    }
}
