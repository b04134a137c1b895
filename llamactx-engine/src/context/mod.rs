//! Inference context: one loaded model, one execution session and the
//! position cursor that tracks how many tokens the session has consumed.

mod batch;
mod worker;

pub use batch::{BatchItem, TokenBatch};
pub use worker::PendingEvaluation;

use crate::backend::{LlamaCppModel, LoadedModel};
use crate::error::{LlamaCtxError, Result};
use crate::sampling::EvaluateOptions;
use crate::token::TokenId;
use crate::tokenizer::Tokenizer;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use worker::EvalWorker;

/// Options applied when loading model weights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelOptions {
    /// Layers to offload to the GPU (`None` = backend default)
    pub gpu_layers: Option<u32>,
    /// Load only the vocabulary, no weights
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            gpu_layers: None,
            vocab_only: false,
            use_mmap: true,
            use_mlock: false,
        }
    }
}

/// What happens to an evaluation submitted while another is outstanding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyPolicy {
    /// Queue it behind the running one (FIFO, bounded by `queue_capacity`)
    #[default]
    Queue,
    /// Fail it with `ConcurrentEvaluation`
    Reject,
}

/// Execution context settings, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Sequence cache capacity in tokens
    pub n_ctx: u32,
    /// Threads for single-token evaluation
    pub n_threads: u32,
    /// Threads for batched evaluation (`None` = `n_threads`)
    pub n_threads_batch: Option<u32>,
    /// Largest batch the backend accepts in one decode. Longer evaluations
    /// are split into several decodes.
    pub n_batch: u32,
    /// Sampling seed (`None` = OS entropy)
    pub seed: Option<u64>,
    /// Evaluations that may wait behind the running one
    pub queue_capacity: usize,
    pub policy: ConcurrencyPolicy,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_threads: 6,
            n_threads_batch: None,
            n_batch: 512,
            seed: None,
            queue_capacity: 16,
            policy: ConcurrencyPolicy::Queue,
        }
    }
}

impl ContextConfig {
    /// Thread count for batched evaluation.
    pub fn threads_batch(&self) -> u32 {
        self.n_threads_batch.unwrap_or(self.n_threads)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_ctx == 0 {
            return Err(LlamaCtxError::invalid("n_ctx must be at least 1"));
        }
        if self.n_threads == 0 || self.n_threads_batch == Some(0) {
            return Err(LlamaCtxError::invalid("thread counts must be at least 1"));
        }
        if self.n_batch == 0 {
            return Err(LlamaCtxError::invalid("n_batch must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(LlamaCtxError::invalid("queue_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// A loaded model with its execution context.
///
/// Tokenization runs on the caller's thread. Evaluations run on a worker
/// thread, strictly one after another, and advance the position cursor by the
/// number of tokens they consume. Dropping the context (or calling
/// [`InferenceContext::destroy`]) waits for queued evaluations, releases the
/// execution context and then the model.
///
/// A multi-step exchange such as a completion holds
/// [`InferenceContext::lock_sequence`] so no other exchange can feed tokens
/// between its steps.
pub struct InferenceContext {
    worker: Option<EvalWorker>,
    tokenizer: Tokenizer,
    model: Arc<dyn LoadedModel>,
    config: ContextConfig,
    sequence: Mutex<()>,
}

impl InferenceContext {
    /// Load a GGUF model with the default context configuration.
    pub fn new<P: AsRef<Path>>(model_path: P, options: ModelOptions) -> Result<Self> {
        Self::with_config(model_path, options, ContextConfig::default())
    }

    /// Load a GGUF model with an explicit context configuration.
    pub fn with_config<P: AsRef<Path>>(
        model_path: P,
        options: ModelOptions,
        config: ContextConfig,
    ) -> Result<Self> {
        config.validate()?;
        let model = LlamaCppModel::from_file(model_path, &options)?;
        Self::from_model(Arc::new(model), config)
    }

    /// Wrap an already loaded model from any backend.
    pub fn from_model(model: Arc<dyn LoadedModel>, config: ContextConfig) -> Result<Self> {
        config.validate()?;

        let worker = if model.supports_evaluation() {
            Some(EvalWorker::spawn(Arc::clone(&model), config.clone())?)
        } else {
            tracing::debug!("Vocab-only model, no execution context created");
            None
        };

        Ok(Self {
            worker,
            tokenizer: Tokenizer::new(Arc::clone(&model)),
            model,
            config,
            sequence: Mutex::new(()),
        })
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn n_vocab(&self) -> usize {
        self.model.n_vocab()
    }

    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        self.tokenizer.encode(text)
    }

    pub fn encode_batch<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<TokenId>> {
        self.tokenizer.encode_batch(texts)
    }

    pub fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        self.tokenizer.decode(tokens)
    }

    pub fn decode_batch(&self, values: &[f64]) -> Result<String> {
        self.tokenizer.decode_batch(values)
    }

    pub fn token_bos(&self) -> TokenId {
        self.tokenizer.token_bos()
    }

    pub fn token_eos(&self) -> TokenId {
        self.tokenizer.token_eos()
    }

    pub fn token_nl(&self) -> TokenId {
        self.tokenizer.token_nl()
    }

    /// Feed `tokens` to the model at the current position and sample the
    /// next token.
    ///
    /// The request is validated and copied before this returns. Errors,
    /// including validation errors, are delivered through the returned
    /// [`PendingEvaluation`].
    pub fn evaluate(&self, tokens: &[TokenId], options: EvaluateOptions) -> PendingEvaluation {
        if let Err(e) = validate_request(tokens, &options, self.model.n_vocab()) {
            return PendingEvaluation::failed(e);
        }
        match &self.worker {
            Some(worker) => worker.submit(tokens.to_vec(), options),
            None => PendingEvaluation::failed(LlamaCtxError::evaluation(
                "model was loaded vocab-only",
            )),
        }
    }

    /// Exclusive use of the sequence until the guard is dropped.
    ///
    /// Plain [`InferenceContext::evaluate`] calls do not take this lock.
    pub async fn lock_sequence(&self) -> MutexGuard<'_, ()> {
        self.sequence.lock().await
    }

    /// Tokens consumed by successful evaluations so far.
    pub fn position(&self) -> usize {
        self.worker.as_ref().map_or(0, EvalWorker::position)
    }

    /// Evaluations queued or running.
    pub fn outstanding(&self) -> usize {
        self.worker.as_ref().map_or(0, EvalWorker::outstanding)
    }

    /// Finish queued evaluations and release the execution context, then the
    /// model.
    pub fn destroy(self) {
        tracing::debug!("Destroying context at position {}", self.position());
        drop(self);
    }
}

fn validate_request(tokens: &[TokenId], options: &EvaluateOptions, n_vocab: usize) -> Result<()> {
    if tokens.is_empty() {
        return Err(LlamaCtxError::invalid("evaluate requires at least one token"));
    }
    if let Some(bad) = tokens.iter().find(|t| !t.is_in_vocab(n_vocab)) {
        return Err(LlamaCtxError::invalid(format!(
            "token {} is outside the vocabulary (size {})",
            bad, n_vocab
        )));
    }
    options.validate(n_vocab)
}
