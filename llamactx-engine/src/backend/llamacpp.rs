//! llama.cpp GGUF backend via the llama-cpp-2 crate

use super::{DecodeSession, LoadedModel};
use crate::context::{ContextConfig, ModelOptions, TokenBatch};
use crate::error::{LlamaCtxError, Result};
use crate::token::TokenId;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{DecodeError, TokenToStringError};
use std::ffi::CStr;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::OnceLock;

/// Global llama.cpp backend (can only be initialized once)
static LLAMA_BACKEND: OnceLock<std::result::Result<LlamaBackend, String>> = OnceLock::new();

/// Get or initialize the global llama.cpp backend
fn get_backend() -> Result<&'static LlamaBackend> {
    let result = LLAMA_BACKEND.get_or_init(|| {
        let mut backend = LlamaBackend::init().map_err(|e| e.to_string())?;
        backend.void_logs();
        Ok(backend)
    });
    match result {
        Ok(backend) => Ok(backend),
        Err(e) => Err(LlamaCtxError::ModelLoad(
            format!("Failed to initialize llama.cpp backend: {}", e).into(),
        )),
    }
}

/// Process-wide llama.cpp build and CPU feature summary.
pub fn system_info() -> String {
    if let Err(e) = get_backend() {
        tracing::warn!("{}", e);
    }
    // SAFETY: llama.cpp returns a pointer to a static NUL-terminated buffer.
    let ptr = unsafe { llama_cpp_sys_2::llama_print_system_info() };
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_string_lossy()
        .into_owned()
}

/// A GGUF model loaded through llama.cpp.
pub struct LlamaCppModel {
    model: LlamaModel,
    n_vocab: usize,
    vocab_only: bool,
    nul_token: OnceLock<Option<TokenId>>,
}

impl LlamaCppModel {
    /// Load a GGUF model file.
    pub fn from_file<P: AsRef<Path>>(path: P, options: &ModelOptions) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(LlamaCtxError::ModelLoad(
                format!("model file not found: {}", path.display()).into(),
            ));
        }

        let backend = get_backend()?;

        let mut model_params = LlamaModelParams::default()
            .with_vocab_only(options.vocab_only)
            .with_use_mlock(options.use_mlock);
        if let Some(n) = options.gpu_layers {
            model_params = model_params.with_n_gpu_layers(n);
        }
        if !options.use_mmap {
            // llama-cpp-2 has no setter for use_mmap; llama.cpp keeps its default.
            tracing::warn!("use_mmap = false is not supported by this backend, ignoring");
        }

        let model = LlamaModel::load_from_file(backend, path, &model_params)
            .map_err(|e| LlamaCtxError::ModelLoad(e.into()))?;
        let n_vocab =
            usize::try_from(model.n_vocab()).map_err(|e| LlamaCtxError::ModelLoad(e.into()))?;

        tracing::info!(
            "Loaded {} ({} vocab entries, vocab_only={})",
            path.display(),
            n_vocab,
            options.vocab_only
        );

        Ok(Self {
            model,
            n_vocab,
            vocab_only: options.vocab_only,
            nul_token: OnceLock::new(),
        })
    }

    /// Token whose piece is the single byte 0x00, looked up on first use.
    fn nul_token(&self) -> Result<TokenId> {
        let found = *self.nul_token.get_or_init(|| {
            (0..self.n_vocab)
                .filter_map(|id| i32::try_from(id).ok().map(TokenId))
                .find(|&token| matches!(self.token_piece(token).as_deref(), Ok([0])))
        });
        found.ok_or_else(|| {
            LlamaCtxError::Tokenizer("vocabulary has no token for the NUL character".into())
        })
    }

    /// Build LlamaContextParams from the context configuration
    fn context_params(config: &ContextConfig) -> Result<LlamaContextParams> {
        let n_ctx = NonZeroU32::new(config.n_ctx)
            .ok_or_else(|| LlamaCtxError::invalid("n_ctx must be non-zero"))?;
        let threads = i32::try_from(config.n_threads).unwrap_or(i32::MAX);
        let threads_batch = i32::try_from(config.threads_batch()).unwrap_or(i32::MAX);
        Ok(LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(config.n_batch)
            .with_n_threads(threads)
            .with_n_threads_batch(threads_batch))
    }
}

impl LoadedModel for LlamaCppModel {
    fn n_vocab(&self) -> usize {
        self.n_vocab
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>> {
        tokenize_around_nul(
            text,
            |segment| {
                let tokens = self
                    .model
                    .str_to_token(segment, AddBos::Never)
                    .map_err(|e| LlamaCtxError::Tokenizer(e.into()))?;
                Ok(tokens.into_iter().map(|t| TokenId(t.0)).collect())
            },
            || self.nul_token(),
        )
    }

    fn token_piece(&self, token: TokenId) -> Result<Vec<u8>> {
        let llama_token = LlamaToken(token.0);
        let piece = match self.model.token_to_piece_bytes(llama_token, 32, false, None) {
            // Long pieces report the required size as a negative count
            Err(TokenToStringError::InsufficientBufferSpace(needed)) => {
                self.model.token_to_piece_bytes(
                    llama_token,
                    needed.unsigned_abs() as usize,
                    false,
                    None,
                )
            }
            other => other,
        };
        piece.map_err(|e| LlamaCtxError::Tokenizer(e.into()))
    }

    fn token_bos(&self) -> TokenId {
        TokenId(self.model.token_bos().0)
    }

    fn token_eos(&self) -> TokenId {
        TokenId(self.model.token_eos().0)
    }

    fn token_nl(&self) -> TokenId {
        TokenId(self.model.token_nl().0)
    }

    fn supports_evaluation(&self) -> bool {
        !self.vocab_only
    }

    fn new_session(&self, config: &ContextConfig) -> Result<Box<dyn DecodeSession + '_>> {
        let backend = get_backend()?;
        let ctx = self
            .model
            .new_context(backend, Self::context_params(config)?)
            .map_err(|e| LlamaCtxError::Evaluation(e.into()))?;
        tracing::debug!(
            "Created llama.cpp context (n_ctx={}, n_threads={}, n_threads_batch={})",
            config.n_ctx,
            config.n_threads,
            config.threads_batch()
        );
        Ok(Box::new(LlamaCppSession { ctx }))
    }
}

/// Tokenize `text` segment by segment around NUL characters, which the C
/// tokenizer cannot see past.
fn tokenize_around_nul<T, N>(text: &str, mut tokenize: T, mut nul: N) -> Result<Vec<TokenId>>
where
    T: FnMut(&str) -> Result<Vec<TokenId>>,
    N: FnMut() -> Result<TokenId>,
{
    if !text.contains('\0') {
        return tokenize(text);
    }

    let mut tokens = Vec::new();
    for (i, segment) in text.split('\0').enumerate() {
        if i > 0 {
            tokens.push(nul()?);
        }
        if !segment.is_empty() {
            tokens.extend(tokenize(segment)?);
        }
    }
    Ok(tokens)
}

/// A llama.cpp execution context borrowing its model.
struct LlamaCppSession<'a> {
    ctx: LlamaContext<'a>,
}

impl DecodeSession for LlamaCppSession<'_> {
    fn decode(&mut self, batch: &TokenBatch) -> Result<()> {
        let mut llama_batch = LlamaBatch::new(batch.len(), 1);
        for item in batch.items() {
            let pos = i32::try_from(item.position)
                .map_err(|_| LlamaCtxError::invalid("position exceeds i32 range"))?;
            llama_batch
                .add(LlamaToken(item.token.0), pos, &[item.seq_id], item.logits)
                .map_err(|e| LlamaCtxError::Evaluation(e.into()))?;
        }

        self.ctx.decode(&mut llama_batch).map_err(|e| match e {
            DecodeError::NoKvCacheSlot => LlamaCtxError::NoCacheSlot,
            other => LlamaCtxError::Evaluation(other.into()),
        })
    }

    fn discard_from(&mut self, position: usize) -> Result<()> {
        let p0 = u32::try_from(position)
            .map_err(|_| LlamaCtxError::invalid("position exceeds u32 range"))?;
        self.ctx
            .clear_kv_cache_seq(Some(0), Some(p0), None)
            .map_err(|e| LlamaCtxError::Evaluation(e.into()))?;
        Ok(())
    }

    fn logits_ith(&self, index: usize) -> &[f32] {
        self.ctx.get_logits_ith(index as i32)
    }
}
