pub mod backend;
pub mod chat;
pub mod context;
pub mod error;
pub mod generate;
pub mod model_source;
pub mod sampling;
pub mod settings;
pub mod token;
pub mod tokenizer;

pub use backend::{DecodeSession, LlamaCppModel, LoadedModel, system_info};
pub use chat::{ChatMessage, ChatRole, Llama2Prompt, chat};
pub use context::{
    BatchItem, ConcurrencyPolicy, ContextConfig, InferenceContext, ModelOptions,
    PendingEvaluation, TokenBatch,
};
pub use error::{LlamaCtxError, Result};
pub use generate::{Completion, FinishReason, GenerateOptions, complete, complete_tokens};
pub use model_source::ModelSource;
pub use sampling::{EvaluateOptions, Sampler};
pub use settings::Settings;
pub use token::TokenId;
pub use tokenizer::Tokenizer;
