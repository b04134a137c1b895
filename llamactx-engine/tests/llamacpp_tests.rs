//! Tests against a real GGUF model
//!
//! Set `LLAMACTX_TEST_MODEL` to a small local model (or an `hf://` source) to
//! run them; they are skipped otherwise.

use llamactx_engine::{
    ContextConfig, EvaluateOptions, InferenceContext, LlamaCtxError, ModelOptions, ModelSource,
    system_info,
};
use std::path::PathBuf;

fn test_model() -> Option<PathBuf> {
    let location = std::env::var("LLAMACTX_TEST_MODEL").ok()?;
    match ModelSource::parse(&location).and_then(|source| source.resolve()) {
        Ok(path) => Some(path),
        Err(e) => {
            eprintln!("Skipping: could not resolve {}: {}", location, e);
            None
        }
    }
}

macro_rules! require_model {
    () => {
        match test_model() {
            Some(path) => path,
            None => {
                eprintln!("Skipping: LLAMACTX_TEST_MODEL is not set");
                return;
            }
        }
    };
}

fn small_config() -> ContextConfig {
    ContextConfig {
        n_ctx: 256,
        n_threads: 2,
        seed: Some(1),
        ..Default::default()
    }
}

#[test]
fn test_system_info_is_reported() {
    let info = system_info();
    assert!(!info.is_empty());
}

#[test]
fn test_missing_model_is_a_load_error() {
    let result = InferenceContext::new("/nonexistent/model.gguf", ModelOptions::default());
    assert!(matches!(result, Err(LlamaCtxError::ModelLoad(_))));
}

#[test]
fn test_encode_decode_real_vocab() {
    let path = require_model!();
    let ctx =
        InferenceContext::with_config(&path, ModelOptions::default(), small_config()).unwrap();

    let tokens = ctx.encode("Hello world").unwrap();
    assert!(!tokens.is_empty());
    assert!(!tokens.contains(&ctx.token_bos()));
    assert!(ctx.decode(&tokens).unwrap().contains("world"));
}

#[test]
fn test_encode_interior_nul() {
    let path = require_model!();
    let options = ModelOptions {
        vocab_only: true,
        ..Default::default()
    };
    let ctx = InferenceContext::with_config(&path, options, small_config()).unwrap();

    let tokens = ctx.encode("a\0b").unwrap();
    let text = ctx.decode(&tokens).unwrap();
    assert!(text.contains('\0'));
    assert!(text.ends_with('b'));
}

#[test]
fn test_vocab_only_load() {
    let path = require_model!();
    let options = ModelOptions {
        vocab_only: true,
        ..Default::default()
    };
    let ctx = InferenceContext::with_config(&path, options, small_config()).unwrap();

    let tokens = ctx.encode("Hi").unwrap();
    assert!(matches!(
        ctx.evaluate(&tokens, EvaluateOptions::default()).wait(),
        Err(LlamaCtxError::Evaluation(_))
    ));
}

#[test]
fn test_greedy_evaluation_advances_cursor() {
    let path = require_model!();
    let ctx =
        InferenceContext::with_config(&path, ModelOptions::default(), small_config()).unwrap();

    let mut prompt = vec![ctx.token_bos()];
    prompt.extend(ctx.encode("The capital of France is").unwrap());
    let next = ctx
        .evaluate(&prompt, EvaluateOptions::default())
        .wait()
        .unwrap();
    assert!(next.is_in_vocab(ctx.n_vocab()));
    assert_eq!(ctx.position(), prompt.len());

    ctx.evaluate(&[next], EvaluateOptions::default())
        .wait()
        .unwrap();
    assert_eq!(ctx.position(), prompt.len() + 1);
}

#[test]
fn test_overflowing_context_reports_capacity() {
    let path = require_model!();
    let config = ContextConfig {
        n_ctx: 16,
        n_batch: 64,
        ..small_config()
    };
    let ctx = InferenceContext::with_config(&path, ModelOptions::default(), config).unwrap();

    let tokens = ctx.encode(&"word ".repeat(40)).unwrap();
    let err = ctx
        .evaluate(&tokens, EvaluateOptions::default())
        .wait()
        .unwrap_err();
    assert!(matches!(
        err,
        LlamaCtxError::NoCacheSlot | LlamaCtxError::Evaluation(_)
    ));
    assert_eq!(ctx.position(), 0);
}
