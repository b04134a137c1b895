//! Autoregressive text completion on top of [`InferenceContext::evaluate`]
//!
//! The prompt is evaluated once, then every sampled token is fed back as a
//! one-token evaluation until the model emits EOS or the token budget runs out.
//! A completion holds the context's sequence lock from its first evaluation to
//! its last, so concurrent completions run one after another.

use crate::context::InferenceContext;
use crate::error::{LlamaCtxError, Result};
use crate::sampling::EvaluateOptions;
use crate::token::TokenId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerateOptions {
    /// Upper bound on generated tokens
    pub max_tokens: usize,
    /// Penalize tokens from the rolling history window
    pub penalize_repeats: bool,
    /// History window length (0 = no window)
    pub repeat_last_n: usize,
    /// Sampling parameters for every step. A repeat window set here is
    /// replaced by the rolling history window.
    #[serde(flatten)]
    pub sampling: EvaluateOptions,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            penalize_repeats: true,
            repeat_last_n: 64,
            sampling: EvaluateOptions::default(),
        }
    }
}

impl GenerateOptions {
    /// Options for the next step given everything fed or sampled so far.
    fn step_options(&self, history: &[TokenId]) -> EvaluateOptions {
        let mut options = self.sampling.clone();
        options.repeat_penalty_tokens = if self.penalize_repeats && self.repeat_last_n > 0 {
            let start = history.len().saturating_sub(self.repeat_last_n);
            Some(history[start..].to_vec())
        } else {
            None
        };
        options
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The model produced EOS
    Stop,
    /// `max_tokens` was reached
    Length,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub text: String,
    /// Generated tokens, EOS excluded
    pub tokens: Vec<TokenId>,
    pub prompt_tokens: usize,
    pub finish_reason: FinishReason,
}

/// Generate a continuation of `prompt`.
///
/// `on_text` receives the generated text in order as it becomes available.
/// A character whose bytes span several tokens is delivered once all of them
/// have been sampled.
pub async fn complete<F>(
    ctx: &InferenceContext,
    prompt: &str,
    options: &GenerateOptions,
    on_text: F,
) -> Result<Completion>
where
    F: FnMut(&str),
{
    if options.max_tokens == 0 {
        return Err(LlamaCtxError::invalid("maxTokens must be at least 1"));
    }
    let prompt_tokens = ctx.encode(prompt)?;
    complete_tokens(ctx, prompt_tokens, options, on_text).await
}

/// Generate a continuation of an already tokenized prompt.
pub async fn complete_tokens<F>(
    ctx: &InferenceContext,
    prompt_tokens: Vec<TokenId>,
    options: &GenerateOptions,
    mut on_text: F,
) -> Result<Completion>
where
    F: FnMut(&str),
{
    if options.max_tokens == 0 {
        return Err(LlamaCtxError::invalid("maxTokens must be at least 1"));
    }
    if prompt_tokens.is_empty() {
        return Err(LlamaCtxError::invalid("prompt produced no tokens"));
    }

    let _sequence = ctx.lock_sequence().await;

    let eos = ctx.token_eos();
    let mut history = prompt_tokens.clone();
    let mut input = prompt_tokens;
    let prompt_len = input.len();

    let mut generated = Vec::new();
    let mut text = String::new();
    let mut utf8 = Utf8Buffer::default();

    let finish_reason = loop {
        if generated.len() >= options.max_tokens {
            break FinishReason::Length;
        }

        let token = ctx.evaluate(&input, options.step_options(&history)).await?;
        if token == eos {
            break FinishReason::Stop;
        }

        generated.push(token);
        history.push(token);

        let piece = ctx.tokenizer().token_bytes(token)?;
        if let Some(chunk) = utf8.push(&piece) {
            on_text(&chunk);
            text.push_str(&chunk);
        }

        input = vec![token];
    };

    if let Some(rest) = utf8.finish() {
        on_text(&rest);
        text.push_str(&rest);
    }

    tracing::debug!(
        "Completion finished ({:?}): {} prompt tokens, {} generated",
        finish_reason,
        prompt_len,
        generated.len()
    );

    Ok(Completion {
        text,
        tokens: generated,
        prompt_tokens: prompt_len,
        finish_reason,
    })
}

/// Holds back the bytes of an incomplete trailing UTF-8 sequence.
#[derive(Debug, Default)]
struct Utf8Buffer {
    pending: Vec<u8>,
}

impl Utf8Buffer {
    /// Append bytes and take out whatever is complete.
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let ready = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Invalid, not just incomplete: no later byte can fix it
            Err(e) if e.error_len().is_some() => self.pending.len(),
            Err(e) => e.valid_up_to(),
        };
        if ready == 0 {
            return None;
        }
        let chunk: Vec<u8> = self.pending.drain(..ready).collect();
        Some(String::from_utf8_lossy(&chunk).into_owned())
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_buffer_holds_split_character() {
        let mut buf = Utf8Buffer::default();
        let bytes = "é".as_bytes();
        assert_eq!(buf.push(&bytes[..1]), None);
        assert_eq!(buf.push(&bytes[1..]).as_deref(), Some("é"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_utf8_buffer_emits_valid_prefix() {
        let mut buf = Utf8Buffer::default();
        let snow = "☃".as_bytes();
        let mut input = b"ab".to_vec();
        input.extend_from_slice(&snow[..2]);
        assert_eq!(buf.push(&input).as_deref(), Some("ab"));
        assert_eq!(buf.push(&snow[2..]).as_deref(), Some("☃"));
    }

    #[test]
    fn test_utf8_buffer_flushes_invalid_bytes() {
        let mut buf = Utf8Buffer::default();
        assert_eq!(buf.push(&[0xff, b'a']).as_deref(), Some("\u{fffd}a"));
    }

    #[test]
    fn test_utf8_buffer_finish_flushes_incomplete_tail() {
        let mut buf = Utf8Buffer::default();
        assert_eq!(buf.push(&"é".as_bytes()[..1]), None);
        assert_eq!(buf.finish().as_deref(), Some("\u{fffd}"));
    }

    #[test]
    fn test_step_options_window() {
        let options = GenerateOptions {
            repeat_last_n: 2,
            ..Default::default()
        };
        let history = [TokenId(5), TokenId(6), TokenId(7)];
        let step = options.step_options(&history);
        assert_eq!(step.repeat_penalty_tokens, Some(vec![TokenId(6), TokenId(7)]));

        let disabled = GenerateOptions {
            penalize_repeats: false,
            ..Default::default()
        };
        assert_eq!(disabled.step_options(&history).repeat_penalty_tokens, None);

        let zero = GenerateOptions {
            repeat_last_n: 0,
            ..Default::default()
        };
        assert_eq!(zero.step_options(&history).repeat_penalty_tokens, None);
    }

    #[test]
    fn test_generate_options_json() {
        let options: GenerateOptions =
            serde_json::from_str(r#"{"maxTokens": 8, "temperature": 0.7, "topK": 10}"#).unwrap();
        assert_eq!(options.max_tokens, 8);
        assert_eq!(options.repeat_last_n, 64);
        assert_eq!(options.sampling.top_k, 10);
        assert!((options.sampling.temperature - 0.7).abs() < 1e-6);
    }
}
