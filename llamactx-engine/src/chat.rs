//! Chat completion in the Llama 2 instruction format
//!
//! ```text
//! <s>[INST] <<SYS>>
//! {system}
//! <</SYS>>
//!
//! {user} [/INST] {assistant}</s><s>[INST] {user} [/INST]
//! ```
//!
//! `<s>` and `</s>` stand for the model's BOS and EOS tokens. They are
//! inserted as token ids, never tokenized from text.

use crate::context::InferenceContext;
use crate::error::{LlamaCtxError, Result};
use crate::generate::{Completion, GenerateOptions, complete_tokens};
use crate::token::TokenId;
use crate::tokenizer::Tokenizer;
use serde::{Deserialize, Serialize};
use std::fmt;

const INST_OPEN: &str = "[INST] ";
const INST_CLOSE: &str = " [/INST]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A conversation laid out as instruction turns. Each turn is one
/// BOS ... EOS span; the last turn is left open for the model's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Llama2Prompt {
    turns: Vec<String>,
}

impl Llama2Prompt {
    /// Lay out `messages`. A system message is only accepted first; user
    /// content is trimmed.
    pub fn build(messages: &[ChatMessage]) -> Result<Self> {
        if messages.is_empty() {
            return Err(LlamaCtxError::invalid("chat requires at least one message"));
        }

        let mut turns = Vec::new();
        let mut current = String::from(INST_OPEN);
        for (i, message) in messages.iter().enumerate() {
            match message.role {
                ChatRole::System if i == 0 => {
                    current.push_str("<<SYS>>\n");
                    current.push_str(&message.content);
                    current.push_str("\n<</SYS>>\n\n");
                }
                ChatRole::System => {
                    return Err(LlamaCtxError::invalid(
                        "a system message is only allowed as the first message",
                    ));
                }
                ChatRole::User => current.push_str(message.content.trim()),
                ChatRole::Assistant => {
                    current.push_str(INST_CLOSE);
                    current.push(' ');
                    current.push_str(&message.content);
                    turns.push(std::mem::replace(&mut current, String::from(INST_OPEN)));
                }
            }
        }
        current.push_str(INST_CLOSE);
        turns.push(current);

        Ok(Self { turns })
    }

    pub fn turns(&self) -> &[String] {
        &self.turns
    }

    /// `BOS turn EOS BOS turn ... BOS last_turn`
    pub fn tokens(&self, tokenizer: &Tokenizer) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();
        for (i, turn) in self.turns.iter().enumerate() {
            if i > 0 {
                tokens.push(tokenizer.token_eos());
            }
            tokens.push(tokenizer.token_bos());
            tokens.extend(tokenizer.encode(turn)?);
        }
        Ok(tokens)
    }
}

impl fmt::Display for Llama2Prompt {
    /// Text form with `<s>` / `</s>` markers.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, turn) in self.turns.iter().enumerate() {
            if i > 0 {
                f.write_str("</s>")?;
            }
            write!(f, "<s>{}", turn)?;
        }
        Ok(())
    }
}

/// Generate the assistant's reply to `messages`.
///
/// The conversation is appended at the context's current position.
pub async fn chat<F>(
    ctx: &InferenceContext,
    messages: &[ChatMessage],
    options: &GenerateOptions,
    on_text: F,
) -> Result<Completion>
where
    F: FnMut(&str),
{
    let prompt = Llama2Prompt::build(messages)?;
    let tokens = prompt.tokens(ctx.tokenizer())?;
    tracing::debug!(
        "Chat prompt: {} messages, {} turns, {} tokens",
        messages.len(),
        prompt.turns().len(),
        tokens.len()
    );
    complete_tokens(ctx, tokens, options, on_text).await
}
