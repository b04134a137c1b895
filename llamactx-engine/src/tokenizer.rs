//! Text ↔ token id conversion against the loaded vocabulary
//!
//! The tokenizer only reads the model's vocabulary, so it is cheap to clone
//! and safe to use from any thread while an evaluation is running.

use crate::backend::LoadedModel;
use crate::error::{LlamaCtxError, Result};
use crate::token::TokenId;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct Tokenizer {
    model: Arc<dyn LoadedModel>,
}

impl fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tokenizer")
            .field("n_vocab", &self.model.n_vocab())
            .finish()
    }
}

impl Tokenizer {
    pub fn new(model: Arc<dyn LoadedModel>) -> Self {
        Self { model }
    }

    pub fn n_vocab(&self) -> usize {
        self.model.n_vocab()
    }

    /// Tokenize `text` without adding special tokens.
    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        self.model.tokenize(text)
    }

    /// Tokenize each text and concatenate the results in order, with no
    /// separator between them.
    pub fn encode_batch<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();
        for text in texts {
            tokens.extend(self.encode(text.as_ref())?);
        }
        Ok(tokens)
    }

    /// [`Tokenizer::encode_batch`] for untyped input such as a JSON array.
    pub fn encode_values(&self, values: &[serde_json::Value]) -> Result<Vec<TokenId>> {
        let texts = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_str().ok_or_else(|| {
                    LlamaCtxError::invalid(format!(
                        "Expected all elements of array to be strings (element {} is {})",
                        i, v
                    ))
                })
            })
            .collect::<Result<Vec<&str>>>()?;
        self.encode_batch(&texts)
    }

    /// Text fragment bytes of a single token.
    pub fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>> {
        self.check_token(token)?;
        self.model.token_piece(token)
    }

    /// Concatenate the text fragments of `tokens`. Empty fragments
    /// (control tokens such as EOS) contribute nothing.
    pub fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        let mut bytes = Vec::new();
        for &token in tokens {
            let piece = self.token_bytes(token)?;
            if piece.is_empty() {
                continue;
            }
            bytes.extend_from_slice(&piece);
        }
        // Fragments may split a multi-byte character, so convert once at the end
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// [`Tokenizer::decode`] for untyped numeric input. Every number must be
    /// an integral, in-vocabulary token id.
    pub fn decode_batch(&self, values: &[f64]) -> Result<String> {
        let tokens = values
            .iter()
            .map(|&v| {
                if !v.is_finite() || v.fract() != 0.0 || v < i32::MIN as f64 || v > i32::MAX as f64
                {
                    return Err(LlamaCtxError::invalid(format!(
                        "Expected all elements of array to be token ids, got {}",
                        v
                    )));
                }
                Ok(TokenId(v as i32))
            })
            .collect::<Result<Vec<TokenId>>>()?;
        self.decode(&tokens)
    }

    pub fn token_bos(&self) -> TokenId {
        self.model.token_bos()
    }

    pub fn token_eos(&self) -> TokenId {
        self.model.token_eos()
    }

    pub fn token_nl(&self) -> TokenId {
        self.model.token_nl()
    }

    fn check_token(&self, token: TokenId) -> Result<()> {
        let n_vocab = self.model.n_vocab();
        if token.is_in_vocab(n_vocab) {
            Ok(())
        } else {
            Err(LlamaCtxError::invalid(format!(
                "token {} is outside the vocabulary (size {})",
                token, n_vocab
            )))
        }
    }
}
