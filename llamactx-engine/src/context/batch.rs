//! Decode request construction

use crate::error::{LlamaCtxError, Result};
use crate::token::TokenId;

/// One token of a decode request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchItem {
    pub token: TokenId,
    /// Position in the sequence cache
    pub position: usize,
    pub seq_id: i32,
    /// Whether the backend must retain logits for this item
    pub logits: bool,
}

/// A single decode request for sequence 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    items: Vec<BatchItem>,
}

impl TokenBatch {
    /// Lay out `tokens` at positions `cursor, cursor + 1, ...`.
    ///
    /// Only the last item requests logits.
    pub fn for_sequence(tokens: &[TokenId], cursor: usize) -> Result<Self> {
        if tokens.is_empty() {
            return Err(LlamaCtxError::invalid("token sequence is empty"));
        }

        let last = tokens.len() - 1;
        let items: Vec<BatchItem> = tokens
            .iter()
            .enumerate()
            .map(|(i, &token)| BatchItem {
                token,
                position: cursor + i,
                seq_id: 0,
                logits: i == last,
            })
            .collect();

        Ok(Self { items })
    }

    /// Like [`TokenBatch::for_sequence`], cut into batches of at most
    /// `max_len` items. Only the last item of the last batch requests logits.
    pub fn split_for_sequence(
        tokens: &[TokenId],
        cursor: usize,
        max_len: usize,
    ) -> Result<Vec<Self>> {
        if max_len == 0 {
            return Err(LlamaCtxError::invalid("batch size must be at least 1"));
        }
        let whole = Self::for_sequence(tokens, cursor)?;
        Ok(whole
            .items
            .chunks(max_len)
            .map(|items| Self {
                items: items.to_vec(),
            })
            .collect())
    }

    pub fn items(&self) -> &[BatchItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Batch index whose logits are retained.
    pub fn logits_index(&self) -> usize {
        self.items.len() - 1
    }

    /// Position of the first item.
    pub fn base_position(&self) -> usize {
        self.items[0].position
    }
}
