//! Vocabulary token ids

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of an entry in the loaded model's vocabulary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TokenId(pub i32);

impl TokenId {
    /// Vocabulary index, if the id is non-negative.
    pub fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }

    /// Whether the id addresses an entry of a vocabulary with `n_vocab` entries.
    pub fn is_in_vocab(self, n_vocab: usize) -> bool {
        self.index().is_some_and(|i| i < n_vocab)
    }
}

impl From<i32> for TokenId {
    fn from(id: i32) -> Self {
        TokenId(id)
    }
}

impl From<TokenId> for i32 {
    fn from(token: TokenId) -> Self {
        token.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
