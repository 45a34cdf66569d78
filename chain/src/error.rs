use bitcoin::BlockHash;
use storage::StorageError;
use thiserror::Error;

/// Categorized consensus or policy rejection.
///
/// `kind` is the coarse category callers branch on, `code` the precise
/// reject reason (`bad-txns-*` style), `score` the ban weight the peer
/// layer applies (0 = informational, 100 = ban-worthy).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {code} (score {score})")]
pub struct ValidationError {
    pub kind: &'static str,
    pub code: String,
    pub score: u32,
}

impl ValidationError {
    pub fn new(kind: &'static str, code: impl Into<String>, score: u32) -> Self {
        Self {
            kind,
            code: code.into(),
            score,
        }
    }

    pub fn invalid(code: impl Into<String>, score: u32) -> Self {
        Self::new("invalid", code, score)
    }

    pub fn nonstandard(code: impl Into<String>) -> Self {
        Self::new("nonstandard", code, 0)
    }

    pub fn is_ban_worthy(&self) -> bool {
        self.score >= 100
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Verification(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("malformed data: {0}")]
    Format(String),

    #[error("reorganization past the prune horizon at {0}")]
    ReorgTooDeep(BlockHash),

    #[error("unknown network selector: {0}")]
    UnknownNetwork(String),
}

impl ChainError {
    /// The validation rejection, if this error is one.
    pub fn verification(&self) -> Option<&ValidationError> {
        match self {
            ChainError::Verification(err) => Some(err),
            _ => None,
        }
    }
}
