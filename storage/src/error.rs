use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("schema version mismatch: found {found}, expected {expected}")]
    Version { found: u32, expected: u32 },

    #[error("store is closed")]
    Closed,
}

impl StorageError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        StorageError::Corrupt(msg.into())
    }
}
