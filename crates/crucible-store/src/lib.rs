//! Durable script storage: a log-structured engine with fsync-synchronous
//! writes plus an in-memory radix index for unique-prefix key resolution.

mod engine;
pub mod kv;
pub mod radix;

pub use engine::LogEngine;
pub use kv::{KvStore, KEY_LEN};
pub use radix::{PrefixMatch, RadixTree};

use std::io;
use std::path::PathBuf;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt log: {0}")]
    Corrupt(String),
    #[error("record encoding error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("key not found")]
    NotFound,
    #[error("multiple keys match the prefix")]
    MultipleMatches,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> StoreError {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}
