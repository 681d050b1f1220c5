use thiserror::Error;

use umi_shared::LocalId;

/// Errors produced by the store layer.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// A message must have visible content.
    #[error("Message content is empty")]
    EmptyContent,

    /// No optimistic entry with this temporary id.
    #[error("Unknown local message: {0}")]
    UnknownMessage(LocalId),

    /// Only failed sends can be retried.
    #[error("Message {0} is not in failed state")]
    NotFailed(LocalId),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
