use thiserror::Error;

use umi_net::NetError;
use umi_store::StoreError;

#[derive(Debug, Error)]
pub enum ClientError {
    /// REST call failed: transport error, timeout or non-2xx status.
    #[error("Request failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No conversation selected")]
    NoPeerSelected,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
