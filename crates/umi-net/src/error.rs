use thiserror::Error;

use umi_shared::FrameError;

#[derive(Error, Debug)]
pub enum NetError {
    /// The transport could not be opened or was lost.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The broker refused or never answered the CONNECT frame.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Connection manager is shut down")]
    Closed,

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Payload error: {0}")]
    Payload(#[from] umi_shared::PayloadError),
}
