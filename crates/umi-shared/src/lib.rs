//! Types, wire payloads and the STOMP frame codec shared by every umi crate.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod stomp;
pub mod types;

pub use error::{FrameError, PayloadError};
pub use stomp::{Frame, FrameDecoder};
pub use types::{ConnectionState, LocalId, MessageId, NotificationId, UserId};
