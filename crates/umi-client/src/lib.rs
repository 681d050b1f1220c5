//! # umi-client
//!
//! Chat and notification controllers on top of the broker connection and the
//! in-memory stores, plus the REST client they read from.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod notifications;
pub mod session;

use tracing_subscriber::{fmt, EnvFilter};

pub use api::{ChatApi, RestClient};
pub use config::ClientConfig;
pub use error::ClientError;
pub use events::{ClientEvent, EventSink};
pub use notifications::NotificationService;
pub use session::{ChatSession, Inbound, PageOutcome, PageRequest, PageResponse};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("umi_chat=info,umi_client=debug,umi_net=debug,umi_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
