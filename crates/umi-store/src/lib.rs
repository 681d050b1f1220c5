//! # umi-store
//!
//! In-memory client state for chat and notifications.
//!
//! Each store is owned by exactly one component and mutated only through its
//! own methods, from a single task. Nothing here performs I/O: callers fetch
//! from the REST API or the broker and hand the results to the stores, which
//! reconcile them (deduplication by id, optimistic entries, unread counters).

pub mod conversation;
pub mod feed;
pub mod models;

mod error;

pub use conversation::{AppendOutcome, ConversationStore, MergeOutcome, PageState};
pub use error::StoreError;
pub use feed::NotificationFeed;
pub use models::*;
