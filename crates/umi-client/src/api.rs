//! REST endpoints consumed by the chat and notification layers.
//!
//! [`ChatApi`] is the seam the session and notification service depend on;
//! [`RestClient`] is the reqwest implementation. Every request carries the
//! bearer token and is bounded by the configured timeout.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use umi_shared::protocol::{ChatMessage, CountResponse, Notification, UserSummary};
use umi_shared::{MessageId, NotificationId, UserId};

use crate::error::Result;

/// Implementations are cheap handles; clones share one connection pool.
pub trait ChatApi: Clone + Send + Sync + 'static {
    /// One page of history with `peer`, most recent first.
    fn messages(
        &self,
        peer: UserId,
        page: u32,
        size: u32,
    ) -> impl Future<Output = Result<Vec<ChatMessage>>> + Send;

    fn mark_message_read(&self, id: MessageId) -> impl Future<Output = Result<()>> + Send;

    fn unread_counts(&self) -> impl Future<Output = Result<HashMap<UserId, u32>>> + Send;

    fn notifications(&self) -> impl Future<Output = Result<Vec<Notification>>> + Send;

    fn notification_count(&self) -> impl Future<Output = Result<u32>> + Send;

    fn mark_notification_read(&self, id: NotificationId)
        -> impl Future<Output = Result<()>> + Send;

    fn mark_all_notifications_read(&self) -> impl Future<Output = Result<()>> + Send;

    fn all_users(&self) -> impl Future<Output = Result<Vec<UserSummary>>> + Send;

    fn search_users(&self, query: &str) -> impl Future<Output = Result<Vec<UserSummary>>> + Send;
}

#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RestClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        debug!(path, "GET");
        let response = self
            .request(Method::GET, path)
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn put(&self, path: &str) -> Result<()> {
        debug!(path, "PUT");
        self.request(Method::PUT, path)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl ChatApi for RestClient {
    async fn messages(&self, peer: UserId, page: u32, size: u32) -> Result<Vec<ChatMessage>> {
        self.get_json(
            &format!("/messages/{peer}"),
            &[("page", page.to_string()), ("size", size.to_string())],
        )
        .await
    }

    async fn mark_message_read(&self, id: MessageId) -> Result<()> {
        self.put(&format!("/messages/{id}/read")).await
    }

    async fn unread_counts(&self) -> Result<HashMap<UserId, u32>> {
        let raw: HashMap<String, u32> = self.get_json("/messages/unread-counts", &[]).await?;
        Ok(parse_unread_counts(raw))
    }

    async fn notifications(&self) -> Result<Vec<Notification>> {
        self.get_json("/notifications", &[]).await
    }

    async fn notification_count(&self) -> Result<u32> {
        let count: CountResponse = self.get_json("/notifications/count", &[]).await?;
        Ok(count.count)
    }

    async fn mark_notification_read(&self, id: NotificationId) -> Result<()> {
        self.put(&format!("/notifications/{id}/read")).await
    }

    async fn mark_all_notifications_read(&self) -> Result<()> {
        self.put("/notifications/read-all").await
    }

    async fn all_users(&self) -> Result<Vec<UserSummary>> {
        self.get_json("/users/all", &[]).await
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>> {
        self.get_json("/users/search", &[("query", query.to_string())])
            .await
    }
}

/// JSON object keys are strings; entries that are not user ids are dropped.
fn parse_unread_counts(raw: HashMap<String, u32>) -> HashMap<UserId, u32> {
    raw.into_iter()
        .filter_map(|(key, count)| match key.parse::<i64>() {
            Ok(id) => Some((UserId(id), count)),
            Err(_) => {
                warn!(key = %key, "Ignoring unread count with non-numeric peer id");
                None
            }
        })
        .collect()
}
