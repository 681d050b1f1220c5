//! Broker connection manager with a tokio command/notification pattern.
//!
//! A single background task owns the transport, the STOMP session and the
//! subscription table. [`ConnectionManager`] handles talk to it through a
//! command channel, so subscribe/unsubscribe calls are serialized with the
//! resubscription that follows a reconnect. Handlers run on that task in
//! frame arrival order and must not block; forwarding into a channel is the
//! intended use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use umi_shared::constants::{
    HANDSHAKE_TIMEOUT_MS, HEARTBEAT_MS, MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY_MS,
};
use umi_shared::stomp::{negotiate_heartbeat, parse_heartbeat, Command, Decoded, Frame, FrameDecoder};
use umi_shared::ConnectionState;

use crate::error::NetError;
use crate::transport::{Connector, Link};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A MESSAGE frame routed to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The topic the handler was registered for.
    pub topic: String,
    /// Raw frame body (JSON for every topic this client uses).
    pub body: String,
    /// Broker-assigned `message-id`, if present.
    pub message_id: Option<String>,
}

pub type Handler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Value of the STOMP `host` header.
    pub host: String,
    /// Bearer token sent with CONNECT.
    pub token: Option<String>,
    /// Heart-beat interval offered in both directions (zero disables).
    pub heartbeat: Duration,
    /// Fixed delay between automatic reconnection attempts.
    pub reconnect_delay: Duration,
    /// Attempts before the manager gives up with `Failed`.
    pub max_reconnect_attempts: u32,
    /// Time allowed for CONNECTED to arrive.
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            token: None,
            heartbeat: Duration::from_millis(HEARTBEAT_MS),
            reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
        }
    }
}

/// Connection state plus the reconnection attempt in progress (0 if none).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub attempt: u32,
}

impl ConnectionStatus {
    fn new(state: ConnectionState) -> Self {
        Self { state, attempt: 0 }
    }
}

/// Commands sent *into* the manager task.
enum ManagerCommand {
    Connect(oneshot::Sender<Result<(), NetError>>),
    Subscribe {
        topic: String,
        handler: Handler,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        destination: String,
        body: String,
        reply: oneshot::Sender<Result<(), NetError>>,
    },
    Topics(oneshot::Sender<Vec<String>>),
    Disconnect(oneshot::Sender<()>),
    Shutdown,
}

/// Handle to one broker connection. Cheap to clone; all clones share the
/// same connection and subscription table.
#[derive(Clone)]
pub struct ConnectionManager {
    cmd_tx: mpsc::Sender<ManagerCommand>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &*self.status_rx.borrow())
            .finish()
    }
}

impl ConnectionManager {
    /// Spawn the manager task. Nothing is opened until [`connect`](Self::connect).
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<C: Connector>(connector: C, config: ConnectionConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (status_tx, status_rx) =
            watch::channel(ConnectionStatus::new(ConnectionState::Disconnected));

        let worker = Worker {
            connector,
            config,
            subs: HashMap::new(),
            next_sub: 0,
            link: None,
            retry: None,
            status_tx,
        };
        tokio::spawn(worker.run(cmd_rx));

        Self { cmd_tx, status_rx }
    }

    /// Open the transport and complete the STOMP handshake.
    ///
    /// Resolves immediately when already connected. On success every
    /// registered subscription is (re-)issued.
    pub async fn connect(&self) -> Result<(), NetError> {
        if self.state().is_connected() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.send(ManagerCommand::Connect(tx)).await?;
        rx.await.map_err(|_| NetError::Closed)?
    }

    /// Register `handler` for `topic`.
    ///
    /// Returns `false` and drops `handler` if the topic already has one.
    /// While disconnected the subscription is queued and issued on connect.
    pub async fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Result<bool, NetError>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(ManagerCommand::Subscribe {
            topic: topic.into(),
            handler: Arc::new(handler),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| NetError::Closed)
    }

    /// Remove the handler for `topic`. Returns whether one existed.
    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<bool, NetError> {
        let (tx, rx) = oneshot::channel();
        self.send(ManagerCommand::Unsubscribe {
            topic: topic.into(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| NetError::Closed)
    }

    /// Send `body` to `destination`. Fails with `NotConnected` instead of
    /// queueing when there is no live session.
    pub async fn publish(
        &self,
        destination: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<(), NetError> {
        let (tx, rx) = oneshot::channel();
        self.send(ManagerCommand::Publish {
            destination: destination.into(),
            body: body.into(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| NetError::Closed)?
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        destination: impl Into<String>,
        payload: &T,
    ) -> Result<(), NetError> {
        let body = umi_shared::protocol::encode(payload)?;
        self.publish(destination, body).await
    }

    /// Topics currently registered, live or queued.
    pub async fn topics(&self) -> Result<Vec<String>, NetError> {
        let (tx, rx) = oneshot::channel();
        self.send(ManagerCommand::Topics(tx)).await?;
        rx.await.map_err(|_| NetError::Closed)
    }

    /// Close the session and forget every subscription.
    pub async fn disconnect(&self) -> Result<(), NetError> {
        let (tx, rx) = oneshot::channel();
        self.send(ManagerCommand::Disconnect(tx)).await?;
        rx.await.map_err(|_| NetError::Closed)
    }

    /// Disconnect and stop the manager task. Later calls fail with `Closed`.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ManagerCommand::Shutdown).await;
    }

    pub fn state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Receiver notified on every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    async fn send(&self, cmd: ManagerCommand) -> Result<(), NetError> {
        self.cmd_tx.send(cmd).await.map_err(|_| NetError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Manager task
// ---------------------------------------------------------------------------

struct Subscription {
    id: String,
    handler: Handler,
    /// SUBSCRIBE has been sent on the current link.
    live: bool,
}

struct LiveLink {
    link: Link,
    decoder: FrameDecoder,
    heartbeat_out: Option<Duration>,
    heartbeat_in: Option<Duration>,
    last_sent: Instant,
    last_seen: Instant,
}

impl LiveLink {
    fn send_deadline(&self) -> Option<Instant> {
        self.heartbeat_out.map(|d| self.last_sent + d)
    }

    /// The broker is considered gone after twice its heart-beat interval.
    fn silence_deadline(&self) -> Option<Instant> {
        self.heartbeat_in.map(|d| self.last_seen + d * 2)
    }

    async fn write(&mut self, text: String) -> Result<(), NetError> {
        self.link
            .outbound
            .send(text)
            .await
            .map_err(|_| NetError::Transport("transport closed".into()))?;
        self.last_sent = Instant::now();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Retry {
    attempt: u32,
    at: Instant,
}

enum Event {
    Command(Option<ManagerCommand>),
    Inbound(Option<String>),
    HeartbeatDue,
    BrokerSilent,
    RetryDue,
}

struct Worker<C> {
    connector: C,
    config: ConnectionConfig,
    subs: HashMap<String, Subscription>,
    next_sub: u64,
    link: Option<LiveLink>,
    retry: Option<Retry>,
    status_tx: watch::Sender<ConnectionStatus>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl<C: Connector> Worker<C> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ManagerCommand>) {
        loop {
            let event = if let Some(live) = self.link.as_mut() {
                let send_at = live.send_deadline();
                let silent_at = live.silence_deadline();
                tokio::select! {
                    cmd = cmd_rx.recv() => Event::Command(cmd),
                    text = live.link.inbound.recv() => Event::Inbound(text),
                    _ = sleep_until_opt(send_at) => Event::HeartbeatDue,
                    _ = sleep_until_opt(silent_at) => Event::BrokerSilent,
                }
            } else if let Some(retry) = self.retry {
                tokio::select! {
                    cmd = cmd_rx.recv() => Event::Command(cmd),
                    _ = tokio::time::sleep_until(retry.at) => Event::RetryDue,
                }
            } else {
                Event::Command(cmd_rx.recv().await)
            };

            match event {
                Event::Command(Some(ManagerCommand::Shutdown)) | Event::Command(None) => {
                    self.close_session().await;
                    self.subs.clear();
                    self.set_state(ConnectionState::Disconnected, 0);
                    break;
                }
                Event::Command(Some(cmd)) => self.handle_command(cmd).await,
                Event::Inbound(Some(text)) => self.handle_inbound(&text).await,
                Event::Inbound(None) => self.transport_lost("transport closed"),
                Event::HeartbeatDue => {
                    let failed = match self.link.as_mut() {
                        Some(live) => live.write("\n".to_string()).await.is_err(),
                        None => false,
                    };
                    if failed {
                        self.transport_lost("heart-beat write failed");
                    }
                }
                Event::BrokerSilent => self.transport_lost("broker heart-beat timed out"),
                Event::RetryDue => self.reconnect().await,
            }
        }

        info!("Connection manager terminated");
    }

    async fn handle_command(&mut self, cmd: ManagerCommand) {
        match cmd {
            ManagerCommand::Connect(reply) => {
                let result = if self.link.is_some() {
                    Ok(())
                } else {
                    // An explicit connect supersedes any pending retry.
                    self.retry = None;
                    match self.establish(0).await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            warn!(error = %e, "Broker handshake failed");
                            self.set_state(ConnectionState::Errored, 0);
                            Err(e)
                        }
                    }
                };
                let _ = reply.send(result);
            }

            ManagerCommand::Subscribe {
                topic,
                handler,
                reply,
            } => {
                if self.subs.contains_key(&topic) {
                    debug!(topic = %topic, "Already subscribed, skipping");
                    let _ = reply.send(false);
                    return;
                }
                let id = format!("sub-{}", self.next_sub);
                self.next_sub += 1;
                self.subs.insert(
                    topic.clone(),
                    Subscription {
                        id: id.clone(),
                        handler,
                        live: false,
                    },
                );
                if self.link.is_some() {
                    self.issue_subscribe(&topic).await;
                } else {
                    debug!(topic = %topic, "Not connected, subscription queued");
                }
                let _ = reply.send(true);
            }

            ManagerCommand::Unsubscribe { topic, reply } => {
                let removed = self.subs.remove(&topic);
                let mut failed = false;
                if let Some(sub) = removed.as_ref().filter(|s| s.live) {
                    if let Some(live) = self.link.as_mut() {
                        failed = live.write(Frame::unsubscribe(&sub.id).encode()).await.is_err();
                    }
                }
                if failed {
                    self.transport_lost("unsubscribe write failed");
                }
                if removed.is_some() {
                    info!(topic = %topic, "Unsubscribed");
                }
                let _ = reply.send(removed.is_some());
            }

            ManagerCommand::Publish {
                destination,
                body,
                reply,
            } => {
                let result = match self.link.as_mut() {
                    None => Err(NetError::NotConnected),
                    Some(live) => live
                        .write(Frame::send(&destination, body).encode())
                        .await
                        .map_err(|e| NetError::Publish(e.to_string())),
                };
                match result {
                    Ok(()) => debug!(destination = %destination, "Published frame"),
                    Err(NetError::Publish(_)) => self.transport_lost("publish write failed"),
                    Err(_) => {}
                }
                if let Err(ref e) = result {
                    warn!(destination = %destination, error = %e, "Publish rejected");
                }
                let _ = reply.send(result);
            }

            ManagerCommand::Topics(reply) => {
                let _ = reply.send(self.subs.keys().cloned().collect());
            }

            ManagerCommand::Disconnect(reply) => {
                self.close_session().await;
                self.retry = None;
                self.subs.clear();
                self.set_state(ConnectionState::Disconnected, 0);
                info!("Disconnected from broker");
                let _ = reply.send(());
            }

            ManagerCommand::Shutdown => {}
        }
    }

    /// Open a link, run the handshake and replay subscriptions.
    async fn establish(&mut self, attempt: u32) -> Result<(), NetError> {
        self.set_state(ConnectionState::Connecting, attempt);

        let offered = self.config.heartbeat.as_millis() as u64;
        let connect = Frame::connect(
            &self.config.host,
            self.config.token.as_deref(),
            (offered, offered),
        );
        let (link, decoder, connected) = tokio::time::timeout(
            self.config.handshake_timeout,
            open_session(&self.connector, connect),
        )
        .await
        .map_err(|_| NetError::Handshake("timed out opening broker session".into()))??;

        let theirs = connected
            .get("heart-beat")
            .and_then(parse_heartbeat)
            .unwrap_or((0, 0));
        let (out_ms, in_ms) = negotiate_heartbeat((offered, offered), theirs);
        let now = Instant::now();
        self.link = Some(LiveLink {
            link,
            decoder,
            heartbeat_out: (out_ms > 0).then(|| Duration::from_millis(out_ms)),
            heartbeat_in: (in_ms > 0).then(|| Duration::from_millis(in_ms)),
            last_sent: now,
            last_seen: now,
        });
        self.set_state(ConnectionState::Connected, 0);
        info!(
            version = connected.get("version").unwrap_or("?"),
            heartbeat_out = out_ms,
            heartbeat_in = in_ms,
            "Connected to broker"
        );

        self.replay_subscriptions().await;
        Ok(())
    }

    async fn replay_subscriptions(&mut self) {
        let topics: Vec<String> = self.subs.keys().cloned().collect();
        for topic in &topics {
            if self.link.is_none() {
                break;
            }
            self.issue_subscribe(topic).await;
        }
        if !topics.is_empty() {
            info!(count = topics.len(), "Subscriptions re-established");
        }
    }

    async fn issue_subscribe(&mut self, topic: &str) {
        let (Some(sub), Some(live)) = (self.subs.get_mut(topic), self.link.as_mut()) else {
            return;
        };
        let written = live.write(Frame::subscribe(&sub.id, topic).encode()).await;
        match written {
            Ok(()) => {
                sub.live = true;
                info!(topic = %topic, id = %sub.id, "Subscribed");
                return;
            }
            Err(e) => error!(topic = %topic, error = %e, "Subscribe failed"),
        }
        self.transport_lost("subscribe write failed");
    }

    async fn handle_inbound(&mut self, text: &str) {
        let mut frames = Vec::new();
        {
            let Some(live) = self.link.as_mut() else {
                return;
            };
            live.last_seen = Instant::now();
            live.decoder.push(text);
            while let Some(item) = live.decoder.next_item() {
                match item {
                    Ok(Decoded::Frame(frame)) => frames.push(frame),
                    Ok(Decoded::Heartbeat) => {}
                    Err(e) => warn!(error = %e, "Dropping malformed frame"),
                }
            }
        }

        for frame in frames {
            match frame.command {
                Command::Message => self.dispatch(frame),
                Command::Error => {
                    error!(
                        message = frame.get("message").unwrap_or(""),
                        details = %frame.body,
                        "Broker reported error"
                    );
                    self.transport_lost("broker sent ERROR");
                    return;
                }
                Command::Receipt => {
                    debug!(receipt = frame.get("receipt-id").unwrap_or(""), "Receipt");
                }
                other => debug!(command = %other, "Ignoring unexpected frame"),
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        let by_id = frame
            .get("subscription")
            .and_then(|id| self.subs.iter().find(|(_, s)| s.id == id));
        let target = by_id.or_else(|| {
            frame
                .get("destination")
                .and_then(|dest| self.subs.get_key_value(dest))
        });

        match target {
            Some((topic, sub)) => {
                let delivery = Delivery {
                    topic: topic.clone(),
                    message_id: frame.get("message-id").map(str::to_string),
                    body: frame.body,
                };
                (sub.handler)(delivery);
            }
            None => debug!(
                destination = frame.get("destination").unwrap_or(""),
                "No handler for message"
            ),
        }
    }

    /// Tear down a lost link and schedule reconnection.
    fn transport_lost(&mut self, reason: &str) {
        if self.link.take().is_none() {
            return;
        }
        for sub in self.subs.values_mut() {
            sub.live = false;
        }
        warn!(reason, "Broker connection lost");
        self.schedule_retry(1);
    }

    fn schedule_retry(&mut self, attempt: u32) {
        if attempt > self.config.max_reconnect_attempts {
            self.retry = None;
            error!(
                attempts = self.config.max_reconnect_attempts,
                "Max reconnection attempts reached"
            );
            self.set_state(ConnectionState::Failed, 0);
            return;
        }
        self.retry = Some(Retry {
            attempt,
            at: Instant::now() + self.config.reconnect_delay,
        });
        self.set_state(ConnectionState::Disconnected, attempt);
    }

    async fn reconnect(&mut self) {
        let Some(retry) = self.retry.take() else {
            return;
        };
        info!(attempt = retry.attempt, "Attempting to reconnect");
        if let Err(e) = self.establish(retry.attempt).await {
            warn!(attempt = retry.attempt, error = %e, "Reconnect attempt failed");
            self.schedule_retry(retry.attempt + 1);
        }
    }

    async fn close_session(&mut self) {
        if let Some(mut live) = self.link.take() {
            let _ = live.write(Frame::disconnect().encode()).await;
        }
        for sub in self.subs.values_mut() {
            sub.live = false;
        }
    }

    fn set_state(&self, state: ConnectionState, attempt: u32) {
        let status = ConnectionStatus { state, attempt };
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            debug!(state = %state, attempt, "Connection status changed");
        }
    }
}

/// Open a link and send CONNECT; resolves once the broker answers.
async fn open_session<C: Connector>(
    connector: &C,
    connect: Frame,
) -> Result<(Link, FrameDecoder, Frame), NetError> {
    let mut link = connector.open().await?;
    link.outbound
        .send(connect.encode())
        .await
        .map_err(|_| NetError::Transport("transport closed before CONNECT".into()))?;

    let mut decoder = FrameDecoder::new();
    let connected = await_connected(&mut link, &mut decoder).await?;
    Ok((link, decoder, connected))
}

async fn await_connected(link: &mut Link, decoder: &mut FrameDecoder) -> Result<Frame, NetError> {
    loop {
        while let Some(item) = decoder.next_item() {
            match item? {
                Decoded::Heartbeat => {}
                Decoded::Frame(frame) => match frame.command {
                    Command::Connected => return Ok(frame),
                    Command::Error => {
                        let message = frame.get("message").unwrap_or("broker refused").to_string();
                        return Err(NetError::Handshake(message));
                    }
                    other => debug!(command = %other, "Ignoring frame before CONNECTED"),
                },
            }
        }
        let text = link
            .inbound
            .recv()
            .await
            .ok_or_else(|| NetError::Transport("closed during handshake".into()))?;
        decoder.push(&text);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::memory::{memory_transport, BrokerEnd, MemoryBroker};

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            heartbeat: Duration::ZERO,
            reconnect_delay: Duration::from_millis(20),
            max_reconnect_attempts: 3,
            handshake_timeout: Duration::from_millis(500),
            ..ConnectionConfig::default()
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<Delivery>>>, impl Fn(Delivery) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |d| sink.lock().unwrap().push(d))
    }

    async fn connect(manager: &ConnectionManager, broker: &mut MemoryBroker) -> BrokerEnd {
        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect().await })
        };
        let mut end = broker.accept().await.unwrap();
        end.complete_handshake().await.unwrap();
        pending.await.unwrap().unwrap();
        end
    }

    async fn wait_for(manager: &ConnectionManager, state: ConnectionState) {
        let mut rx = manager.watch_status();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
            .await
            .expect("state change timed out")
            .unwrap();
    }

    async fn settle<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_connect_sends_credentials_and_becomes_connected() {
        let (connector, mut broker) = memory_transport();
        let config = ConnectionConfig {
            token: Some("secret".into()),
            ..fast_config()
        };
        let manager = ConnectionManager::start(connector, config);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect().await })
        };
        let mut end = broker.accept().await.unwrap();
        let connect = end.complete_handshake().await.unwrap();
        pending.await.unwrap().unwrap();

        assert_eq!(connect.get("Authorization"), Some("Bearer secret"));
        assert_eq!(connect.get("accept-version"), Some("1.2"));
        assert_eq!(manager.state(), ConnectionState::Connected);

        // Re-entrant connect is a no-op
        manager.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejection_sets_errored() {
        let (connector, mut broker) = memory_transport();
        let manager = ConnectionManager::start(connector, fast_config());

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect().await })
        };
        let mut end = broker.accept().await.unwrap();
        end.reject_handshake("bad token").await.unwrap();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(NetError::Handshake(ref m)) if m == "bad token"));
        assert_eq!(manager.state(), ConnectionState::Errored);
    }

    #[tokio::test]
    async fn test_refused_transport_rejects_connect() {
        let (connector, broker) = memory_transport();
        broker.refuse_next(1);
        let manager = ConnectionManager::start(connector, fast_config());

        assert!(matches!(manager.connect().await, Err(NetError::Transport(_))));
        assert_eq!(manager.state(), ConnectionState::Errored);
    }

    struct StalledConnector;

    impl Connector for StalledConnector {
        async fn open(&self) -> Result<Link, NetError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_transport_open_times_out() {
        let config = ConnectionConfig {
            handshake_timeout: Duration::from_millis(100),
            ..fast_config()
        };
        let manager = ConnectionManager::start(StalledConnector, config);

        let result = tokio::time::timeout(Duration::from_secs(2), manager.connect())
            .await
            .expect("connect never resolved");
        assert!(matches!(result, Err(NetError::Handshake(_))));
        assert_eq!(manager.state(), ConnectionState::Errored);

        tokio::time::timeout(Duration::from_secs(2), manager.disconnect())
            .await
            .expect("worker stuck after stalled open")
            .unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_keeps_single_handler() {
        let (connector, mut broker) = memory_transport();
        let manager = ConnectionManager::start(connector, fast_config());
        let mut end = connect(&manager, &mut broker).await;

        let (first, handler_a) = recorder();
        let (second, handler_b) = recorder();
        assert!(manager.subscribe("/topic/a", handler_a).await.unwrap());
        assert!(!manager.subscribe("/topic/a", handler_b).await.unwrap());

        let sub = end.recv_frame().await.unwrap();
        assert_eq!(sub.command, Command::Subscribe);
        let id = sub.get("id").unwrap().to_string();

        end.deliver(&id, "/topic/a", "{\"n\":1}").await;
        settle(|| first.lock().unwrap().len() == 1).await;
        assert!(second.lock().unwrap().is_empty());
        assert_eq!(manager.topics().await.unwrap(), vec!["/topic/a".to_string()]);
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected_is_queued() {
        let (connector, mut broker) = memory_transport();
        let manager = ConnectionManager::start(connector, fast_config());

        let (seen, handler) = recorder();
        assert!(manager.subscribe("/user/1/queue/messages", handler).await.unwrap());

        let mut end = connect(&manager, &mut broker).await;
        let sub = end.recv_frame().await.unwrap();
        assert_eq!(sub.get("destination"), Some("/user/1/queue/messages"));

        end.deliver(sub.get("id").unwrap(), "/user/1/queue/messages", "{}")
            .await;
        settle(|| seen.lock().unwrap().len() == 1).await;
    }

    #[tokio::test]
    async fn test_routes_by_destination_when_subscription_header_unknown() {
        let (connector, mut broker) = memory_transport();
        let manager = ConnectionManager::start(connector, fast_config());
        let mut end = connect(&manager, &mut broker).await;

        let (seen, handler) = recorder();
        manager.subscribe("/topic/presence", handler).await.unwrap();
        end.recv_frame().await.unwrap();

        let frame = Frame::new(Command::Message)
            .header("destination", "/topic/presence")
            .header("message-id", "m-1")
            .with_body("{}");
        end.send_frame(&frame).await;
        settle(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(seen.lock().unwrap()[0].message_id.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn test_resubscribes_after_transport_drop() {
        let (connector, mut broker) = memory_transport();
        let manager = ConnectionManager::start(connector, fast_config());
        let mut end = connect(&manager, &mut broker).await;

        let (seen, handler) = recorder();
        manager.subscribe("/topic/a", handler).await.unwrap();
        end.recv_frame().await.unwrap();

        // Simulate the network dropping.
        drop(end);
        let mut end = broker.accept().await.unwrap();
        end.complete_handshake().await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;

        let sub = end.recv_frame().await.unwrap();
        assert_eq!(sub.command, Command::Subscribe);
        assert_eq!(sub.get("destination"), Some("/topic/a"));

        end.deliver(sub.get("id").unwrap(), "/topic/a", "{\"again\":true}")
            .await;
        settle(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(seen.lock().unwrap()[0].body, "{\"again\":true}");
    }

    #[tokio::test]
    async fn test_subscription_changes_during_retry_window_apply_on_replay() {
        let (connector, mut broker) = memory_transport();
        let config = ConnectionConfig {
            reconnect_delay: Duration::from_millis(300),
            ..fast_config()
        };
        let manager = ConnectionManager::start(connector, config);
        let mut end = connect(&manager, &mut broker).await;

        let (_, handler_a) = recorder();
        manager.subscribe("/topic/a", handler_a).await.unwrap();
        assert_eq!(end.recv_frame().await.unwrap().get("destination"), Some("/topic/a"));

        drop(end);
        let mut rx = manager.watch_status();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.state == ConnectionState::Disconnected && s.attempt > 0),
        )
        .await
        .expect("retry never scheduled")
        .unwrap();

        let (seen_b, handler_b) = recorder();
        assert!(manager.subscribe("/topic/b", handler_b).await.unwrap());
        assert!(manager.unsubscribe("/topic/a").await.unwrap());

        let mut end = broker.accept().await.unwrap();
        end.complete_handshake().await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;

        manager.publish("/app/marker", "{}").await.unwrap();
        let mut subscribed = Vec::new();
        let mut b_id = None;
        loop {
            let frame = end.recv_frame().await.unwrap();
            match frame.command {
                Command::Send => break,
                Command::Subscribe => {
                    let destination = frame.get("destination").unwrap().to_string();
                    if destination == "/topic/b" {
                        b_id = frame.get("id").map(str::to_string);
                    }
                    subscribed.push(destination);
                }
                other => panic!("unexpected frame {other}"),
            }
        }
        assert_eq!(subscribed, vec!["/topic/b".to_string()]);
        assert_eq!(manager.topics().await.unwrap(), vec!["/topic/b".to_string()]);

        end.deliver(&b_id.unwrap(), "/topic/b", "{}").await;
        settle(|| seen_b.lock().unwrap().len() == 1).await;
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (connector, mut broker) = memory_transport();
        let manager = ConnectionManager::start(connector, fast_config());
        let end = connect(&manager, &mut broker).await;

        broker.refuse_next(10);
        drop(end);
        wait_for(&manager, ConnectionState::Failed).await;

        assert!(matches!(
            manager.publish("/app/x", "{}").await,
            Err(NetError::NotConnected)
        ));

        // An explicit connect recovers from Failed.
        broker.refuse_next(0);
        let end = connect(&manager, &mut broker).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        drop(end);
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_fails() {
        let (connector, _broker) = memory_transport();
        let manager = ConnectionManager::start(connector, fast_config());
        let result = manager.publish("/app/chat.sendMessage", "{}").await;
        assert!(matches!(result, Err(NetError::NotConnected)));
    }

    #[tokio::test]
    async fn test_publish_writes_send_frame() {
        let (connector, mut broker) = memory_transport();
        let manager = ConnectionManager::start(connector, fast_config());
        let mut end = connect(&manager, &mut broker).await;

        manager
            .publish("/app/chat.messageRead", "{\"messageId\":1}")
            .await
            .unwrap();
        let frame = end.recv_frame().await.unwrap();
        assert_eq!(frame.command, Command::Send);
        assert_eq!(frame.get("destination"), Some("/app/chat.messageRead"));
        assert_eq!(frame.body, "{\"messageId\":1}");
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (connector, mut broker) = memory_transport();
        let manager = ConnectionManager::start(connector, fast_config());
        let mut end = connect(&manager, &mut broker).await;

        let (_seen, handler) = recorder();
        manager.subscribe("/topic/a", handler).await.unwrap();
        let sub = end.recv_frame().await.unwrap();

        assert!(manager.unsubscribe("/topic/a").await.unwrap());
        let unsub = end.recv_frame().await.unwrap();
        assert_eq!(unsub.command, Command::Unsubscribe);
        assert_eq!(unsub.get("id"), sub.get("id"));

        assert!(!manager.unsubscribe("/topic/a").await.unwrap());
        assert!(!manager.unsubscribe("/topic/never").await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_clears_subscriptions() {
        let (connector, mut broker) = memory_transport();
        let manager = ConnectionManager::start(connector, fast_config());
        let mut end = connect(&manager, &mut broker).await;

        let (_seen, handler) = recorder();
        manager.subscribe("/topic/a", handler).await.unwrap();
        end.recv_frame().await.unwrap();

        manager.disconnect().await.unwrap();
        let frame = end.recv_frame().await.unwrap();
        assert_eq!(frame.command, Command::Disconnect);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.topics().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broker_error_frame_triggers_reconnect() {
        let (connector, mut broker) = memory_transport();
        let manager = ConnectionManager::start(connector, fast_config());
        let end = connect(&manager, &mut broker).await;

        let error = Frame::new(Command::Error).header("message", "boom");
        end.send_frame(&error).await;

        let mut end = broker.accept().await.unwrap();
        end.complete_handshake().await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_outgoing_heartbeats_are_sent() {
        let (connector, mut broker) = memory_transport();
        let config = ConnectionConfig {
            heartbeat: Duration::from_millis(20),
            ..fast_config()
        };
        let manager = ConnectionManager::start(connector, config);

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect().await })
        };
        let mut end = broker.accept().await.unwrap();
        // Broker wants client beats every 20ms and sends none itself.
        end.complete_handshake_with("0,20").await.unwrap();
        pending.await.unwrap().unwrap();

        let raw = tokio::time::timeout(Duration::from_secs(2), end.recv_raw())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw, "\n");
    }

    #[tokio::test]
    async fn test_silent_broker_triggers_reconnect() {
        let (connector, mut broker) = memory_transport();
        let config = ConnectionConfig {
            heartbeat: Duration::from_millis(20),
            ..fast_config()
        };
        let manager = ConnectionManager::start(connector, config);

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect().await })
        };
        let mut end = broker.accept().await.unwrap();
        // Broker promises beats every 20ms, then goes quiet.
        end.complete_handshake_with("20,0").await.unwrap();
        pending.await.unwrap().unwrap();

        let mut second = tokio::time::timeout(Duration::from_secs(2), broker.accept())
            .await
            .expect("no reconnect after silence")
            .unwrap();
        second.complete_handshake().await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;
        drop(end);
    }

    #[tokio::test]
    async fn test_shutdown_closes_handles() {
        let (connector, _broker) = memory_transport();
        let manager = ConnectionManager::start(connector, fast_config());
        manager.shutdown().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(manager.topics().await, Err(NetError::Closed)));
    }
}
