//! Terminal chat client.
//!
//! Usage: `umi-chat <user-id> <username> <peer-id>`
//!
//! Every stdin line is sent to the selected peer. Lines starting with `/`
//! are commands:
//! - `/peer <id>` switch conversation
//! - `/more` load older history
//! - `/retry` re-send failed messages
//! - `/users [query]` list or search users
//! - `/read-all` mark all notifications read
//! - `/quit`

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use umi_client::{
    init_tracing, ChatSession, ClientConfig, ClientEvent, EventSink, NotificationService,
    PageOutcome, PageRequest, PageResponse, RestClient,
};
use umi_net::{ConnectionManager, WsConnector};
use umi_shared::UserId;
use umi_store::{DeliveryStatus, Message};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [me, username, peer] = args.as_slice() else {
        bail!("usage: umi-chat <user-id> <username> <peer-id>");
    };
    let me = UserId(me.parse().context("invalid user id")?);
    let peer = UserId(peer.parse().context("invalid peer id")?);

    let config = ClientConfig::from_env();
    config.validate()?;
    info!(api = %config.api_url, ws = %config.ws_url, "Starting umi chat v{}", env!("CARGO_PKG_VERSION"));

    let api = RestClient::new(
        config.api_url.clone(),
        config.token.clone(),
        config.request_timeout,
    )?;
    let conn = ConnectionManager::start(
        WsConnector::new(config.ws_url.clone()),
        config.connection_config(),
    );

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut chat = ChatSession::new(
        me,
        api.clone(),
        conn.clone(),
        config.page_size,
        EventSink::new(events_tx.clone()),
    );
    let mut notes =
        NotificationService::new(username.clone(), api, conn.clone(), EventSink::new(events_tx));

    let mut inbound = chat.subscribe().await?;
    let mut pushes = notes.subscribe().await?;
    conn.connect().await.context("broker connection failed")?;

    if let Err(e) = chat.load_unread_counts().await {
        warn!(error = %e, "Unread counts unavailable");
    }
    match notes.load_initial().await {
        Ok(unread) => println!("* {unread} unread notification(s)"),
        Err(e) => warn!(error = %e, "Notifications unavailable"),
    }

    let (pages_tx, mut pages) = mpsc::channel::<PageResponse>(8);
    let request = chat.select_peer(peer).await;
    spawn_fetch(&chat, request, &pages_tx);

    let mut status = conn.watch_status();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(message) = inbound.recv() => chat.handle_inbound(message).await,
            Some(update) = pushes.recv() => {
                notes.on_push(update);
            }
            Some(response) = pages.recv() => match chat.apply_page(response).await {
                Ok(PageOutcome::Applied(outcome)) => {
                    info!(inserted = outcome.inserted, has_more = outcome.has_more, "History loaded");
                    render(&chat);
                }
                Ok(PageOutcome::Stale) => {}
                Err(e) => eprintln!("! could not load history: {e}"),
            },
            Ok(()) = status.changed() => {
                let current = *status.borrow_and_update();
                chat.on_connection_status(current);
                println!("* connection {} (attempt {})", current.state, current.attempt);
            }
            Some(event) = events.recv() => show(&chat, event),
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&mut chat, &mut notes, &pages_tx, line.trim()).await {
                    break;
                }
            }
        }
    }

    conn.disconnect().await.ok();
    conn.shutdown().await;
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_line(
    chat: &mut ChatSession<RestClient>,
    notes: &mut NotificationService<RestClient>,
    pages: &mpsc::Sender<PageResponse>,
    line: &str,
) -> bool {
    let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "/quit" => return false,
        "/peer" => match arg.trim().parse() {
            Ok(id) => {
                let request = chat.select_peer(UserId(id)).await;
                spawn_fetch(chat, request, pages);
            }
            Err(_) => eprintln!("! usage: /peer <id>"),
        },
        "/more" => match chat.load_more() {
            Some(request) => spawn_fetch(chat, request, pages),
            None => println!("* no older messages"),
        },
        "/retry" => {
            let failed: Vec<_> = chat
                .conversation()
                .iter()
                .filter(|m| m.status == DeliveryStatus::Failed)
                .filter_map(|m| m.local_id())
                .collect();
            for local in failed {
                if let Err(e) = chat.retry_failed(local).await {
                    eprintln!("! retry failed: {e}");
                }
            }
        }
        "/users" => match chat.search_users(arg).await {
            Ok(users) => {
                for user in users {
                    let online = if chat.is_online(user.id) { "online" } else { "" };
                    println!(
                        "  {:>6} {} {online}",
                        user.id,
                        user.username.as_deref().unwrap_or("?")
                    );
                }
            }
            Err(e) => eprintln!("! {e}"),
        },
        "/read-all" => {
            if let Err(e) = notes.mark_all_read().await {
                eprintln!("! {e}");
            }
        }
        _ => {
            if let Err(e) = chat.send(line).await {
                eprintln!("! not sent: {e}");
            }
        }
    }
    true
}

fn spawn_fetch(
    chat: &ChatSession<RestClient>,
    request: PageRequest,
    pages: &mpsc::Sender<PageResponse>,
) {
    let api = chat.api().clone();
    let pages = pages.clone();
    tokio::spawn(async move {
        let response = request.fetch(&api).await;
        let _ = pages.send(response).await;
    });
}

fn show(chat: &ChatSession<RestClient>, event: ClientEvent) {
    match event {
        ClientEvent::ConversationChanged { peer } if chat.selected() == Some(peer) => {
            if let Some(last) = chat.store().latest(peer, 1).first() {
                print_message(chat.me(), last);
            }
        }
        ClientEvent::MessageFailed { local, error } => {
            println!("! message {} failed: {error} (/retry)", local.short());
        }
        ClientEvent::UnreadChanged { peer, count } if count > 0 => {
            println!("* {count} unread from {peer}");
        }
        ClientEvent::NotificationsChanged { unread } => {
            println!("* {unread} unread notification(s)");
        }
        _ => {}
    }
}

fn render(chat: &ChatSession<RestClient>) {
    for message in chat.conversation() {
        print_message(chat.me(), message);
    }
}

fn print_message(me: UserId, message: &Message) {
    let who = if message.sender_id == me {
        "me".to_string()
    } else {
        message.sender_id.to_string()
    };
    let mark = match message.status {
        DeliveryStatus::Pending => " …",
        DeliveryStatus::Failed => " !",
        DeliveryStatus::Confirmed if message.read => " ✓✓",
        DeliveryStatus::Confirmed => " ✓",
    };
    println!(
        "[{}] {who}: {}{mark}",
        message.timestamp.format("%H:%M"),
        message.content
    );
}
