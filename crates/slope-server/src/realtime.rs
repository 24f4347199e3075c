//! Realtime socket: one subscription per connection.
//!
//! The client sends `Subscribe`, the server answers `Subscribed` and then
//! streams `Change` frames until either side goes away.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{
    Extension,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use slope_store::{ChangeStream, DataStore, LocalStore};
use slope_types::events::{RealtimeCommand, RealtimeEvent, Resource};
use slope_types::models::Principal;

use crate::AppState;

/// Server pings every 15 seconds. Two missed pongs (~30s) drop the connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Sockets that never subscribe are closed after this long.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

type Sender = SplitSink<WebSocket, Message>;
type Receiver = SplitStream<WebSocket>;

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let store = state.store.clone();
    ws.on_upgrade(move |socket| handle_connection(socket, store, principal))
}

pub async fn handle_connection(socket: WebSocket, store: LocalStore, principal: Principal) {
    let (mut sender, mut receiver) = socket.split();

    let Some((resource, stream)) = wait_for_subscribe(&mut sender, &mut receiver, &store, &principal).await else {
        warn!("{} never subscribed, closing realtime socket", principal.id);
        let _ = sender.send(Message::Close(None)).await;
        return;
    };

    if send_event(&mut sender, &RealtimeEvent::Subscribed { resource }).await.is_err() {
        return;
    }
    info!("{} subscribed to {}", principal.id, resource);

    run_connection_loop(sender, receiver, stream, &principal).await;
    info!("{} left realtime ({})", principal.id, resource);
}

async fn wait_for_subscribe(
    sender: &mut Sender,
    receiver: &mut Receiver,
    store: &LocalStore,
    principal: &Principal,
) -> Option<(Resource, ChangeStream)> {
    let handshake = async {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else {
                continue;
            };

            let (resource, filter, events) = match serde_json::from_str::<RealtimeCommand>(&text) {
                Ok(RealtimeCommand::Subscribe { resource, filter, events }) => (resource, filter, events),
                Err(e) => {
                    warn!("{} bad command: {} -- raw: {}", principal.id, e, preview(&text));
                    reject(sender, format!("bad command: {}", e)).await?;
                    continue;
                }
            };

            let columns = resource.columns();
            if let Some((column, _)) = filter.iter().find(|(c, _)| !columns.contains(c)) {
                reject(sender, format!("unknown column '{}' on {}", column, resource)).await?;
                continue;
            }

            match store.subscribe(resource, filter, events).await {
                Ok(stream) => return Some((resource, stream)),
                Err(e) => reject(sender, e.to_string()).await?,
            }
        }
        None
    };

    tokio::time::timeout(SUBSCRIBE_TIMEOUT, handshake).await.ok().flatten()
}

async fn run_connection_loop(mut sender: Sender, mut receiver: Receiver, mut stream: ChangeStream, principal: &Principal) {
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<RealtimeEvent>();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                change = stream.next() => {
                    // The store dropped us; closing lets the client reconnect
                    let Some(event) = change else { break };
                    if send_event(&mut sender, &RealtimeEvent::Change(event)).await.is_err() {
                        return;
                    }
                }
                Some(reply) = reply_rx.recv() => {
                    if send_event(&mut sender, &reply).await.is_err() {
                        return;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let user_id = principal.id;
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    debug!("{} sent a command after subscribing: {}", user_id, preview(&text));
                    let _ = reply_tx.send(RealtimeEvent::Error {
                        message: "this socket already has a subscription".into(),
                    });
                }
                Message::Pong(_) => pong_flag_recv.store(true, Ordering::Release),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

async fn send_event(sender: &mut Sender, event: &RealtimeEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => sender.send(Message::Text(text.into())).await,
        Err(e) => {
            warn!("Dropping unserializable realtime frame: {}", e);
            Ok(())
        }
    }
}

async fn reject(sender: &mut Sender, message: String) -> Option<()> {
    send_event(sender, &RealtimeEvent::Error { message }).await.ok()
}

fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}
