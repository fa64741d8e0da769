use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use axis_db::Database;
use axis_types::api::Claims;
use axis_types::events::{GatewayCommand, RealtimeEvent};

use crate::dispatcher::{Broadcast, Dispatcher};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// The first frame must be a valid Identify within this window.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

type Subscriptions = Arc<RwLock<HashSet<Uuid>>>;

/// Per-connection state shared with the command handler.
struct ConnCtx {
    dispatcher: Dispatcher,
    db: Arc<Database>,
    user_id: Uuid,
    username: String,
    subscriptions: Subscriptions,
    reply_tx: mpsc::UnboundedSender<RealtimeEvent>,
}

impl ConnCtx {
    fn is_subscribed(&self, room_id: Uuid) -> bool {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&room_id)
    }

    fn reply(&self, event: RealtimeEvent) {
        let _ = self.reply_tx.send(event);
    }

    fn reply_error(&self, code: &str, message: impl Into<String>) {
        self.reply(RealtimeEvent::Error {
            code: code.to_string(),
            message: message.into(),
        });
    }
}

/// Handle a single WebSocket connection: Identify handshake, then the event loop.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let (user_id, username) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = RealtimeEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    let broadcast_rx = dispatcher.subscribe();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();

    let ctx = ConnCtx {
        dispatcher: dispatcher.clone(),
        db,
        user_id,
        username: username.clone(),
        subscriptions: Arc::new(RwLock::new(HashSet::new())),
        reply_tx,
    };

    run_connection_loop(sender, receiver, broadcast_rx, reply_rx, ctx).await;

    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut broadcast_rx: broadcast::Receiver<Broadcast>,
    mut reply_rx: mpsc::UnboundedReceiver<RealtimeEvent>,
    ctx: ConnCtx,
) {
    let user_id = ctx.user_id;
    let send_subscriptions = ctx.subscriptions.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    // Forward room traffic + direct replies -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let msg = match result {
                        Ok(msg) => msg,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} messages", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    match msg {
                        Broadcast::Event { room_id, json } => {
                            if let Some(room_id) = room_id {
                                let subs = send_subscriptions.read().unwrap_or_else(PoisonError::into_inner);
                                if !subs.contains(&room_id) {
                                    continue;
                                }
                            }
                            if sender.send(Message::Text(json.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                        Broadcast::Revoke { room_id, user_id: target } => {
                            if target.is_some_and(|t| t != user_id) {
                                continue;
                            }
                            let removed = send_subscriptions
                                .write()
                                .unwrap_or_else(PoisonError::into_inner)
                                .remove(&room_id);
                            if removed
                                && send_event(&mut sender, &RealtimeEvent::Unsubscribed { room_id }).await.is_err()
                            {
                                break;
                            }
                        }
                    }
                }
                reply = reply_rx.recv() => {
                    let Some(event) = reply else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
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
                    if sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => handle_command(&ctx, cmd).await,
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            ctx.username,
                            ctx.user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        ctx.reply_error("bad_command", e.to_string());
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &RealtimeEvent,
) -> Result<(), ()> {
    let text = serde_json::to_string(event).map_err(|e| warn!("Failed to serialize event: {}", e))?;
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, identify).await.ok().flatten()
}

async fn handle_command(ctx: &ConnCtx, cmd: GatewayCommand) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::Subscribe { room_id } => {
            let db = ctx.db.clone();
            let (rid, uid) = (room_id.to_string(), ctx.user_id.to_string());
            let allowed = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
                Ok(db.get_room(&rid)?.is_some() && db.get_participant(&rid, &uid)?.is_some())
            })
            .await;

            match allowed {
                Ok(Ok(true)) => {
                    info!("{} ({}) subscribed to room {}", ctx.username, ctx.user_id, room_id);
                    ctx.subscriptions
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(room_id);
                    ctx.reply(RealtimeEvent::Subscribed { room_id });
                    // Joining counts as a first heartbeat
                    ctx.dispatcher.broadcast(RealtimeEvent::Heartbeat {
                        room_id,
                        user_id: ctx.user_id,
                        username: ctx.username.clone(),
                    });
                }
                Ok(Ok(false)) => {
                    debug!("{} ({}) denied room {}", ctx.username, ctx.user_id, room_id);
                    ctx.reply_error("forbidden", format!("not a participant of room {}", room_id));
                }
                Ok(Err(e)) => {
                    warn!("Membership lookup failed for room {}: {:#}", room_id, e);
                    ctx.reply_error("internal", "membership lookup failed");
                }
                Err(e) => {
                    warn!("spawn_blocking join error: {}", e);
                    ctx.reply_error("internal", "membership lookup failed");
                }
            }
        }

        GatewayCommand::Unsubscribe { room_id } => {
            ctx.subscriptions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&room_id);
            ctx.reply(RealtimeEvent::Unsubscribed { room_id });
        }

        GatewayCommand::Heartbeat { room_id } => {
            if !ctx.is_subscribed(room_id) {
                ctx.reply_error("not_subscribed", format!("subscribe to room {} first", room_id));
                return;
            }
            trace!("{} ({}) heartbeat in {}", ctx.username, ctx.user_id, room_id);
            ctx.dispatcher.broadcast(RealtimeEvent::Heartbeat {
                room_id,
                user_id: ctx.user_id,
                username: ctx.username.clone(),
            });
        }

        GatewayCommand::Typing { room_id, is_typing } => {
            if !ctx.is_subscribed(room_id) {
                ctx.reply_error("not_subscribed", format!("subscribe to room {} first", room_id));
                return;
            }
            ctx.dispatcher.broadcast(RealtimeEvent::Typing {
                room_id,
                user_id: ctx.user_id,
                username: ctx.username.clone(),
                is_typing,
            });
        }
    }
}
