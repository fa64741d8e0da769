use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use axis_types::events::{GatewayCommand, RealtimeEvent};

use crate::error::SyncError;
use crate::transport::{RealtimeTransport, RoomStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Realtime transport over the server's `/gateway` WebSocket. Each room
/// gets its own socket so rooms connect, fail and retry independently.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    token: String,
}

impl WsTransport {
    /// `url` is the full gateway URL, e.g. `ws://127.0.0.1:3000/gateway`.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
        }
    }

    async fn open(&self, room_id: Uuid) -> Result<WsRoomStream, SyncError> {
        let (socket, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let mut stream = WsRoomStream {
            socket,
            room_id,
            pending: VecDeque::new(),
        };

        stream
            .send(GatewayCommand::Identify {
                token: self.token.clone(),
            })
            .await?;
        match stream.read_event().await {
            Some(Ok(RealtimeEvent::Ready { username, .. })) => debug!("gateway ready for {}", username),
            Some(Ok(RealtimeEvent::Error { code, message })) => return Err(SyncError::Rejected { code, message }),
            Some(Ok(other)) => warn!("unexpected first gateway frame: {:?}", other),
            Some(Err(e)) => return Err(e),
            None => return Err(SyncError::Closed),
        }

        stream.send(GatewayCommand::Subscribe { room_id }).await?;
        loop {
            match stream.read_event().await {
                Some(Ok(RealtimeEvent::Subscribed { room_id: id })) if id == room_id => return Ok(stream),
                Some(Ok(RealtimeEvent::Error { code, message })) => return Err(SyncError::Rejected { code, message }),
                // Room traffic can race ahead of the confirmation
                Some(Ok(event)) if event.room_id() == Some(room_id) => stream.pending.push_back(event),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => return Err(SyncError::Closed),
            }
        }
    }
}

impl RealtimeTransport for WsTransport {
    type Stream = WsRoomStream;

    async fn subscribe(&self, room_id: Uuid) -> Result<WsRoomStream, SyncError> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, self.open(room_id))
            .await
            .map_err(|_| SyncError::Timeout("gateway handshake"))?
    }
}

pub struct WsRoomStream {
    socket: Socket,
    room_id: Uuid,
    pending: VecDeque<RealtimeEvent>,
}

impl WsRoomStream {
    /// Next decoded gateway event, skipping control frames and undecodable text.
    async fn read_event(&mut self) -> Option<Result<RealtimeEvent, SyncError>> {
        loop {
            let frame = match self.socket.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(e.into())),
            };
            match frame {
                WsMessage::Text(text) => match serde_json::from_str::<RealtimeEvent>(text.as_str()) {
                    Ok(event) => {
                        trace!("gateway event: {:?}", event);
                        return Some(Ok(event));
                    }
                    Err(e) => warn!("undecodable gateway frame: {}", e),
                },
                WsMessage::Close(_) => return None,
                // tungstenite answers pings itself
                _ => {}
            }
        }
    }
}

impl RoomStream for WsRoomStream {
    async fn next_event(&mut self) -> Option<Result<RealtimeEvent, SyncError>> {
        if let Some(event) = self.pending.pop_front() {
            return Some(Ok(event));
        }
        loop {
            match self.read_event().await? {
                // Access revoked server-side
                Ok(RealtimeEvent::Unsubscribed { room_id }) if room_id == self.room_id => return None,
                Ok(RealtimeEvent::Error { code, message }) => {
                    warn!("gateway error in room {}: {} {}", self.room_id, code, message);
                }
                Ok(event) if event.room_id() == Some(self.room_id) => return Some(Ok(event)),
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }
        }
    }

    async fn send(&mut self, command: GatewayCommand) -> Result<(), SyncError> {
        let text = serde_json::to_string(&command)?;
        self.socket.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }
}
