//! Full loop against an in-process server: REST writes from one user show up
//! in another user's synced cache through the realtime gateway.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use uuid::Uuid;

use axis_api::auth::{AppState, AppStateInner, create_token};
use axis_db::Database;
use axis_gateway::dispatcher::Dispatcher;
use axis_sync::{
    Change, ChatApi, ConnectionManager, ConnectionState, Reconciler, SyncConfig, SyncError, SyncHandle, WsTransport,
};
use axis_types::models::{Message, RoomKind};

const SECRET: &str = "e2e-jwt-secret";

struct Server {
    base: String,
    state: AppState,
}

impl Server {
    async fn start() -> Self {
        let state: AppState = Arc::new(AppStateInner {
            db: Arc::new(Database::open_in_memory().unwrap()),
            jwt_secret: SECRET.into(),
            dispatcher: Dispatcher::new(),
            webhook_secret: None,
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = axis_api::routes::app(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Self {
            base: format!("http://{addr}"),
            state,
        }
    }

    fn user(&self, name: &str) -> (Uuid, ChatApi) {
        let id = Uuid::new_v4();
        self.state.db.create_user(&id.to_string(), name, "unused").unwrap();
        let token = create_token(SECRET, id, name).unwrap();
        (id, ChatApi::new(self.base.clone(), token))
    }

    fn gateway_url(&self) -> String {
        format!("{}/gateway", self.base.replacen("http", "ws", 1))
    }
}

/// Waits for cache changes until the room's messages satisfy `done`.
async fn wait_for_cache(
    changes: &mut broadcast::Receiver<Change>,
    handle: &SyncHandle,
    room_id: Uuid,
    done: impl Fn(&[Message]) -> bool,
) {
    let settled = async {
        loop {
            changes.recv().await.unwrap();
            if done(&handle.messages(room_id).await.unwrap()) {
                return;
            }
        }
    };
    timeout(Duration::from_secs(5), settled).await.expect("cache never caught up");
}

#[tokio::test]
async fn message_reaches_other_client_once() {
    let server = Server::start().await;
    let (_, ana) = server.user("ana");
    let (bob_id, bob) = server.user("bob");
    let room = ana
        .create_room(RoomKind::Group, Some("Evening run".into()), vec![bob_id])
        .await
        .unwrap();

    let config = SyncConfig::default();
    let history = Arc::new(bob.clone());
    let (reconciler, handle) = Reconciler::new(&config, history.clone());
    let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
    tokio::spawn(reconciler.run(events_rx));
    let transport = WsTransport::new(server.gateway_url(), bob.token());
    let manager = ConnectionManager::new(transport, history, config, events_tx);
    let mut changes = handle.subscribe();

    manager.connect(room.id);
    let mut state = manager.watch(room.id).unwrap();
    timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .expect("never connected")
        .unwrap();

    let sent = ana.send_message(room.id, "5k done before sunrise").await.unwrap();
    wait_for_cache(&mut changes, &handle, room.id, |m| m.iter().any(|m| m.id == sent.id)).await;

    let page = handle.load(room.id, None).await.unwrap();
    assert_eq!(page.iter().filter(|m| m.id == sent.id).count(), 1);
    let cached = handle.messages(room.id).await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].body, "5k done before sunrise");

    ana.delete_message(room.id, sent.id).await.unwrap();
    wait_for_cache(&mut changes, &handle, room.id, |m| m.first().is_some_and(Message::is_deleted)).await;

    manager.shutdown().await;
}

#[tokio::test]
async fn outsider_is_rejected_by_gateway_and_api() {
    let server = Server::start().await;
    let (_, ana) = server.user("ana");
    let (_, eve) = server.user("eve");
    let room = ana.create_room(RoomKind::Group, Some("Private".into()), vec![]).await.unwrap();

    let transport = WsTransport::new(server.gateway_url(), eve.token());
    let Err(err) = axis_sync::RealtimeTransport::subscribe(&transport, room.id).await else {
        panic!("outsider subscribed to a private room");
    };
    assert!(matches!(err, SyncError::Rejected { ref code, .. } if code == "forbidden"), "{err}");

    let err = eve.send_message(room.id, "hi").await.unwrap_err();
    assert!(matches!(err, SyncError::Status { status: 403, .. }), "{err}");
}
