use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use axis_types::events::GatewayCommand;

use crate::config::SyncConfig;
use crate::events::SyncEvent;
use crate::transport::{HistorySource, RealtimeTransport, RoomStream};

/// Lifecycle of one room's realtime subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    /// `attempt` failed subscribes so far; 0 right after a live drop.
    Retrying { attempt: u32 },
    /// Realtime unavailable, history is being polled instead.
    Polling,
}

impl ConnectionState {
    /// True while the room is not receiving realtime events but is trying to.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Retrying { .. } | Self::Polling)
    }
}

struct Shared<T, H> {
    transport: T,
    history: Arc<H>,
    config: SyncConfig,
    events: mpsc::Sender<SyncEvent>,
}

struct RoomWorker {
    cancel: CancellationToken,
    state: watch::Receiver<ConnectionState>,
    commands: mpsc::UnboundedSender<GatewayCommand>,
    handle: JoinHandle<()>,
}

/// Owns one background task per open room. Each task keeps a realtime
/// subscription alive, degrading to polling when it cannot, and feeds
/// everything it receives into the shared `SyncEvent` channel.
pub struct ConnectionManager<T, H> {
    shared: Arc<Shared<T, H>>,
    rooms: Mutex<HashMap<Uuid, RoomWorker>>,
}

impl<T: RealtimeTransport, H: HistorySource> ConnectionManager<T, H> {
    pub fn new(transport: T, history: Arc<H>, config: SyncConfig, events: mpsc::Sender<SyncEvent>) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                history,
                config,
                events,
            }),
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Starts syncing a room. No-op if the room already has a running worker.
    pub fn connect(&self, room_id: Uuid) {
        let mut rooms = self.lock_rooms();
        if rooms.get(&room_id).is_some_and(|w| !w.handle.is_finished()) {
            debug!("room {} already connected", room_id);
            return;
        }

        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            shared: self.shared.clone(),
            room_id,
            state: state_tx,
        };
        let handle = tokio::spawn(worker.run(cancel.clone(), cmd_rx));

        rooms.insert(
            room_id,
            RoomWorker {
                cancel,
                state: state_rx,
                commands: cmd_tx,
                handle,
            },
        );
    }

    /// Stops syncing a room. Safe to call for rooms that are not connected.
    pub fn disconnect(&self, room_id: Uuid) {
        if let Some(worker) = self.lock_rooms().remove(&room_id) {
            worker.cancel.cancel();
        }
    }

    /// Disconnects every other room, then connects `room_id`.
    pub fn switch_room(&self, room_id: Uuid) {
        let others: Vec<Uuid> = self.rooms().into_iter().filter(|id| *id != room_id).collect();
        for other in others {
            self.disconnect(other);
        }
        self.connect(room_id);
    }

    pub fn state(&self, room_id: Uuid) -> ConnectionState {
        self.lock_rooms()
            .get(&room_id)
            .map_or(ConnectionState::Idle, |w| *w.state.borrow())
    }

    /// Watch a connected room's state, e.g. to drive a reconnecting banner.
    pub fn watch(&self, room_id: Uuid) -> Option<watch::Receiver<ConnectionState>> {
        self.lock_rooms().get(&room_id).map(|w| w.state.clone())
    }

    /// Queues a typing indicator on the room's live subscription. Returns
    /// false if the room has no worker. Dropped silently while not connected.
    pub fn set_typing(&self, room_id: Uuid, is_typing: bool) -> bool {
        self.lock_rooms()
            .get(&room_id)
            .is_some_and(|w| w.commands.send(GatewayCommand::Typing { room_id, is_typing }).is_ok())
    }

    pub fn rooms(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.lock_rooms().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Cancels every worker and waits for them to exit.
    pub async fn shutdown(&self) {
        let workers: Vec<RoomWorker> = self.lock_rooms().drain().map(|(_, w)| w).collect();
        for worker in &workers {
            worker.cancel.cancel();
        }
        for worker in workers {
            if let Err(e) = worker.handle.await {
                warn!("room worker panicked: {}", e);
            }
        }
    }

    fn lock_rooms(&self) -> MutexGuard<'_, HashMap<Uuid, RoomWorker>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T, H> Drop for ConnectionManager<T, H> {
    fn drop(&mut self) {
        let rooms = self.rooms.get_mut().unwrap_or_else(PoisonError::into_inner);
        for worker in rooms.values() {
            worker.cancel.cancel();
        }
    }
}

struct Worker<T, H> {
    shared: Arc<Shared<T, H>>,
    room_id: Uuid,
    state: watch::Sender<ConnectionState>,
}

impl<T: RealtimeTransport, H: HistorySource> Worker<T, H> {
    async fn run(self, cancel: CancellationToken, mut commands: mpsc::UnboundedReceiver<GatewayCommand>) {
        tokio::select! {
            _ = cancel.cancelled() => {
                // A replacement worker for this room may already be reporting
                self.state.send_replace(ConnectionState::Idle);
                debug!("room {} disconnected", self.room_id);
            }
            _ = self.drive(&mut commands) => self.set_state(ConnectionState::Idle).await,
        }
    }

    async fn drive(&self, commands: &mut mpsc::UnboundedReceiver<GatewayCommand>) {
        loop {
            let stream = match self.connect_with_retry().await {
                Some(stream) => stream,
                None => self.poll_until_reconnect(commands).await,
            };
            self.run_live(stream, commands).await;

            if self.shared.events.is_closed() {
                debug!("sync loop gone, stopping room {}", self.room_id);
                return;
            }
            self.set_state(ConnectionState::Retrying { attempt: 0 }).await;
            sleep(self.shared.config.base_backoff).await;
        }
    }

    /// Subscribes with exponential backoff. `None` once attempts run out.
    async fn connect_with_retry(&self) -> Option<T::Stream> {
        let config = &self.shared.config;
        self.set_state(ConnectionState::Connecting).await;

        let mut attempt = 0;
        loop {
            match self.shared.transport.subscribe(self.room_id).await {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    attempt += 1;
                    if attempt >= config.max_attempts {
                        warn!(
                            "room {}: giving up on realtime after {} attempts: {}",
                            self.room_id, attempt, e
                        );
                        return None;
                    }
                    let delay = config.backoff_with_jitter(attempt);
                    warn!(
                        "room {}: subscribe failed ({}), retry {} in {:?}",
                        self.room_id, e, attempt, delay
                    );
                    self.set_state(ConnectionState::Retrying { attempt }).await;
                    sleep(delay).await;
                }
            }
        }
    }

    /// Polls history until a periodic realtime re-attempt succeeds.
    async fn poll_until_reconnect(&self, commands: &mut mpsc::UnboundedReceiver<GatewayCommand>) -> T::Stream {
        let config = &self.shared.config;
        self.set_state(ConnectionState::Polling).await;

        let mut poll = interval(config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let retry = sleep(config.realtime_retry_interval);
        tokio::pin!(retry);

        loop {
            tokio::select! {
                _ = poll.tick() => self.fetch_latest().await,
                _ = &mut retry => {
                    self.set_state(ConnectionState::Connecting).await;
                    match self.shared.transport.subscribe(self.room_id).await {
                        Ok(stream) => return stream,
                        Err(e) => {
                            warn!("room {}: realtime still unavailable: {}", self.room_id, e);
                            self.set_state(ConnectionState::Polling).await;
                            retry.as_mut().reset(Instant::now() + config.realtime_retry_interval);
                        }
                    }
                }
                Some(command) = commands.recv() => {
                    debug!("room {}: dropping {:?} while polling", self.room_id, command);
                }
            }
        }
    }

    /// Pumps a live subscription until it drops or the sync loop goes away.
    async fn run_live(&self, mut stream: T::Stream, commands: &mut mpsc::UnboundedReceiver<GatewayCommand>) {
        self.set_state(ConnectionState::Connected).await;
        // Stale typing indicators queued while offline
        while commands.try_recv().is_ok() {}
        // Catch up on anything missed while disconnected
        self.fetch_latest().await;

        let mut heartbeat = interval(self.shared.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = stream.next_event() => match event {
                    Some(Ok(event)) => {
                        trace!("room {}: {:?}", self.room_id, event);
                        if self.shared.events.send(SyncEvent::Realtime(event)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("room {}: realtime subscription failed: {}", self.room_id, e);
                        return;
                    }
                    None => {
                        info!("room {}: realtime subscription ended", self.room_id);
                        return;
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = stream.send(GatewayCommand::Heartbeat { room_id: self.room_id }).await {
                        warn!("room {}: heartbeat failed: {}", self.room_id, e);
                        return;
                    }
                }
                Some(command) = commands.recv() => {
                    if let Err(e) = stream.send(command).await {
                        warn!("room {}: send failed: {}", self.room_id, e);
                        return;
                    }
                }
            }
        }
    }

    async fn fetch_latest(&self) {
        let config = &self.shared.config;
        let requested_at = Instant::now();
        match self.shared.history.fetch_page(self.room_id, None, config.page_size).await {
            Ok(messages) => {
                let page = SyncEvent::Page {
                    room_id: self.room_id,
                    messages,
                    requested_at,
                };
                // A closed channel is noticed by the caller
                let _ = self.shared.events.send(page).await;
            }
            Err(e) => debug!("room {}: history poll failed: {}", self.room_id, e),
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous == state {
            return;
        }
        if state.is_degraded() {
            warn!("room {}: {:?} -> {:?}", self.room_id, previous, state);
        } else {
            info!("room {}: {:?} -> {:?}", self.room_id, previous, state);
        }
        let _ = self
            .shared
            .events
            .send(SyncEvent::State {
                room_id: self.room_id,
                state,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use axis_types::events::RealtimeEvent;
    use axis_types::models::{Message, MessageCursor};

    use crate::error::SyncError;

    struct MockTransport {
        failures_left: AtomicU32,
        attempts: AtomicU32,
        feeds: Mutex<Vec<mpsc::UnboundedSender<RealtimeEvent>>>,
        sent: Arc<Mutex<Vec<GatewayCommand>>>,
    }

    impl MockTransport {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicU32::new(times),
                attempts: AtomicU32::new(0),
                feeds: Mutex::new(vec![]),
                sent: Arc::new(Mutex::new(vec![])),
            })
        }

        fn push(&self, event: RealtimeEvent) {
            let feeds = self.feeds.lock().unwrap();
            feeds.last().unwrap().send(event).unwrap();
        }

        /// Simulates the server dropping every live subscription.
        fn drop_live(&self) {
            self.feeds.lock().unwrap().clear();
        }

        fn sent(&self) -> Vec<GatewayCommand> {
            self.sent.lock().unwrap().clone()
        }
    }

    struct MockStream {
        rx: mpsc::UnboundedReceiver<RealtimeEvent>,
        sent: Arc<Mutex<Vec<GatewayCommand>>>,
    }

    impl RoomStream for MockStream {
        async fn next_event(&mut self) -> Option<Result<RealtimeEvent, SyncError>> {
            self.rx.recv().await.map(Ok)
        }

        async fn send(&mut self, command: GatewayCommand) -> Result<(), SyncError> {
            self.sent.lock().unwrap().push(command);
            Ok(())
        }
    }

    impl RealtimeTransport for Arc<MockTransport> {
        type Stream = MockStream;

        async fn subscribe(&self, _room_id: Uuid) -> Result<MockStream, SyncError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(SyncError::Closed);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.feeds.lock().unwrap().push(tx);
            Ok(MockStream {
                rx,
                sent: self.sent.clone(),
            })
        }
    }

    struct EmptyHistory;

    impl HistorySource for EmptyHistory {
        async fn fetch_page(
            &self,
            _room_id: Uuid,
            _before: Option<MessageCursor>,
            _limit: u32,
        ) -> Result<Vec<Message>, SyncError> {
            Ok(vec![])
        }
    }

    type Manager = ConnectionManager<Arc<MockTransport>, EmptyHistory>;

    fn manager(transport: &Arc<MockTransport>) -> (Manager, mpsc::Receiver<SyncEvent>) {
        let config = SyncConfig {
            jitter: 0.0,
            ..SyncConfig::default()
        };
        let (tx, rx) = mpsc::channel(64);
        (ConnectionManager::new(transport.clone(), Arc::new(EmptyHistory), config, tx), rx)
    }

    /// Collects state transitions until `last` shows up.
    async fn states_until(rx: &mut mpsc::Receiver<SyncEvent>, last: ConnectionState) -> Vec<ConnectionState> {
        let mut states = vec![];
        loop {
            let event = tokio::time::timeout(Duration::from_secs(120), rx.recv())
                .await
                .expect("timed out waiting for state")
                .expect("event channel closed");
            if let SyncEvent::State { state, .. } = event {
                states.push(state);
                if state == last {
                    return states;
                }
            }
        }
    }

    async fn wait_connected(manager: &Manager, room: Uuid) {
        let mut state = manager.watch(room).unwrap();
        state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_polling_then_recovers() {
        let transport = MockTransport::failing(5);
        let (manager, mut rx) = manager(&transport);
        let room = Uuid::new_v4();
        let started = Instant::now();

        manager.connect(room);
        let states = states_until(&mut rx, ConnectionState::Polling).await;
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Retrying { attempt: 1 },
                ConnectionState::Retrying { attempt: 2 },
                ConnectionState::Retrying { attempt: 3 },
                ConnectionState::Retrying { attempt: 4 },
                ConnectionState::Polling,
            ]
        );
        // 500 + 1000 + 2000 + 4000 ms of backoff
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(7500) && waited < Duration::from_secs(8));
        assert!(manager.state(room).is_degraded());

        let states = states_until(&mut rx, ConnectionState::Connected).await;
        assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Connected]);
        assert!(started.elapsed() >= Duration::from_millis(37_500));
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_forwards_history_pages() {
        let transport = MockTransport::failing(100);
        let (manager, mut rx) = manager(&transport);
        let room = Uuid::new_v4();

        manager.connect(room);
        states_until(&mut rx, ConnectionState::Polling).await;
        for _ in 0..2 {
            let event = rx.recv().await.unwrap();
            assert!(matches!(event, SyncEvent::Page { room_id, .. } if room_id == room));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_twice_is_harmless() {
        let transport = MockTransport::failing(0);
        let (manager, mut rx) = manager(&transport);
        let room = Uuid::new_v4();

        manager.connect(room);
        wait_connected(&manager, room).await;
        manager.disconnect(room);
        manager.disconnect(room);

        assert_eq!(manager.state(room), ConnectionState::Idle);
        assert!(manager.rooms().is_empty());
        states_until(&mut rx, ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_is_not_followed_by_a_stale_idle() {
        let transport = MockTransport::failing(0);
        let (manager, mut rx) = manager(&transport);
        let room = Uuid::new_v4();

        manager.connect(room);
        let mut old = manager.watch(room).unwrap();
        wait_connected(&manager, room).await;
        manager.disconnect(room);
        manager.connect(room);
        wait_connected(&manager, room).await;
        old.wait_for(|s| *s == ConnectionState::Idle).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut states = vec![];
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::State { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
        assert_eq!(manager.state(room), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn connecting_twice_subscribes_once() {
        let transport = MockTransport::failing(0);
        let (manager, _rx) = manager(&transport);
        let room = Uuid::new_v4();

        manager.connect(room);
        manager.connect(room);
        wait_connected(&manager, room).await;
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn live_drop_goes_through_retrying() {
        let transport = MockTransport::failing(0);
        let (manager, mut rx) = manager(&transport);
        let room = Uuid::new_v4();

        manager.connect(room);
        states_until(&mut rx, ConnectionState::Connected).await;
        transport.drop_live();

        let states = states_until(&mut rx, ConnectionState::Connected).await;
        assert_eq!(
            states,
            vec![
                ConnectionState::Retrying { attempt: 0 },
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_events_and_sends_heartbeats() {
        let transport = MockTransport::failing(0);
        let (manager, mut rx) = manager(&transport);
        let room = Uuid::new_v4();

        manager.connect(room);
        states_until(&mut rx, ConnectionState::Connected).await;
        let event = RealtimeEvent::Typing {
            room_id: room,
            user_id: Uuid::new_v4(),
            username: "bob".into(),
            is_typing: true,
        };
        transport.push(event.clone());

        loop {
            if let SyncEvent::Realtime(got) = rx.recv().await.unwrap() {
                assert_eq!(got, event);
                break;
            }
        }
        assert!(manager.set_typing(room, true));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sent = transport.sent();
        assert!(sent.contains(&GatewayCommand::Heartbeat { room_id: room }));
        assert!(sent.contains(&GatewayCommand::Typing { room_id: room, is_typing: true }));
    }

    #[tokio::test(start_paused = true)]
    async fn switch_room_keeps_one_live() {
        let transport = MockTransport::failing(0);
        let (manager, _rx) = manager(&transport);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        manager.connect(a);
        wait_connected(&manager, a).await;
        manager.switch_room(b);

        assert_eq!(manager.rooms(), vec![b]);
        assert_eq!(manager.state(a), ConnectionState::Idle);
        wait_connected(&manager, b).await;
        assert!(!manager.set_typing(a, true));
    }
}
