//! Client-side chat synchronization: per-room realtime connections with
//! polling fallback, a merged message cache, and presence tracking, all
//! driven by one reconciliation loop.
//!
//! ```text
//! ConnectionManager tasks ── SyncEvent ──> Reconciler::run ── Change ──> UI
//!                                             ^
//!                   SyncHandle ── Command ────┘
//! ```

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod http;
pub mod presence;
pub mod reconciler;
pub mod transport;
pub mod ws;

pub use cache::MessageCache;
pub use config::SyncConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use error::SyncError;
pub use events::{Change, SyncEvent};
pub use http::ChatApi;
pub use presence::PresenceTracker;
pub use reconciler::{PresenceSnapshot, Reconciler, SyncHandle};
pub use transport::{HistorySource, RealtimeTransport, RoomStream};
pub use ws::WsTransport;
