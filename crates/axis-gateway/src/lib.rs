//! Realtime gateway: room-scoped event fan-out over WebSocket.

pub mod connection;
pub mod dispatcher;
