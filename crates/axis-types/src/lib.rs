//! Shared wire and domain types for the AXIS6 server, gateway and sync client.

pub mod api;
pub mod events;
pub mod models;
