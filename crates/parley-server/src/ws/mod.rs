//! WebSocket signaling gateway.

pub mod connections;
pub mod handler;

pub use connections::ConnectionManager;
