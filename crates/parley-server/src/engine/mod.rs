//! Media Engine Adapter
//!
//! Client for the external selective-forwarding media engine. The engine
//! owns the forwarding-side resources (routers, transports, producers,
//! consumers); this adapter owns call correlation, timeouts, and the
//! notification stream that keeps the local bookkeeping in sync.

mod rpc;
mod types;

pub use rpc::{EngineAddr, EngineClient};
pub use types::{
    ConsumerCreated, EngineError, EngineNotification, RemoteProducer, TransportCreated,
};
