//! Parley Server Library
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod engine;
pub mod error;
pub mod rooms;
pub mod state;
pub mod tasks;
pub mod turn;
pub mod ws;

use crate::engine::{EngineAddr, EngineClient};
use crate::state::{AppState, Config};
use std::time::Duration;

/// Create and configure the server application.
///
/// Connects the media engine adapter and spawns the notification pump and
/// the reconciliation sweep; must be called from within a tokio runtime.
pub fn create_app(config: Config) -> (axum::Router, AppState) {
    let (engine, notifications) = EngineClient::connect(
        EngineAddr::parse(&config.engine_addr),
        Duration::from_secs(config.engine_timeout_secs),
    );
    let state = AppState::new(config, engine);

    tokio::spawn(tasks::notifications::run(state.clone(), notifications));
    tokio::spawn(tasks::reconcile::run(state.clone()));

    let router = api::create_router(state.clone());
    (router, state)
}
