//! Periodic reconciliation of local producer bookkeeping against the
//! engine.
//!
//! Leave never blocks on engine-side teardown, so a stuck or restarted
//! engine can leave the two views briefly out of sync. This sweep
//! cross-checks every live room and drops local producers the engine no
//! longer reports, announcing `producerClosed` so clients converge too.

use crate::state::AppState;
use parley_protocol::ServerMessage;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

pub async fn run(state: AppState) {
    let period = Duration::from_secs(state.config.reconcile_interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        sweep(&state).await;
    }
}

pub async fn sweep(state: &AppState) {
    for room_id in state.registry.room_ids().await {
        let remote = match state.engine.get_producers(&room_id, None).await {
            Ok(list) => list,
            Err(e) => {
                tracing::debug!("reconcile skipped for room {}: {}", room_id, e);
                continue;
            }
        };
        let live: HashSet<String> = remote.into_iter().map(|p| p.producer_id).collect();

        let Some(room_lock) = state.registry.get(&room_id).await else {
            continue;
        };
        let stale = { room_lock.write().await.drop_stale_producers(&live) };

        for (owner, producer_id) in stale {
            tracing::info!(
                "reconcile: dropped stale producer {} (peer {}) in room {}",
                producer_id,
                owner,
                room_id
            );
            state
                .connections
                .broadcast_to_room(
                    &room_id,
                    &ServerMessage::ProducerClosed {
                        peer_id: owner,
                        producer_id,
                    },
                    None,
                )
                .await;
        }
    }
}
