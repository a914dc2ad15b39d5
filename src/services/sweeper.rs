//! Sweepers — periodic eviction of expired rooms, sessions, and IP
//! buckets.
//!
//! DESIGN
//! ======
//! Three independent tasks, each on its own cadence, all observing one
//! shutdown signal. A sweep takes its store's lock once per tick, so a
//! sweeper never blocks message delivery beyond a single critical
//! section.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

use crate::state::AppState;

const ROOM_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const IP_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Spawn all three sweepers. Each exits at its next tick once the
/// shutdown signal flips.
pub fn spawn_sweepers(state: AppState, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    vec![
        spawn_room_sweeper(state.clone(), shutdown.clone()),
        spawn_session_sweeper(state.clone(), shutdown.clone()),
        spawn_ip_sweeper(state, shutdown),
    ]
}

fn spawn_room_sweeper(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(ROOM_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = state.rooms.cleanup().await;
                    if removed > 0 {
                        info!(removed, "expired rooms swept");
                    }
                }
                _ = shutdown.changed() => {
                    info!("room sweeper stopped");
                    break;
                }
            }
        }
    })
}

fn spawn_session_sweeper(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(SESSION_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = state.sessions.cleanup();
                    if removed > 0 {
                        info!(removed, "expired sessions swept");
                    }
                }
                _ = shutdown.changed() => {
                    info!("session sweeper stopped");
                    break;
                }
            }
        }
    })
}

fn spawn_ip_sweeper(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(IP_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = state.ip_limiter.cleanup();
                    if removed > 0 {
                        info!(removed, "idle ip limiters swept");
                    }
                }
                _ = shutdown.changed() => {
                    info!("ip sweeper stopped");
                    break;
                }
            }
        }
    })
}

// =============================================================================
// TESTS
// =============================================================================
