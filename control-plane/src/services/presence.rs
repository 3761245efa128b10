use crate::services::directory::WorkerDirectory;
use crate::services::session_authority::SessionAuthority;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

/// Background task that removes silent workers and releases slots held by
/// expired sessions.
pub async fn presence_monitor(
    directory: Arc<WorkerDirectory>,
    authority: Arc<SessionAuthority>,
    period: Duration,
) {
    info!(period_ms = period.as_millis() as u64, "Starting presence monitor task");

    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tick.tick().await;
        sweep_once(&directory, &authority);
    }
}

/// One sweep pass. Returns (workers removed, session slots released).
pub fn sweep_once(directory: &WorkerDirectory, authority: &SessionAuthority) -> (usize, usize) {
    let removed = match directory.sweep() {
        Ok(removed) => removed.len(),
        Err(e) => {
            error!(error = %e, "Failed to sweep worker directory");
            0
        }
    };

    let released = match authority.purge_expired() {
        Ok(released) => released,
        Err(e) => {
            error!(error = %e, "Failed to purge expired sessions");
            0
        }
    };

    if removed > 0 || released > 0 {
        debug!(removed, released, "Presence sweep");
    }
    (removed, released)
}
