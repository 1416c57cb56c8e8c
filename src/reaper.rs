//! Periodic removal of long-dead zombie records.
//!
//! Pure registry bookkeeping on a coarse interval: a record that has been
//! a zombie longer than the timeout is dropped from the snapshot. The
//! reaper never signals a process; operators escalate with force-kill.

use std::time::Duration;

use crate::registry::RegistryStore;

/// Prune loop over zombie records.
#[derive(Debug, Clone)]
pub struct ZombieReaper {
    store: RegistryStore,
    interval: Duration,
    zombie_timeout: Duration,
}

impl ZombieReaper {
    pub fn new(store: RegistryStore, interval: Duration, zombie_timeout: Duration) -> Self {
        Self {
            store,
            interval,
            zombie_timeout,
        }
    }

    /// Run prune sweeps forever at the configured interval.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// Run one prune sweep.
    pub async fn tick(&self) {
        match self.store.prune_zombies(self.zombie_timeout).await {
            Ok(pruned) if !pruned.is_empty() => {
                tracing::info!(?pruned, "pruned zombie instances");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "zombie prune sweep failed"),
        }
    }
}
