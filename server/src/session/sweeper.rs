//! Periodic eviction of idle sessions

use super::registry::SessionRegistry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

/// Evicts sessions that have been silent longer than `max_idle`
pub struct IdleSweeper {
    registry: Arc<SessionRegistry>,
    max_idle: Duration,
    check_interval: Duration,
}

impl IdleSweeper {
    /// Create a new idle sweeper
    pub fn new(registry: Arc<SessionRegistry>, max_idle: Duration, check_interval: Duration) -> Self {
        Self {
            registry,
            max_idle,
            check_interval,
        }
    }

    /// Run one sweep, returning how many sessions were evicted
    pub async fn sweep_once(&self) -> usize {
        let evicted = self.registry.sweep(self.max_idle).await;
        for session in &evicted {
            info!(
                imei = %session.identity,
                peer = %session.addr,
                idle_secs = session.idle.as_secs(),
                "Evicted idle session"
            );
        }
        evicted.len()
    }

    /// Start the sweep loop
    pub async fn run(&self) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = self.sweep_once().await;
            let remaining = self.registry.count().await;
            debug!(evicted, remaining, "Idle sweep complete");
        }
    }

    /// Run the sweep loop on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }
}
