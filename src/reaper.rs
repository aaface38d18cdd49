//! Periodic liveness sweep: active -> stale -> evicted.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::events::{HubEvent, ProducerChange};
use crate::hub::Hub;
use crate::registry::ProducerStatus;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub marked_stale: Vec<String>,
    pub evicted: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.marked_stale.is_empty() && self.evicted.is_empty()
    }
}

pub struct HealthReaper {
    hub: Arc<Hub>,
    heartbeat_timeout: Duration,
    grace_period: Duration,
    sweep_interval: Duration,
}

impl HealthReaper {
    pub fn new(hub: Arc<Hub>) -> Self {
        let health = hub.config.health.clone();
        Self {
            hub,
            heartbeat_timeout: health.heartbeat_timeout,
            grace_period: health.grace_period,
            sweep_interval: health.sweep_interval,
        }
    }

    /// One pass over every producer, judged as of `now`.
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let evict_after = self.heartbeat_timeout + self.grace_period;
        let mut report = SweepReport::default();

        for sample in self.hub.registry.liveness(now).await {
            if sample.idle_for >= evict_after {
                // Re-checked under the registry lock; a heartbeat may have landed meanwhile.
                if let Some(entry) = self
                    .hub
                    .registry
                    .remove_if_idle(&sample.producer_id, now, evict_after)
                    .await
                {
                    info!(
                        "Producer '{}' silent for {:?}, evicting",
                        sample.producer_id, sample.idle_for
                    );
                    self.hub.release(entry).await;
                    report.evicted.push(sample.producer_id);
                }
            } else if sample.idle_for >= self.heartbeat_timeout
                && sample.status == ProducerStatus::Active
                && self
                    .hub
                    .registry
                    .mark_stale_if_idle(&sample.producer_id, now, self.heartbeat_timeout)
                    .await
            {
                info!(
                    "Producer '{}' missed heartbeats for {:?}, marked stale",
                    sample.producer_id, sample.idle_for
                );
                self.hub
                    .events
                    .publish(HubEvent::producer(&sample.producer_id, ProducerChange::Stale));
                report.marked_stale.push(sample.producer_id);
            }
        }

        if !report.is_empty() {
            debug!(
                "Health sweep: {} marked stale, {} evicted",
                report.marked_stale.len(),
                report.evicted.len()
            );
        }
        report
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "Started health reaper (timeout {:?}, grace {:?}, every {:?})",
                self.heartbeat_timeout, self.grace_period, self.sweep_interval
            );
            loop {
                ticker.tick().await;
                self.sweep(Instant::now()).await;
            }
        })
    }
}
