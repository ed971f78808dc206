use crate::broadcast::{Broadcaster, Topic};
use crate::server::{ServerId, ServerRegistry, SupervisorSnapshot};
use crate::stats::{ServerStats, StatsCollector};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Live view of one server pushed to its viewers.
#[derive(Debug, Clone, Serialize)]
pub struct ServerDetails {
    #[serde(flatten)]
    pub snapshot: SupervisorSnapshot,
    pub stats: ServerStats,
}

/// What one tick of the realtime loop published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub host_published: bool,
    pub users_updated: usize,
}

/// Periodic push of host and server stats to connected viewers.
///
/// Does nothing while nobody is subscribed.
pub struct RealtimeLoop {
    registry: Arc<ServerRegistry>,
    broadcaster: Arc<dyn Broadcaster>,
    stats: Arc<StatsCollector>,
    last_host: Mutex<Option<(f32, f32)>>,
}

impl RealtimeLoop {
    pub fn new(
        registry: Arc<ServerRegistry>,
        broadcaster: Arc<dyn Broadcaster>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            stats,
            last_host: Mutex::new(None),
        }
    }

    /// Publishes one round of updates.
    ///
    /// Host stats go to the dashboard only when CPU or memory usage moved
    /// since the previous tick. Every subscriber then gets the details of
    /// each server it may see plus a status list of those servers.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        if self.broadcaster.subscriber_count() == 0 {
            return report;
        }

        let host = self.stats.host_stats().await;
        let current = (host.cpu_usage, host.mem_percent);
        let changed = match self.last_host.lock() {
            Ok(mut last) => {
                let changed = *last != Some(current);
                *last = Some(current);
                changed
            }
            Err(_) => true,
        };
        if changed {
            match serde_json::to_value(&host) {
                Ok(payload) => {
                    self.broadcaster
                        .publish_to_topic(Topic::Dashboard, "update_host_stats", payload);
                    report.host_published = true;
                }
                Err(e) => tracing::warn!(error = %e, "Failed to serialize host stats"),
            }
        }

        let mut details: HashMap<ServerId, Option<serde_json::Value>> = HashMap::new();
        for subscriber in self.broadcaster.subscribers() {
            let mut statuses = Vec::new();
            for server_id in &subscriber.authorized_servers {
                if !details.contains_key(server_id) {
                    let value = self.server_details(*server_id).await;
                    details.insert(*server_id, value);
                }
                let Some(Some(value)) = details.get(server_id) else {
                    continue;
                };
                self.broadcaster.publish_to_user(
                    subscriber.user_id,
                    "update_server_details",
                    value.clone(),
                );
                statuses.push(value.clone());
            }
            self.broadcaster.publish_to_user(
                subscriber.user_id,
                "update_server_status",
                json!(statuses),
            );
            report.users_updated += 1;
        }

        report
    }

    /// Runs [`tick`](Self::tick) every `period` until the stop flag is raised.
    pub async fn run(&self, period: Duration, mut stop_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let report = self.tick().await;
                    tracing::trace!(?report, "Realtime tick");
                }
            }
        }
        tracing::debug!("Realtime loop stopped");
    }

    async fn server_details(&self, server_id: ServerId) -> Option<serde_json::Value> {
        let supervisor = match self.registry.get(server_id) {
            Ok(supervisor) => supervisor,
            Err(e) => {
                tracing::debug!(server_id = %server_id, error = %e, "Skipping unknown server");
                return None;
            }
        };
        let details = ServerDetails {
            snapshot: supervisor.snapshot().await,
            stats: supervisor.live_stats().await,
        };
        serde_json::to_value(&details)
            .map_err(|e| tracing::warn!(server_id = %server_id, error = %e, "Failed to serialize server details"))
            .ok()
    }
}
