//! Replica tracking for managed pod fleets.
//!
//! When the process runs inside a pod, the service-account token on disk
//! unlocks the cluster API. Every 30 seconds the tracker reads the desired
//! replica count of the `api`, `worker`, and `stockfish` deployments,
//! keeps a two-hour history, and publishes:
//!
//! - current replica count per service
//! - 1-hour time-weighted average per service
//! - scale-up/scale-down event counters and their running ratio
//!
//! Outside a cluster the tracker simply does not start. The three GETs this
//! needs are plain authenticated HTTPS, so a full Kubernetes client is not
//! pulled in.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::MetricsCollector;

const TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Poll interval against the cluster API.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// History retained per deployment.
pub const HISTORY_WINDOW: Duration = Duration::from_secs(2 * 3600);

/// Window for the average-replicas gauge.
pub const AVERAGE_WINDOW: Duration = Duration::from_secs(3600);

/// Deployments observed by the tracker.
pub const DEPLOYMENTS: [&str; 3] = ["api", "worker", "stockfish"];

/// One observed replica count.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub at: Instant,
    pub count: i64,
}

#[derive(Debug, Default)]
struct ScalingCounts {
    up: u64,
    down: u64,
}

/// Periodic deployment replica poller.
pub struct ReplicaTracker {
    client: reqwest::Client,
    api_server: String,
    namespace: String,
    token: String,
    collector: MetricsCollector,
    history: RwLock<HashMap<String, Vec<Snapshot>>>,
    last_counts: RwLock<HashMap<String, i64>>,
    scaling: RwLock<HashMap<String, ScalingCounts>>,
}

impl ReplicaTracker {
    /// Builds a tracker from the in-cluster environment.
    ///
    /// Returns `None` (with a log line) when no service-account token is
    /// present, which is the normal case outside Kubernetes.
    pub fn from_cluster() -> Option<Self> {
        let token = match std::fs::read_to_string(TOKEN_PATH) {
            Ok(t) => t.trim().to_string(),
            Err(e) => {
                info!(error = %e, "no service account token, replica tracking disabled");
                return None;
            }
        };

        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));
        match std::fs::read(CA_PATH).map(|pem| reqwest::Certificate::from_pem(&pem)) {
            Ok(Ok(cert)) => builder = builder.add_root_certificate(cert),
            Ok(Err(e)) => {
                warn!(error = %e, "cluster CA unreadable, replica tracking disabled");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "cluster CA missing, replica tracking disabled");
                return None;
            }
        }
        let client = match builder.build() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to build cluster client, replica tracking disabled");
                return None;
            }
        };

        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .unwrap_or_else(|_| "kubernetes.default.svc".to_string());
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let namespace = match std::env::var("K8S_NAMESPACE") {
            Ok(ns) if !ns.is_empty() => ns,
            _ => "stockfish".to_string(),
        };

        Some(Self {
            client,
            api_server: format!("https://{}:{}", host, port),
            namespace,
            token,
            collector: MetricsCollector::new(),
            history: RwLock::new(HashMap::new()),
            last_counts: RwLock::new(HashMap::new()),
            scaling: RwLock::new(HashMap::new()),
        })
    }

    /// Spawns the polling task. It ticks every 30 s until shutdown.
    pub fn spawn(self, shutdown: broadcast::Sender<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(namespace = %self.namespace, "replica tracker started");
            let mut shutdown_rx = shutdown.subscribe();
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("replica tracker stopped");
                        return;
                    }
                    _ = interval.tick() => self.poll_once().await,
                }
            }
        })
    }

    async fn poll_once(&self) {
        for deployment in DEPLOYMENTS {
            match self.fetch_replicas(deployment).await {
                Ok(count) => {
                    self.collector.set_replica_count(deployment, count as f64);
                    self.detect_scaling_event(deployment, count);
                    self.add_snapshot(deployment, count);

                    let average = self.average_replicas(deployment, AVERAGE_WINDOW);
                    self.collector.set_average_replicas(deployment, average);
                    debug!(deployment, replicas = count, avg_1h = average, "replica sample");
                }
                Err(e) => {
                    warn!(deployment, error = %e, "failed to read deployment replicas");
                }
            }
        }
    }

    async fn fetch_replicas(&self, deployment: &str) -> Result<i64, reqwest::Error> {
        let url = format!(
            "{}/apis/apps/v1/namespaces/{}/deployments/{}",
            self.api_server, self.namespace, deployment
        );
        let body: serde_json::Value = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body
            .pointer("/spec/replicas")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0))
    }

    fn add_snapshot(&self, deployment: &str, count: i64) {
        let mut history = self.history.write().unwrap_or_else(|e| e.into_inner());
        let entries = history.entry(deployment.to_string()).or_default();
        entries.push(Snapshot {
            at: Instant::now(),
            count,
        });
        entries.retain(|s| s.at.elapsed() <= HISTORY_WINDOW);
    }

    fn average_replicas(&self, deployment: &str, window: Duration) -> f64 {
        let history = self.history.read().unwrap_or_else(|e| e.into_inner());
        match history.get(deployment) {
            Some(entries) => time_weighted_average(entries, Instant::now(), window),
            None => 0.0,
        }
    }

    fn detect_scaling_event(&self, deployment: &str, current: i64) {
        let previous = {
            let mut last = self.last_counts.write().unwrap_or_else(|e| e.into_inner());
            last.insert(deployment.to_string(), current)
        };
        // First observation establishes the baseline.
        let Some(previous) = previous else { return };
        if previous == current {
            return;
        }

        let direction = if current > previous { "up" } else { "down" };
        self.collector.increment_scaling_events(deployment, direction);

        let ratio = {
            let mut scaling = self.scaling.write().unwrap_or_else(|e| e.into_inner());
            let counts = scaling.entry(deployment.to_string()).or_default();
            if current > previous {
                counts.up += 1;
            } else {
                counts.down += 1;
            }
            scaling_ratio(counts.up, counts.down)
        };
        self.collector.set_scaling_events_ratio(deployment, ratio);

        info!(
            deployment,
            from = previous,
            to = current,
            direction,
            "scaling event detected"
        );
    }
}

/// Time-weighted average of the snapshots inside `window`, each count
/// weighted by how long it was the latest observation. An empty window
/// falls back to the most recent count, or zero without history.
pub fn time_weighted_average(entries: &[Snapshot], now: Instant, window: Duration) -> f64 {
    let cutoff = now.checked_sub(window);
    let mut weighted = 0.0;
    let mut total = 0.0;

    for (i, snapshot) in entries.iter().enumerate() {
        if let Some(cutoff) = cutoff {
            if snapshot.at < cutoff {
                continue;
            }
        }
        let held_for = match entries.get(i + 1) {
            Some(next) => next.at.duration_since(snapshot.at),
            None => now.duration_since(snapshot.at),
        };
        weighted += snapshot.count as f64 * held_for.as_secs_f64();
        total += held_for.as_secs_f64();
    }

    if total == 0.0 {
        return entries.last().map(|s| s.count as f64).unwrap_or(0.0);
    }
    weighted / total
}

/// Ratio of scale-up to scale-down events. With no scale-downs the ratio
/// degenerates to the raw scale-up count, signalling one-way growth.
pub fn scaling_ratio(up: u64, down: u64) -> f64 {
    if down == 0 {
        return up as f64;
    }
    up as f64 / down as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    // A reference "now" safely in the future so that subtracting hours of
    // history can never underflow the monotonic clock's epoch.
    fn far_now() -> Instant {
        Instant::now() + Duration::from_secs(100_000)
    }

    fn snapshots(counts: &[(u64, i64)], now: Instant) -> Vec<Snapshot> {
        // (seconds ago, count) pairs, oldest first.
        counts
            .iter()
            .map(|&(ago, count)| Snapshot {
                at: now - Duration::from_secs(ago),
                count,
            })
            .collect()
    }

    #[test]
    fn test_time_weighted_average_steady() {
        let now = far_now();
        let entries = snapshots(&[(600, 3), (300, 3)], now);
        let avg = time_weighted_average(&entries, now, Duration::from_secs(3600));
        assert!((avg - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_weighted_average_weights_by_duration() {
        let now = far_now();
        // 3 replicas held for 300 s, then 6 replicas for the last 100 s:
        // (3*300 + 6*100) / 400 = 3.75
        let entries = snapshots(&[(400, 3), (100, 6)], now);
        let avg = time_weighted_average(&entries, now, Duration::from_secs(3600));
        assert!((avg - 3.75).abs() < 1e-9);
    }

    #[test]
    fn test_time_weighted_average_respects_window() {
        let now = far_now();
        // The 10-replica sample is older than the window and must not count.
        let entries = snapshots(&[(7200, 10), (600, 2)], now);
        let avg = time_weighted_average(&entries, now, Duration::from_secs(3600));
        assert!((avg - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_weighted_average_empty() {
        let now = Instant::now();
        assert_eq!(time_weighted_average(&[], now, Duration::from_secs(60)), 0.0);
    }

    #[test]
    fn test_scaling_ratio() {
        assert_eq!(scaling_ratio(0, 0), 0.0);
        assert_eq!(scaling_ratio(4, 0), 4.0);
        assert_eq!(scaling_ratio(6, 3), 2.0);
        assert_eq!(scaling_ratio(1, 4), 0.25);
    }

    #[test]
    fn test_deployments_list() {
        assert_eq!(DEPLOYMENTS, ["api", "worker", "stockfish"]);
    }
}
