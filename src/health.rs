// Health monitoring for the backend pair
//
// Each instance carries lock-free runtime state (health flag, counters)
// shared between the router, the replayer, and the probe loop. The probe
// loop GETs the backend heartbeat at a fixed cadence; consecutive failures
// past a threshold flip the instance unhealthy, a single success flips it
// back. Transitions are emitted as events and recorded durably.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::db::{oplog, Database};
use crate::events::RouterEvent;

/// Logical name of a backend instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceName {
    Primary,
    Replica,
}

impl InstanceName {
    /// The other member of the pair
    pub fn other(self) -> Self {
        match self {
            InstanceName::Primary => InstanceName::Replica,
            InstanceName::Replica => InstanceName::Primary,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceName::Primary => "primary",
            InstanceName::Replica => "replica",
        }
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(InstanceName::Primary),
            "replica" => Ok(InstanceName::Replica),
            other => anyhow::bail!("unknown instance name {other:?}"),
        }
    }
}

/// Runtime state of one backend instance
///
/// Atomics keep reads lock-free on the request path; only the last error
/// message needs a mutex, and it is written rarely.
#[derive(Debug)]
pub struct Instance {
    pub name: InstanceName,
    pub base_url: String,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    total_requests: AtomicU64,
    total_successes: AtomicU64,
    /// Epoch millis of the last probe
    last_checked_ms: AtomicI64,
    /// Probe round-trip of the last successful check
    last_response_time_ms: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Instance {
    pub fn new(name: InstanceName, base_url: String) -> Self {
        Self {
            name,
            base_url,
            // Optimistic until the first probe says otherwise
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            last_checked_ms: AtomicI64::new(0),
            last_response_time_ms: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Update per-instance counters after a forwarded request completes
    pub fn observe_request_outcome(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.total_successes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Success rate over the life of the process, as a percentage
    pub fn success_rate_pct(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 100.0;
        }
        let ok = self.total_successes.load(Ordering::Relaxed);
        (ok as f64 / total as f64) * 100.0
    }

    fn set_error(&self, error: Option<String>) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = error;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|slot| slot.clone())
    }

    /// Serializable view for the admin surface
    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            name: self.name,
            base_url: self.base_url.clone(),
            healthy: self.is_healthy(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            success_rate_pct: self.success_rate_pct(),
            last_checked_at: match self.last_checked_ms.load(Ordering::Relaxed) {
                0 => None,
                ms => chrono::DateTime::from_timestamp_millis(ms).map(|t| t.to_rfc3339()),
            },
            last_response_time_ms: self.last_response_time_ms.load(Ordering::Relaxed),
            last_error: self.last_error(),
        }
    }
}

/// Point-in-time view of an instance for JSON responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub name: InstanceName,
    pub base_url: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_successes: u64,
    pub success_rate_pct: f64,
    pub last_checked_at: Option<String>,
    pub last_response_time_ms: u64,
    pub last_error: Option<String>,
}

/// The backend pair, shared across all components
#[derive(Clone)]
pub struct InstanceRegistry {
    pub primary: Arc<Instance>,
    pub replica: Arc<Instance>,
}

impl InstanceRegistry {
    pub fn new(primary_url: String, replica_url: String) -> Self {
        Self {
            primary: Arc::new(Instance::new(InstanceName::Primary, primary_url)),
            replica: Arc::new(Instance::new(InstanceName::Replica, replica_url)),
        }
    }

    pub fn get(&self, name: InstanceName) -> &Arc<Instance> {
        match name {
            InstanceName::Primary => &self.primary,
            InstanceName::Replica => &self.replica,
        }
    }

    pub fn all(&self) -> [&Arc<Instance>; 2] {
        [&self.primary, &self.replica]
    }

    /// Currently healthy instances; may be empty
    pub fn healthy(&self) -> Vec<Arc<Instance>> {
        self.all()
            .into_iter()
            .filter(|i| i.is_healthy())
            .cloned()
            .collect()
    }
}

/// Background probe loop for the backend pair
pub struct HealthMonitor {
    registry: InstanceRegistry,
    db: Database,
    client: reqwest::Client,
    interval: Duration,
    failure_threshold: u32,
    event_tx: mpsc::Sender<RouterEvent>,
}

/// Probe timeout - deliberately shorter than the request forward timeout
/// so a wedged backend is detected before client requests pile up.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

impl HealthMonitor {
    pub fn new(
        registry: InstanceRegistry,
        db: Database,
        interval: Duration,
        failure_threshold: u32,
        event_tx: mpsc::Sender<RouterEvent>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .http1_only()
            .build()?;
        Ok(Self {
            registry,
            db,
            client,
            interval,
            failure_threshold,
            event_tx,
        })
    }

    /// Run until shutdown. Probe errors are absorbed into health state;
    /// the monitor itself never fails.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(
            "Health monitor started (interval {:?}, threshold {})",
            self.interval,
            self.failure_threshold
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let (primary, replica) = tokio::join!(
                        self.probe(self.registry.primary.clone()),
                        self.probe(self.registry.replica.clone()),
                    );
                    for outcome in [primary, replica].into_iter().flatten() {
                        self.on_transition(outcome).await;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Health monitor shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Probe one instance; returns a transition if health state flipped
    async fn probe(&self, instance: Arc<Instance>) -> Option<Transition> {
        let url = format!("{}/api/v2/heartbeat", instance.base_url);
        let started = Instant::now();
        let result = self.client.get(&url).send().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        instance
            .last_checked_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        let (ok, error) = match result {
            Ok(resp) if resp.status().is_success() => (true, None),
            Ok(resp) => (false, Some(format!("heartbeat returned {}", resp.status()))),
            Err(e) => (false, Some(format!("heartbeat failed: {e}"))),
        };

        if let Err(e) = oplog::record_health_sample(
            &self.db,
            instance.name,
            ok,
            if ok { Some(elapsed_ms) } else { None },
            error.as_deref(),
        ) {
            tracing::warn!("Failed to record health sample: {e:#}");
        }

        if ok {
            instance
                .last_response_time_ms
                .store(elapsed_ms, Ordering::Relaxed);
            instance.consecutive_failures.store(0, Ordering::Relaxed);
            instance.set_error(None);
            let was_healthy = instance.healthy.swap(true, Ordering::Relaxed);
            if !was_healthy {
                return Some(Transition {
                    instance: instance.name,
                    healthy: true,
                    detail: None,
                });
            }
        } else {
            let failures = instance.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            instance.set_error(error.clone());
            tracing::debug!(
                "Probe failed for {} ({}/{}): {}",
                instance.name,
                failures,
                self.failure_threshold,
                error.as_deref().unwrap_or("unknown")
            );
            if failures >= self.failure_threshold {
                let was_healthy = instance.healthy.swap(false, Ordering::Relaxed);
                if was_healthy {
                    return Some(Transition {
                        instance: instance.name,
                        healthy: false,
                        detail: error,
                    });
                }
            }
        }
        None
    }

    async fn on_transition(&self, transition: Transition) {
        if transition.healthy {
            tracing::info!("Instance {} recovered", transition.instance);
        } else {
            tracing::warn!(
                "Instance {} marked unhealthy: {}",
                transition.instance,
                transition.detail.as_deref().unwrap_or("probe failed")
            );
        }

        if let Err(e) = oplog::record_failover_event(
            &self.db,
            if transition.healthy {
                "instance_recovered"
            } else {
                "instance_down"
            },
            transition.instance,
            transition.detail.as_deref().unwrap_or(""),
        ) {
            tracing::warn!("Failed to record failover event: {e:#}");
        }

        let _ = self
            .event_tx
            .send(RouterEvent::HealthTransition {
                timestamp: Utc::now(),
                instance: transition.instance,
                healthy: transition.healthy,
                detail: transition.detail,
            })
            .await;
    }
}

struct Transition {
    instance: InstanceName,
    healthy: bool,
    detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_names_pair_up() {
        assert_eq!(InstanceName::Primary.other(), InstanceName::Replica);
        assert_eq!(InstanceName::Replica.other(), InstanceName::Primary);
        assert_eq!("primary".parse::<InstanceName>().unwrap(), InstanceName::Primary);
        assert!("standby".parse::<InstanceName>().is_err());
    }

    #[test]
    fn success_rate_starts_at_full() {
        let instance = Instance::new(InstanceName::Primary, "http://p".into());
        assert_eq!(instance.success_rate_pct(), 100.0);

        instance.observe_request_outcome(true);
        instance.observe_request_outcome(false);
        assert_eq!(instance.success_rate_pct(), 50.0);
    }

    #[test]
    fn registry_filters_unhealthy() {
        let registry = InstanceRegistry::new("http://p".into(), "http://r".into());
        assert_eq!(registry.healthy().len(), 2);

        registry.primary.healthy.store(false, Ordering::Relaxed);
        let healthy = registry.healthy();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].name, InstanceName::Replica);
    }
}
