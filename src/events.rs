// Events that flow from the router and background workers to the alert sink
//
// These are operational events (health transitions, failovers, replay
// exhaustion), not request traffic. Using an enum allows pattern matching
// and ensures type-safe communication between async tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::InstanceName;

/// Operational event emitted by the router, health monitor, or replayer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")] // Creates JSON like {"type": "health_transition", ...}
pub enum RouterEvent {
    /// An instance changed health state
    HealthTransition {
        timestamp: DateTime<Utc>,
        instance: InstanceName,
        healthy: bool,
        /// Probe error that drove the transition, if any
        detail: Option<String>,
    },

    /// A write intended for one instance was redirected to the other
    WriteFailover {
        timestamp: DateTime<Utc>,
        from: InstanceName,
        to: InstanceName,
        path: String,
    },

    /// A WAL entry exhausted its retry budget and was abandoned
    ReplayExhausted {
        timestamp: DateTime<Utc>,
        write_id: i64,
        target: InstanceName,
        error: String,
    },

    /// Process RSS crossed the configured pressure threshold
    MemoryPressure {
        timestamp: DateTime<Utc>,
        rss_bytes: u64,
        limit_bytes: u64,
    },
}

impl RouterEvent {
    /// Short human-readable summary used for Slack messages and logs
    pub fn summary(&self) -> String {
        match self {
            RouterEvent::HealthTransition {
                instance,
                healthy,
                detail,
                ..
            } => {
                if *healthy {
                    format!("{instance} recovered")
                } else {
                    format!(
                        "{instance} marked unhealthy: {}",
                        detail.as_deref().unwrap_or("probe failed")
                    )
                }
            }
            RouterEvent::WriteFailover { from, to, path, .. } => {
                format!("write failover {from} -> {to} for {path}")
            }
            RouterEvent::ReplayExhausted {
                write_id,
                target,
                error,
                ..
            } => {
                format!("WAL entry {write_id} abandoned for {target}: {error}")
            }
            RouterEvent::MemoryPressure {
                rss_bytes,
                limit_bytes,
                ..
            } => {
                format!(
                    "memory pressure: rss {} MB over threshold {} MB",
                    rss_bytes / (1024 * 1024),
                    limit_bytes / (1024 * 1024)
                )
            }
        }
    }
}

/// Generate a unique transaction ID
///
/// Format: millisecond timestamp + process-wide counter. Unique within and
/// across restarts of a single router; good enough for client correlation.
pub fn generate_transaction_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let count = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("txn-{}-{:04x}", Utc::now().timestamp_millis(), count & 0xFFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_ids_are_unique() {
        let a = generate_transaction_id();
        let b = generate_transaction_id();
        assert_ne!(a, b);
        assert!(a.starts_with("txn-"));
    }

    #[test]
    fn unhealthy_transition_summary_names_the_instance() {
        let event = RouterEvent::HealthTransition {
            timestamp: Utc::now(),
            instance: InstanceName::Primary,
            healthy: false,
            detail: Some("connect timeout".into()),
        };
        assert_eq!(event.summary(), "primary marked unhealthy: connect timeout");
    }
}
