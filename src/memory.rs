// Process memory accounting for back-pressure decisions
//
// The router refuses new writes and the replayer halves its batch size
// while the process RSS sits above the configured threshold. Sampling
// reads /proc/self/status, which is cheap but not free, so samples are
// cached for a short interval and shared behind an atomic.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cached view of process memory, refreshed by a background task
#[derive(Debug)]
pub struct MemoryWatcher {
    /// Last sampled RSS in bytes
    rss_bytes: AtomicU64,
    /// Pressure threshold in bytes
    threshold_bytes: u64,
    /// Whether the last sample was over the threshold
    over_threshold: AtomicBool,
}

impl MemoryWatcher {
    pub fn new(threshold_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            rss_bytes: AtomicU64::new(0),
            threshold_bytes,
            over_threshold: AtomicBool::new(false),
        })
    }

    /// Current cached RSS in bytes (0 until the first sample lands)
    pub fn rss_bytes(&self) -> u64 {
        self.rss_bytes.load(Ordering::Relaxed)
    }

    pub fn threshold_bytes(&self) -> u64 {
        self.threshold_bytes
    }

    /// True while the process is over the pressure threshold
    pub fn under_pressure(&self) -> bool {
        self.over_threshold.load(Ordering::Relaxed)
    }

    /// Take a fresh sample and update the cached state.
    ///
    /// Returns Some(rss) when the sample crossed from below to above the
    /// threshold, so the caller can raise a one-shot alert.
    pub fn sample(&self) -> Option<u64> {
        let rss = read_rss_bytes().unwrap_or(0);
        self.rss_bytes.store(rss, Ordering::Relaxed);

        let over = rss > self.threshold_bytes;
        let was_over = self.over_threshold.swap(over, Ordering::Relaxed);
        if over && !was_over {
            Some(rss)
        } else {
            None
        }
    }
}

/// Periodically refresh the watcher until shutdown.
///
/// Crossing the threshold emits a MemoryPressure event to the alert sink.
pub async fn run_sampler(
    watcher: Arc<MemoryWatcher>,
    event_tx: tokio::sync::mpsc::Sender<crate::events::RouterEvent>,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Some(rss) = watcher.sample() {
                    tracing::warn!(
                        "Memory pressure: rss {} MB over threshold {} MB",
                        rss / (1024 * 1024),
                        watcher.threshold_bytes() / (1024 * 1024)
                    );
                    let _ = event_tx
                        .send(crate::events::RouterEvent::MemoryPressure {
                            timestamp: chrono::Utc::now(),
                            rss_bytes: rss,
                            limit_bytes: watcher.threshold_bytes(),
                        })
                        .await;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Read the resident set size of this process in bytes.
///
/// Linux only; other platforms report None and pressure detection is
/// effectively disabled there.
#[cfg(target_os = "linux")]
fn read_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vmrss_kb(&status).map(|kb| kb * 1024)
}

#[cfg(not(target_os = "linux"))]
fn read_rss_bytes() -> Option<u64> {
    None
}

/// Extract the VmRSS value (in kB) from /proc/self/status content
fn parse_vmrss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vmrss_line() {
        let status = "Name:\tvecgate\nVmPeak:\t  1000 kB\nVmRSS:\t  524288 kB\nThreads:\t8\n";
        assert_eq!(parse_vmrss_kb(status), Some(524288));
    }

    #[test]
    fn missing_vmrss_yields_none() {
        assert_eq!(parse_vmrss_kb("Name:\tvecgate\n"), None);
    }

    #[test]
    fn threshold_crossing_fires_once() {
        // Threshold of zero: any nonzero sample is over it. On Linux the
        // first sample crosses, the second does not (still over).
        let watcher = MemoryWatcher::new(0);
        let first = watcher.sample();
        let second = watcher.sample();
        if watcher.rss_bytes() > 0 {
            assert!(first.is_some());
            assert!(second.is_none());
            assert!(watcher.under_pressure());
        }
    }
}
