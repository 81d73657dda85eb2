//! # Request Metrics
//!
//! Process-wide request history with bounded retention. The dispatcher
//! records one entry per request; a background task trims entries past the
//! retention window so memory stays bounded regardless of traffic.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

static COLLECTOR: OnceLock<Arc<RwLock<MetricsCollector>>> = OnceLock::new();

fn collector() -> &'static Arc<RwLock<MetricsCollector>> {
    COLLECTOR.get_or_init(|| Arc::new(RwLock::new(MetricsCollector::new(10_000))))
}

/// One recorded request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub timestamp: SystemTime,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
}

/// Aggregate view over the retained window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: u64,
}

struct MetricsCollector {
    records: VecDeque<RequestRecord>,
    max_records: usize,
    total: u64,
    failed: u64,
}

impl MetricsCollector {
    fn new(max_records: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(max_records.min(1024)),
            max_records,
            total: 0,
            failed: 0,
        }
    }

    fn record(&mut self, record: RequestRecord) {
        self.total += 1;
        if record.status >= 400 {
            self.failed += 1;
        }
        if self.records.len() == self.max_records {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    fn trim_older_than(&mut self, cutoff: SystemTime) -> usize {
        let before = self.records.len();
        while let Some(front) = self.records.front() {
            if front.timestamp < cutoff {
                self.records.pop_front();
            } else {
                break;
            }
        }
        before - self.records.len()
    }

    fn aggregated(&self) -> AggregatedMetrics {
        let mut latencies: Vec<u64> = self.records.iter().map(|r| r.latency_ms).collect();
        latencies.sort_unstable();
        let p95 = if latencies.is_empty() {
            0
        } else {
            latencies[((latencies.len() - 1) * 95) / 100]
        };
        let avg = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
        };
        AggregatedMetrics {
            total_requests: self.total,
            failed_requests: self.failed,
            error_rate: if self.total > 0 {
                self.failed as f64 / self.total as f64
            } else {
                0.0
            },
            average_latency_ms: avg,
            p95_latency_ms: p95,
        }
    }
}

pub async fn record_request(method: &str, path: &str, status: u16, latency: Duration) {
    let record = RequestRecord {
        timestamp: SystemTime::now(),
        method: method.to_string(),
        path: path.to_string(),
        status,
        latency_ms: latency.as_millis() as u64,
    };
    collector().write().await.record(record);
}

pub async fn aggregated() -> AggregatedMetrics {
    collector().read().await.aggregated()
}

/// Background retention trim; stops when `shutdown` flips true.
pub fn spawn_retention_task(
    retention: Duration,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cutoff = SystemTime::now() - retention;
                    let trimmed = collector().write().await.trim_older_than(cutoff);
                    if trimmed > 0 {
                        tracing::debug!(trimmed, "trimmed request metrics past retention");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
