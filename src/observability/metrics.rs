//! Metrics sink abstraction and an in-process collector
//!
//! The runner talks to a [`MetricsSink`] with statsd-style counters and
//! timers. Both calls are best-effort: they never fail from the caller's
//! point of view. [`MetricsCollector`] keeps everything in memory and can
//! produce a serializable snapshot.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Maximum timing samples kept per series
const MAX_TIMING_SAMPLES: usize = 1000;

/// Counter and timer backend injected into every pipeline run
pub trait MetricsSink: Send + Sync {
    /// Increment a counter by one
    fn increment(&self, name: &str, tags: &[(&str, &str)]);

    /// Record the time elapsed since `since`
    fn timing(&self, name: &str, since: Instant, tags: &[(&str, &str)]);
}

/// A metric name together with its tag set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub name: String,
    pub tags: BTreeMap<String, String>,
}

impl MetricKey {
    pub fn new(name: &str, tags: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.tags.is_empty() {
            let tags: Vec<String> = self.tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "{{{}}}", tags.join(","))?;
        }
        Ok(())
    }
}

/// Thread-safe in-memory metrics sink
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: Mutex<HashMap<MetricKey, u64>>,
    // microseconds
    timings: Mutex<HashMap<MetricKey, Vec<u64>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of one counter series
    pub fn counter(&self, name: &str, tags: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, tags);
        self.counters
            .lock()
            .map(|counters| counters.get(&key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Sum of a counter across all of its tag sets
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|counters| {
                counters
                    .iter()
                    .filter(|(key, _)| key.name == name)
                    .map(|(_, value)| *value)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Number of retained samples for one timing series
    pub fn timing_count(&self, name: &str, tags: &[(&str, &str)]) -> usize {
        let key = MetricKey::new(name, tags);
        self.timings
            .lock()
            .map(|timings| timings.get(&key).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Clear all series (useful for testing)
    pub fn reset(&self) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.clear();
        }
        if let Ok(mut timings) = self.timings.lock() {
            timings.clear();
        }
    }

    /// Build a point-in-time snapshot, sorted by series
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut counters: Vec<CounterSnapshot> = self
            .counters
            .lock()
            .map(|counters| {
                counters
                    .iter()
                    .map(|(key, value)| CounterSnapshot {
                        name: key.name.clone(),
                        tags: key.tags.clone(),
                        value: *value,
                    })
                    .collect()
            })
            .unwrap_or_default();
        counters.sort_by(|a, b| (&a.name, &a.tags).cmp(&(&b.name, &b.tags)));

        let mut timings: Vec<TimingSnapshot> = self
            .timings
            .lock()
            .map(|timings| {
                timings
                    .iter()
                    .map(|(key, samples)| Self::timing_snapshot(key, samples))
                    .collect()
            })
            .unwrap_or_default();
        timings.sort_by(|a, b| (&a.name, &a.tags).cmp(&(&b.name, &b.tags)));

        MetricsSnapshot {
            counters,
            timings,
            timestamp: current_timestamp(),
        }
    }

    fn timing_snapshot(key: &MetricKey, samples: &[u64]) -> TimingSnapshot {
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        let avg_us = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
        };

        TimingSnapshot {
            name: key.name.clone(),
            tags: key.tags.clone(),
            count: sorted.len(),
            avg_ms: avg_us / 1000.0,
            p50_ms: percentile(&sorted, 50.0) / 1000.0,
            p95_ms: percentile(&sorted, 95.0) / 1000.0,
            p99_ms: percentile(&sorted, 99.0) / 1000.0,
        }
    }
}

impl MetricsSink for MetricsCollector {
    fn increment(&self, name: &str, tags: &[(&str, &str)]) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(MetricKey::new(name, tags)).or_insert(0) += 1;
        }
    }

    fn timing(&self, name: &str, since: Instant, tags: &[(&str, &str)]) {
        let elapsed = since.elapsed().as_micros() as u64;
        if let Ok(mut timings) = self.timings.lock() {
            let samples = timings.entry(MetricKey::new(name, tags)).or_default();
            samples.push(elapsed);

            if samples.len() > MAX_TIMING_SAMPLES {
                samples.remove(0);
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<CounterSnapshot>,
    pub timings: Vec<TimingSnapshot>,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct CounterSnapshot {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub value: u64,
}

#[derive(Debug, Serialize)]
pub struct TimingSnapshot {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub count: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
