//! Windowed speed accounting
//!
//! Tracks per-worker byte rates over a short rolling window and aggregates
//! them into the global download speed. A worker whose windowed rate falls
//! well below its own recent average for several consecutive samples is
//! reported as starving so the manager can decide whether to restart it.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Width of the rolling rate window.
const WINDOW: Duration = Duration::from_secs(5);

/// A sample is sub-threshold when the windowed rate drops below this
/// fraction of the worker's running average.
const STARVE_FRACTION: f64 = 0.25;

/// Consecutive sub-threshold samples before a worker counts as starving.
const STARVE_SAMPLES: u32 = 3;

/// Samples to observe before pace judgements are made at all.
const WARMUP_SAMPLES: u32 = 10;

/// Pace verdict for a single progress sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPace {
    /// Worker is keeping up with its own recent average.
    Healthy,
    /// Worker has been under the rate floor for several samples.
    Starving,
}

#[derive(Debug)]
struct WorkerWindow {
    samples: VecDeque<(Instant, u64)>,
    window_bytes: u64,
    avg_rate: f64,
    sample_count: u32,
    below_floor: u32,
}

impl WorkerWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            window_bytes: 0,
            avg_rate: 0.0,
            sample_count: 0,
            below_floor: 0,
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.samples.front() {
            if now.duration_since(at) <= WINDOW {
                break;
            }
            self.window_bytes -= bytes;
            self.samples.pop_front();
        }
    }

    fn rate(&self, now: Instant) -> f64 {
        let span = match self.samples.front() {
            Some(&(at, _)) => now.duration_since(at).max(Duration::from_millis(500)),
            None => return 0.0,
        };
        self.window_bytes as f64 / span.as_secs_f64()
    }
}

/// Rolling per-worker and aggregate byte-rate meter.
pub struct SpeedMeter {
    workers: Mutex<HashMap<u64, WorkerWindow>>,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking a worker.
    pub fn init(&self, worker_id: u64) {
        if let Ok(mut workers) = self.workers.lock() {
            workers.insert(worker_id, WorkerWindow::new());
        }
    }

    /// Drop a worker from the aggregate.
    pub fn stop(&self, worker_id: u64) {
        if let Ok(mut workers) = self.workers.lock() {
            workers.remove(&worker_id);
        }
    }

    /// Record a progress sample; returns a pace verdict once warmed up.
    pub fn add(&self, worker_id: u64, bytes: u64) -> Option<WorkerPace> {
        self.add_at(worker_id, bytes, Instant::now())
    }

    fn add_at(&self, worker_id: u64, bytes: u64, now: Instant) -> Option<WorkerPace> {
        let mut workers = self.workers.lock().ok()?;
        let window = workers.get_mut(&worker_id)?;

        window.samples.push_back((now, bytes));
        window.window_bytes += bytes;
        window.evict(now);

        let rate = window.rate(now);
        window.sample_count += 1;

        if window.sample_count <= WARMUP_SAMPLES {
            // Seed the average before judging anything.
            let n = window.sample_count as f64;
            window.avg_rate += (rate - window.avg_rate) / n;
            return None;
        }

        window.avg_rate = window.avg_rate * 0.9 + rate * 0.1;

        if rate < window.avg_rate * STARVE_FRACTION {
            window.below_floor += 1;
            if window.below_floor >= STARVE_SAMPLES {
                return Some(WorkerPace::Starving);
            }
            None
        } else {
            window.below_floor = 0;
            Some(WorkerPace::Healthy)
        }
    }

    /// Aggregate windowed rate across all live workers, in bytes/second.
    pub fn total_rate(&self) -> u64 {
        self.total_rate_at(Instant::now())
    }

    fn total_rate_at(&self, now: Instant) -> u64 {
        match self.workers.lock() {
            Ok(mut workers) => workers
                .values_mut()
                .map(|w| {
                    w.evict(now);
                    w.rate(now) as u64
                })
                .sum(),
            Err(_) => 0,
        }
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes per second to human readable speed for log lines.
pub fn format_speed(bps: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bps >= GB {
        format!("{:.2} GB/s", bps as f64 / GB as f64)
    } else if bps >= MB {
        format!("{:.2} MB/s", bps as f64 / MB as f64)
    } else if bps >= KB {
        format!("{:.2} KB/s", bps as f64 / KB as f64)
    } else {
        format!("{} B/s", bps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(500), "500 B/s");
        assert_eq!(format_speed(1500), "1.46 KB/s");
        assert_eq!(format_speed(1_500_000), "1.43 MB/s");
        assert_eq!(format_speed(1_500_000_000), "1.40 GB/s");
    }

    #[test]
    fn test_unknown_worker_yields_nothing() {
        let meter = SpeedMeter::new();
        assert_eq!(meter.add(42, 1024), None);
    }

    #[test]
    fn test_warmup_yields_no_verdict() {
        let meter = SpeedMeter::new();
        meter.init(1);
        let base = Instant::now();
        for i in 0..WARMUP_SAMPLES {
            let at = base + Duration::from_millis(100 * i as u64);
            assert_eq!(meter.add_at(1, 65536, at), None);
        }
    }

    #[test]
    fn test_steady_worker_is_healthy() {
        let meter = SpeedMeter::new();
        meter.init(1);
        let base = Instant::now();
        let mut verdict = None;
        for i in 0..20u64 {
            let at = base + Duration::from_millis(100 * i);
            verdict = meter.add_at(1, 65536, at);
        }
        assert_eq!(verdict, Some(WorkerPace::Healthy));
    }

    #[test]
    fn test_collapsing_worker_goes_starving() {
        let meter = SpeedMeter::new();
        meter.init(1);
        let base = Instant::now();
        let mut at = base;
        for i in 0..20u64 {
            at = base + Duration::from_millis(100 * i);
            meter.add_at(1, 1_048_576, at);
        }
        // Rate collapses: tiny trickles spread over long gaps push the
        // window far below a quarter of the established average.
        let mut verdict = None;
        for _ in 0..6 {
            at += Duration::from_secs(6);
            verdict = meter.add_at(1, 16, at);
            if verdict == Some(WorkerPace::Starving) {
                break;
            }
        }
        assert_eq!(verdict, Some(WorkerPace::Starving));
    }

    #[test]
    fn test_stop_removes_worker_from_aggregate() {
        let meter = SpeedMeter::new();
        meter.init(1);
        let base = Instant::now();
        meter.add_at(1, 1_048_576, base);
        assert!(meter.total_rate_at(base + Duration::from_secs(1)) > 0);
        meter.stop(1);
        assert_eq!(meter.total_rate_at(base + Duration::from_secs(1)), 0);
    }
}
