//! Periodic sampler feeding the sender.
//!
//! The keyed snapshot lives in a map under a read-write lock: the two
//! samplers write, `snapshot()` takes a cheap copy under the read lock.
//! `PollCount` is a running total over the process lifetime, not a
//! per-report figure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::watch;

use crate::metric::Metric;

pub struct Collector {
    metrics: RwLock<HashMap<String, Metric>>,
    poll_count: AtomicI64,
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    pub fn new() -> Self {
        Collector {
            metrics: RwLock::new(HashMap::new()),
            poll_count: AtomicI64::new(0),
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Samples process-level runtime gauges plus `RandomValue`, and bumps
    /// the `PollCount` counter.
    pub fn sample(&self) {
        let mut gauges: Vec<(&'static str, f64)> = Vec::new();
        {
            let mut system = self.system.lock().unwrap();
            if let Some(pid) = self.pid {
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                if let Some(process) = system.process(pid) {
                    let disk = process.disk_usage();
                    gauges.extend([
                        ("ResidentMemory", process.memory() as f64),
                        ("VirtualMemory", process.virtual_memory() as f64),
                        ("CpuUsage", f64::from(process.cpu_usage())),
                        ("RunTime", process.run_time() as f64),
                        ("StartTime", process.start_time() as f64),
                        ("DiskReadBytes", disk.read_bytes as f64),
                        ("DiskWrittenBytes", disk.written_bytes as f64),
                        ("TotalDiskReadBytes", disk.total_read_bytes as f64),
                        ("TotalDiskWrittenBytes", disk.total_written_bytes as f64),
                    ]);
                }
            }
        }
        let random: f64 = rand::random();
        let count = self.poll_count.fetch_add(1, Ordering::SeqCst) + 1;

        let mut metrics = self.metrics.write().unwrap();
        for (name, value) in gauges {
            metrics.insert(name.to_string(), Metric::gauge(name, value));
        }
        metrics.insert(
            "RandomValue".to_string(),
            Metric::gauge("RandomValue", random),
        );
        metrics.insert(
            "PollCount".to_string(),
            Metric::counter("PollCount", count),
        );
    }

    /// Samples host memory and per-CPU utilization.
    pub fn sample_system(&self) {
        let mut gauges: Vec<(String, f64)> = Vec::new();
        {
            let mut system = self.system.lock().unwrap();
            system.refresh_memory();
            system.refresh_cpu_usage();
            gauges.push(("TotalMemory".to_string(), system.total_memory() as f64));
            gauges.push(("FreeMemory".to_string(), system.free_memory() as f64));
            for (i, cpu) in system.cpus().iter().enumerate() {
                gauges.push((format!("CPUutilization{}", i + 1), f64::from(cpu.cpu_usage())));
            }
        }
        let mut metrics = self.metrics.write().unwrap();
        for (name, value) in gauges {
            metrics.insert(name.clone(), Metric::gauge(name, value));
        }
    }

    /// Copies the current map; callers get an independent batch.
    pub fn snapshot(&self) -> Vec<Metric> {
        self.metrics.read().unwrap().values().cloned().collect()
    }

    pub fn poll_count(&self) -> i64 {
        self.poll_count.load(Ordering::SeqCst)
    }

    /// Ticker loop; each tick runs both samplers concurrently and joins
    /// them before the next tick is considered.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        poll_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(poll_interval);
        // interval fires immediately once; consume it so the first sample
        // lands one full poll interval after startup.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let runtime_sampler = Arc::clone(&self);
                    let host_sampler = Arc::clone(&self);
                    let runtime_task = tokio::task::spawn_blocking(move || runtime_sampler.sample());
                    let host_task = tokio::task::spawn_blocking(move || host_sampler.sample_system());
                    let _ = tokio::join!(runtime_task, host_task);
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricKind;

    #[test]
    fn poll_count_tracks_total_samples() {
        let collector = Collector::new();
        collector.sample();
        collector.sample();
        collector.sample();

        assert_eq!(collector.poll_count(), 3);
        let snapshot = collector.snapshot();
        let poll = snapshot.iter().find(|m| m.id == "PollCount").unwrap();
        assert_eq!(poll.kind, MetricKind::Counter);
        assert_eq!(poll.delta, Some(3));
    }

    #[test]
    fn random_value_is_a_unit_interval_gauge() {
        let collector = Collector::new();
        collector.sample();
        let snapshot = collector.snapshot();
        let random = snapshot.iter().find(|m| m.id == "RandomValue").unwrap();
        let value = random.value.unwrap();
        assert!((0.0..1.0).contains(&value));
    }

    #[test]
    fn system_sample_emits_host_gauges() {
        let collector = Collector::new();
        collector.sample_system();
        let snapshot = collector.snapshot();
        assert!(snapshot.iter().any(|m| m.id == "TotalMemory"));
        assert!(snapshot.iter().any(|m| m.id == "FreeMemory"));
    }

    #[test]
    fn snapshot_is_an_independent_copy() {
        let collector = Collector::new();
        collector.sample();
        let before = collector.snapshot();
        collector.sample();
        let after = collector.snapshot();

        let poll_before = before.iter().find(|m| m.id == "PollCount").unwrap();
        let poll_after = after.iter().find(|m| m.id == "PollCount").unwrap();
        assert_eq!(poll_before.delta, Some(1));
        assert_eq!(poll_after.delta, Some(2));
    }
}
