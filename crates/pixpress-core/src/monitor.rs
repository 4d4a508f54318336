//! Process resource sampling for compression runs.
//!
//! The [`ResourceMonitor`] samples resident memory on a fixed sub-second
//! interval in a background task and reports the peak once stopped. CPU
//! usage is derived by the caller from [`process_cpu_time`] readings taken
//! before and after the run.

use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Source of resident-memory readings, in bytes.
pub trait MemorySampler: Send + 'static {
    /// Current resident memory, or `None` if it cannot be read.
    fn sample(&mut self) -> Option<u64>;
}

/// Samples the current process through `sysinfo`.
pub struct ProcessSampler {
    system: System,
    pid: Pid,
}

impl ProcessSampler {
    /// Sampler for the current process, if its pid can be determined.
    pub fn current() -> Option<Self> {
        let pid = sysinfo::get_current_pid().ok()?;
        Some(Self {
            system: System::new(),
            pid,
        })
    }

    fn refresh(&mut self, kind: ProcessRefreshKind) {
        self.system
            .refresh_processes_specifics(ProcessesToUpdate::Some(&[self.pid]), false, kind);
    }

    /// Cumulative CPU time consumed by the process so far.
    pub fn cpu_time(&mut self) -> Option<Duration> {
        self.refresh(ProcessRefreshKind::nothing().with_cpu());
        self.system
            .process(self.pid)
            .map(|p| Duration::from_millis(p.accumulated_cpu_time()))
    }
}

impl MemorySampler for ProcessSampler {
    fn sample(&mut self) -> Option<u64> {
        self.refresh(ProcessRefreshKind::nothing().with_memory());
        self.system.process(self.pid).map(|p| p.memory())
    }
}

/// Cumulative CPU time of the current process.
pub fn process_cpu_time() -> Option<Duration> {
    ProcessSampler::current()?.cpu_time()
}

/// CPU time over wall time, in percent; zero when no wall time elapsed.
pub fn cpu_percent(cpu_used: Duration, wall: Duration) -> f64 {
    if wall.is_zero() {
        return 0.0;
    }
    cpu_used.as_secs_f64() / wall.as_secs_f64() * 100.0
}

/// Convert bytes to megabytes (MiB).
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Periodic peak-memory sampler.
#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    interval: Duration,
}

impl ResourceMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Start sampling the current process.
    pub fn start(&self) -> MonitorHandle {
        match ProcessSampler::current() {
            Some(sampler) => self.start_with(Box::new(sampler)),
            None => {
                tracing::warn!("Cannot determine current pid; memory sampling disabled");
                self.start_with(Box::new(Unavailable))
            }
        }
    }

    /// Start sampling with a custom sampler.
    pub fn start_with(&self, mut sampler: Box<dyn MemorySampler>) -> MonitorHandle {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut peak = 0u64;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(rss) = sampler.sample() {
                            peak = peak.max(rss);
                        }
                    }
                }
            }

            // One last reading so very short runs still report something
            if let Some(rss) = sampler.sample() {
                peak = peak.max(rss);
            }
            peak
        });

        MonitorHandle { stop, task }
    }
}

struct Unavailable;

impl MemorySampler for Unavailable {
    fn sample(&mut self) -> Option<u64> {
        None
    }
}

/// Handle to a running monitor.
pub struct MonitorHandle {
    stop: CancellationToken,
    task: JoinHandle<u64>,
}

impl MonitorHandle {
    /// Stop sampling and return the peak resident memory in bytes.
    pub async fn stop(self) -> u64 {
        self.stop.cancel();
        match self.task.await {
            Ok(peak) => peak,
            Err(e) => {
                tracing::warn!("Resource monitor task failed: {}", e);
                0
            }
        }
    }
}
