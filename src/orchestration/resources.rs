//! Host resource monitoring.
//!
//! The monitor samples aggregate CPU and memory use on a fixed interval and
//! tells the scheduler whether the host is under pressure. It never touches
//! running workers; the scheduler only changes how many new ones it starts.

use std::time::Duration;

use sysinfo::System;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::wlog_debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostUsage {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResourceSignal {
    Pressure(HostUsage),
    Relief(HostUsage),
}

/// Source of host usage samples.
pub trait ResourceSampler: Send + 'static {
    fn sample(&mut self) -> HostUsage;
}

pub struct SysinfoSampler {
    sys: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        // The first CPU reading is always zero; prime it.
        sys.refresh_cpu_usage();
        Self { sys }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&mut self) -> HostUsage {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (self.sys.used_memory() as f64 / total as f64 * 100.0) as f32
        };
        HostUsage {
            cpu_percent: self.sys.global_cpu_usage(),
            memory_percent,
        }
    }
}

pub struct ResourceMonitor<P: ResourceSampler> {
    sampler: P,
    cpu_threshold: f32,
    memory_threshold: f32,
    interval: Duration,
}

impl<P: ResourceSampler> ResourceMonitor<P> {
    pub fn new(sampler: P, cpu_threshold: f32, memory_threshold: f32, interval: Duration) -> Self {
        Self {
            sampler,
            cpu_threshold,
            memory_threshold,
            interval,
        }
    }

    pub fn from_config(sampler: P, config: &Config) -> Self {
        Self::new(
            sampler,
            config.cpu_threshold_percent,
            config.memory_threshold_percent,
            config.resource_check_interval(),
        )
    }

    pub fn classify(&self, usage: HostUsage) -> ResourceSignal {
        if usage.cpu_percent > self.cpu_threshold || usage.memory_percent > self.memory_threshold {
            ResourceSignal::Pressure(usage)
        } else {
            ResourceSignal::Relief(usage)
        }
    }

    /// Sample until cancelled or the receiver goes away.
    pub async fn run(mut self, tx: mpsc::Sender<ResourceSignal>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so samples are spaced.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let usage = self.sampler.sample();
                    let signal = self.classify(usage);
                    wlog_debug!("Resource sample: {:?}", signal);
                    if tx.send(signal).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
