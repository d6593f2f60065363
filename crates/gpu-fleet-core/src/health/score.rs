//! Provider health score
//!
//! `score = 100 * (wu * uptime + wl * latency + wr * resources) / (wu + wl + wr)`
//! where each factor is in `[0, 1]`:
//!
//! - uptime: share of expected heartbeat slots that were filled over the
//!   rolling window
//! - latency: 1 at or below `latency_target_ms`, 0 at or above
//!   `latency_ceiling_ms`, linear in between
//! - resources: fraction of reported resources without problems (1 when
//!   none are reported)
//!
//! The weights come from [`HealthConfig`].

use std::collections::VecDeque;

use crate::config::HealthConfig;

/// Rolling record of expected heartbeat slots
#[derive(Debug, Clone)]
pub struct UptimeWindow {
    slots: VecDeque<bool>,
    capacity: usize,
}

impl UptimeWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, received: bool) {
        if self.slots.len() == self.capacity {
            self.slots.pop_front();
        }
        self.slots.push_back(received);
    }

    /// 0-100; an empty window counts as full uptime
    pub fn percentage(&self) -> f64 {
        if self.slots.is_empty() {
            return 100.0;
        }
        let received = self.slots.iter().filter(|s| **s).count();
        received as f64 * 100.0 / self.slots.len() as f64
    }
}

/// Rolling mean of heartbeat delivery latency
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, latency_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms.max(0.0));
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

fn latency_factor(config: &HealthConfig, latency_ms: f64) -> f64 {
    let target = config.latency_target_ms as f64;
    let ceiling = config.latency_ceiling_ms as f64;
    if latency_ms <= target {
        1.0
    } else if latency_ms >= ceiling || ceiling <= target {
        0.0
    } else {
        1.0 - (latency_ms - target) / (ceiling - target)
    }
}

pub fn health_score(
    config: &HealthConfig,
    uptime_pct: f64,
    average_latency_ms: f64,
    healthy_resources: usize,
    total_resources: usize,
) -> f64 {
    let total_weight = config.uptime_weight + config.latency_weight + config.resource_weight;
    if total_weight <= 0.0 {
        return 0.0;
    }

    let uptime = (uptime_pct / 100.0).clamp(0.0, 1.0);
    let latency = latency_factor(config, average_latency_ms);
    let resources = if total_resources == 0 {
        1.0
    } else {
        healthy_resources.min(total_resources) as f64 / total_resources as f64
    };

    let weighted = config.uptime_weight * uptime
        + config.latency_weight * latency
        + config.resource_weight * resources;
    (100.0 * weighted / total_weight).clamp(0.0, 100.0)
}
