//! Benchmark results
//!
//! A benchmark never mutates a resource's specs; results are appended to a
//! per-resource history instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Benchmarks supported by every detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkKind {
    /// Peak temperature under observation
    Thermal,
    /// Average board power draw
    Power,
    /// Average free device memory
    Memory,
    /// Average idle headroom
    Utilization,
}

impl BenchmarkKind {
    pub const ALL: [BenchmarkKind; 4] = [
        BenchmarkKind::Thermal,
        BenchmarkKind::Power,
        BenchmarkKind::Memory,
        BenchmarkKind::Utilization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BenchmarkKind::Thermal => "thermal",
            BenchmarkKind::Power => "power",
            BenchmarkKind::Memory => "memory",
            BenchmarkKind::Utilization => "utilization",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            BenchmarkKind::Thermal => "celsius",
            BenchmarkKind::Power => "watts",
            BenchmarkKind::Memory => "mebibytes",
            BenchmarkKind::Utilization => "percent",
        }
    }

    pub fn test_name(&self) -> &'static str {
        match self {
            BenchmarkKind::Thermal => "peak_temperature",
            BenchmarkKind::Power => "average_power_draw",
            BenchmarkKind::Memory => "average_free_memory",
            BenchmarkKind::Utilization => "average_idle_headroom",
        }
    }
}

impl fmt::Display for BenchmarkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BenchmarkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BenchmarkKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown benchmark kind: {}", s))
    }
}

/// Outcome of one benchmark run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub resource_id: String,
    pub benchmark_type: BenchmarkKind,
    pub test_name: String,
    pub score: f64,
    pub unit: String,
    pub duration_seconds: f64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl BenchmarkResult {
    pub fn new(resource_id: impl Into<String>, kind: BenchmarkKind, score: f64, duration_seconds: f64) -> Self {
        Self {
            resource_id: resource_id.into(),
            benchmark_type: kind,
            test_name: kind.test_name().to_string(),
            score,
            unit: kind.unit().to_string(),
            duration_seconds,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl fmt::Display for BenchmarkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {:.2} {} ({:.1}s)",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.resource_id,
            self.test_name,
            self.score,
            self.unit,
            self.duration_seconds
        )
    }
}
