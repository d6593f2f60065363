//! AMD detector backed by `rocm-smi --json`

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{parse_reading, CommandRunner, ToolState, VendorDetector};
use crate::contracts::{Capabilities, DeviceStatus, DriverInfo, ResourceDescriptor, ResourceSpecs, Vendor};
use crate::error::{FleetError, Result};

const TOOL: &str = "rocm-smi";

const QUERY_ARGS: [&str; 10] = [
    "--showid",
    "--showproductname",
    "--showuniqueid",
    "--showmeminfo",
    "vram",
    "--showuse",
    "--showtemp",
    "--showpower",
    "--showdriverversion",
    "--json",
];

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug)]
pub struct AmdDetector {
    runner: Arc<dyn CommandRunner>,
    tool: ToolState,
    monitor_interval: Duration,
}

impl AmdDetector {
    pub fn new(runner: Arc<dyn CommandRunner>, monitor_interval: Duration) -> Self {
        Self {
            runner,
            tool: ToolState::default(),
            monitor_interval,
        }
    }
}

#[async_trait]
impl VendorDetector for AmdDetector {
    fn vendor(&self) -> Vendor {
        Vendor::Amd
    }

    async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        if self.tool.is_initialized() && self.tool.is_available() {
            return Ok(());
        }
        if !self.runner.exists(TOOL).await {
            self.tool.mark(false);
            return Err(FleetError::unavailable(Vendor::Amd, "rocm-smi not found"));
        }
        match self.runner.run_checked(cancel, TOOL, &["--showid", "--json"]).await {
            Ok(_) => {
                self.tool.mark(true);
                info!(vendor = "amd", "Detector initialized");
                Ok(())
            }
            Err(FleetError::Cancelled) => Err(FleetError::Cancelled),
            Err(e) => {
                self.tool.mark(false);
                Err(FleetError::unavailable(Vendor::Amd, e.to_string()))
            }
        }
    }

    async fn cleanup(&self) -> Result<()> {
        self.tool.reset();
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.tool.is_available()
    }

    async fn discover_resources(&self, cancel: &CancellationToken) -> Result<Vec<ResourceDescriptor>> {
        self.tool.require(Vendor::Amd)?;

        let output = self.runner.run_checked(cancel, TOOL, &QUERY_ARGS).await?;
        let report: Value = serde_json::from_str(&output)?;
        let (resources, failures) = parse_report(&report)?;

        if failures.is_empty() {
            debug!(vendor = "amd", count = resources.len(), "Discovered GPUs");
            return Ok(resources);
        }
        if resources.is_empty() {
            return Err(FleetError::parse(format!(
                "rocm-smi listed {} cards but none could be parsed: {}",
                failures.len(),
                failures.join("; ")
            )));
        }
        warn!(vendor = "amd", parsed = resources.len(), failed = failures.len(), "Partial GPU enumeration");
        Err(FleetError::PartialDiscovery {
            vendor: Vendor::Amd,
            message: format!(
                "parsed {} of {} cards",
                resources.len(),
                resources.len() + failures.len()
            ),
            resources,
        })
    }

    fn monitor_interval(&self) -> Duration {
        self.monitor_interval
    }
}

fn parse_report(report: &Value) -> Result<(Vec<ResourceDescriptor>, Vec<String>)> {
    let entries = report
        .as_object()
        .ok_or_else(|| FleetError::parse("rocm-smi output is not a JSON object"))?;

    let driver = entries
        .get("system")
        .and_then(Value::as_object)
        .and_then(|system| text(system, &["Driver version"]))
        .unwrap_or_default();

    let mut cards: Vec<(u32, &Map<String, Value>)> = entries
        .iter()
        .filter_map(|(key, value)| {
            let index = key.strip_prefix("card")?.parse().ok()?;
            Some((index, value.as_object()?))
        })
        .collect();
    cards.sort_by_key(|(index, _)| *index);

    let mut resources = Vec::new();
    let mut failures = Vec::new();
    for (index, card) in cards {
        match parse_card(index, card, &driver) {
            Ok(resource) => resources.push(resource),
            Err(e) => failures.push(format!("card{}: {}", index, e)),
        }
    }
    Ok((resources, failures))
}

fn parse_card(index: u32, card: &Map<String, Value>, driver: &str) -> std::result::Result<ResourceDescriptor, String> {
    let uuid = text(card, &["Unique ID"]).ok_or("no unique id")?;
    let total_bytes: u64 = text(card, &["VRAM Total Memory (B)"])
        .and_then(|v| parse_reading(&v))
        .ok_or("no VRAM total")?;
    let used_bytes: u64 = text(card, &["VRAM Total Used Memory (B)"])
        .and_then(|v| parse_reading(&v))
        .unwrap_or(0);

    let name = text(card, &["Card Series", "Card series", "Card SKU", "Card Model", "Card model"])
        .unwrap_or_else(|| "AMD GPU".to_string());
    let gfx = text(card, &["GFX Version"]);

    let temperature_c = ["Temperature (Sensor edge) (C)", "Temperature (Sensor junction) (C)"]
        .iter()
        .find_map(|key| text(card, &[*key]).and_then(|v| parse_reading(&v)));
    let power_draw_w = text(
        card,
        &[
            "Average Graphics Package Power (W)",
            "Current Socket Graphics Package Power (W)",
        ],
    )
    .and_then(|v| parse_reading(&v));

    let memory_total_mb = total_bytes / BYTES_PER_MB;
    let memory_used_mb = used_bytes / BYTES_PER_MB;

    Ok(ResourceDescriptor::new(Vendor::Amd, uuid, index, name)
        .with_specs(ResourceSpecs {
            memory_total_mb,
            architecture: gfx.as_deref().map(architecture).unwrap_or("unknown").to_string(),
            compute_capability: gfx.clone(),
            ..ResourceSpecs::default()
        })
        .with_status(DeviceStatus {
            utilization_pct: text(card, &["GPU use (%)"])
                .and_then(|v| parse_reading(&v))
                .unwrap_or(0.0),
            memory_used_mb,
            memory_free_mb: memory_total_mb.saturating_sub(memory_used_mb),
            temperature_c,
            power_draw_w,
            processes: Vec::new(),
        })
        .with_capabilities(capabilities(gfx.as_deref()))
        .with_driver(DriverInfo {
            version: driver.to_string(),
            runtime_version: None,
        }))
}

/// First present key, as text; rocm-smi mixes strings and numbers
fn text(entry: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match entry.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn architecture(gfx: &str) -> &'static str {
    match gfx {
        "gfx908" => "CDNA",
        "gfx90a" => "CDNA 2",
        g if g.starts_with("gfx94") => "CDNA 3",
        g if g.starts_with("gfx95") => "CDNA 4",
        g if g.starts_with("gfx103") => "RDNA 2",
        g if g.starts_with("gfx110") => "RDNA 3",
        g if g.starts_with("gfx120") => "RDNA 4",
        _ => "unknown",
    }
}

fn capabilities(gfx: Option<&str>) -> Capabilities {
    let arch = gfx.map(architecture).unwrap_or("unknown");
    let datacenter = arch.starts_with("CDNA");

    let mut precisions = vec!["fp32".to_string(), "fp16".to_string(), "int8".to_string()];
    if datacenter {
        precisions.push("fp64".into());
        precisions.push("bf16".into());
    }
    if arch == "CDNA 3" || arch == "CDNA 4" {
        precisions.push("fp8".into());
    }

    Capabilities {
        apis: vec!["rocm".into(), "hip".into(), "opencl".into(), "vulkan".into()],
        precisions,
        virtualization: if datacenter { vec!["sr-iov".into()] } else { Vec::new() },
    }
}
