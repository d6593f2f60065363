//! Error types for fleet discovery and health aggregation
//!
//! Detector-level failures are normally captured and attached to discovery
//! results as warnings; only the variants that reach a caller through the
//! service boundary need to be distinguishable by clients, see
//! [`FleetError::is_client_error`].

use thiserror::Error;

use crate::contracts::{ResourceDescriptor, Vendor};

/// Main error type for fleet operations
#[derive(Error, Debug)]
pub enum FleetError {
    /// The vendor tool backing a detector is absent or not usable
    #[error("Detector unavailable for {vendor}: {reason}")]
    DetectorUnavailable { vendor: Vendor, reason: String },

    /// Some but not all devices were enumerated; the parsed ones are carried along
    #[error("Partial discovery for {vendor}: {message}")]
    PartialDiscovery {
        vendor: Vendor,
        resources: Vec<ResourceDescriptor>,
        message: String,
    },

    /// Every polled detector failed
    #[error("Discovery failed: {}", .0.join("; "))]
    DiscoveryFailed(Vec<String>),

    /// A benchmark overran its duration plus grace
    #[error("Benchmark on {resource_id} exceeded {limit_ms}ms")]
    BenchmarkTimeout { resource_id: String, limit_ms: u64 },

    /// Heartbeat timestamp is too far in the future
    #[error("Clock skew for provider {provider_id}: heartbeat is {skew_secs}s ahead (tolerance {tolerance_secs}s)")]
    ClockSkew {
        provider_id: String,
        skew_secs: i64,
        tolerance_secs: u64,
    },

    /// A detector for this vendor is already registered
    #[error("Detector already registered for vendor {0}")]
    DuplicateVendor(Vendor),

    /// No detector registered for this vendor
    #[error("No detector registered for vendor {0}")]
    UnknownVendor(Vendor),

    /// Provider not known to the identity registry
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Incident not found: {0}")]
    IncidentNotFound(String),

    #[error("Alert not found: {0}")]
    AlertNotFound(String),

    /// A lifecycle transition that the state machine does not allow
    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// Primary store unreachable
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A vendor tool ran but failed
    #[error("Command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl FleetError {
    /// Create a detector unavailable error
    pub fn unavailable(vendor: Vendor, reason: impl Into<String>) -> Self {
        FleetError::DetectorUnavailable {
            vendor,
            reason: reason.into(),
        }
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        FleetError::Parse(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        FleetError::InvalidInput(msg.into())
    }

    /// Create an invalid transition error
    pub fn invalid_transition(
        entity: impl Into<String>,
        from: impl std::fmt::Debug,
        to: impl std::fmt::Debug,
    ) -> Self {
        FleetError::InvalidTransition {
            entity: entity.into(),
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }

    /// Whether the caller's request was at fault, as opposed to the fleet or
    /// the infrastructure behind it
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            FleetError::ClockSkew { .. }
                | FleetError::UnknownProvider(_)
                | FleetError::UnknownVendor(_)
                | FleetError::ResourceNotFound(_)
                | FleetError::IncidentNotFound(_)
                | FleetError::AlertNotFound(_)
                | FleetError::InvalidTransition { .. }
                | FleetError::InvalidInput(_)
        )
    }

    /// Whether discovery may proceed with other vendors after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FleetError::DetectorUnavailable { .. }
                | FleetError::PartialDiscovery { .. }
                | FleetError::BenchmarkTimeout { .. }
                | FleetError::CommandFailed { .. }
                | FleetError::Parse(_)
        )
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::DetectorUnavailable { .. } => "detector_unavailable",
            FleetError::PartialDiscovery { .. } => "partial_discovery",
            FleetError::DiscoveryFailed(_) => "discovery_failed",
            FleetError::BenchmarkTimeout { .. } => "benchmark_timeout",
            FleetError::ClockSkew { .. } => "clock_skew",
            FleetError::DuplicateVendor(_) => "duplicate_vendor",
            FleetError::UnknownVendor(_) => "unknown_vendor",
            FleetError::UnknownProvider(_) => "unknown_provider",
            FleetError::ResourceNotFound(_) => "resource_not_found",
            FleetError::IncidentNotFound(_) => "incident_not_found",
            FleetError::AlertNotFound(_) => "alert_not_found",
            FleetError::InvalidTransition { .. } => "invalid_transition",
            FleetError::StoreUnavailable(_) => "store_unavailable",
            FleetError::Persistence(_) => "persistence_error",
            FleetError::CommandFailed { .. } => "command_failed",
            FleetError::Parse(_) => "parse_error",
            FleetError::Config(_) => "config_error",
            FleetError::InvalidInput(_) => "invalid_input",
            FleetError::Cancelled => "cancelled",
            FleetError::Metrics(_) => "metrics_error",
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Parse(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for FleetError {
    fn from(err: serde_yaml::Error) -> Self {
        FleetError::Config(format!("YAML error: {}", err))
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(err: toml::de::Error) -> Self {
        FleetError::Config(format!("TOML error: {}", err))
    }
}

/// Result type alias for fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;
