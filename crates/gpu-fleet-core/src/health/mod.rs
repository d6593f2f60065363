//! Heartbeat ingestion and provider health aggregation

mod aggregator;
mod ingestor;
mod score;
mod state;

pub use aggregator::{ApplyOutcome, HealthAggregator, SweepReport};
pub use ingestor::HeartbeatIngestor;
pub use score::{health_score, LatencyWindow, UptimeWindow};
