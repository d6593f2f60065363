use std::sync::Arc;
use tracing::{debug, warn};

use super::aggregator::{ApplyOutcome, HealthAggregator};
use crate::clock::SharedClock;
use crate::collaborators::IdentityRegistry;
use crate::config::HeartbeatConfig;
use crate::contracts::{Heartbeat, HeartbeatResponse};
use crate::error::{FleetError, Result};
use crate::telemetry::FleetMetrics;

/// Entry point for provider heartbeats.
///
/// Validation order: structure, provider identity, clock skew. A heartbeat
/// failing any of them is rejected with an error and changes nothing; a
/// duplicate or stale one is acknowledged with `accepted: false`.
pub struct HeartbeatIngestor {
    identity: Arc<dyn IdentityRegistry>,
    aggregator: Arc<HealthAggregator>,
    config: HeartbeatConfig,
    clock: SharedClock,
    metrics: Arc<FleetMetrics>,
}

impl HeartbeatIngestor {
    pub fn new(
        identity: Arc<dyn IdentityRegistry>,
        aggregator: Arc<HealthAggregator>,
        config: HeartbeatConfig,
        clock: SharedClock,
        metrics: Arc<FleetMetrics>,
    ) -> Self {
        Self {
            identity,
            aggregator,
            config,
            clock,
            metrics,
        }
    }

    pub async fn ingest(&self, heartbeat: Heartbeat) -> Result<HeartbeatResponse> {
        let received_at = self.clock.now();

        if let Err(e) = heartbeat.validate() {
            self.metrics.record_heartbeat("rejected");
            return Err(e);
        }

        match self.identity.get_by_id(&heartbeat.provider_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                self.metrics.record_heartbeat("rejected");
                warn!(provider_id = %heartbeat.provider_id, "Heartbeat from unknown provider");
                return Err(FleetError::UnknownProvider(heartbeat.provider_id));
            }
            Err(e) => {
                self.metrics.record_heartbeat("error");
                warn!(provider_id = %heartbeat.provider_id, error = %e, "Identity lookup failed");
                return Err(e);
            }
        }

        let ahead_ms = (heartbeat.timestamp - received_at).num_milliseconds();
        let tolerance = self.config.clock_skew_tolerance_secs;
        if ahead_ms > (tolerance as i64).saturating_mul(1000) {
            self.metrics.record_heartbeat("rejected");
            warn!(provider_id = %heartbeat.provider_id, ahead_ms, "Heartbeat from the future rejected");
            return Err(FleetError::ClockSkew {
                provider_id: heartbeat.provider_id,
                skew_secs: ahead_ms / 1000,
                tolerance_secs: tolerance,
            });
        }
        self.metrics
            .observe_heartbeat_delivery((-ahead_ms).max(0) as f64 / 1000.0);

        let mut response = HeartbeatResponse {
            accepted: true,
            next_heartbeat_interval_secs: self.config.interval_secs,
            required_checks: self.config.required_checks.clone(),
            warnings: Vec::new(),
            received_at,
        };

        match self.aggregator.apply_heartbeat(&heartbeat, received_at).await {
            ApplyOutcome::Applied { warnings, .. } => {
                self.metrics.record_heartbeat("accepted");
                response.warnings = warnings;
                if let Err(e) = self
                    .identity
                    .update_last_seen(&heartbeat.provider_id, received_at)
                    .await
                {
                    warn!(provider_id = %heartbeat.provider_id, error = %e, "Failed to update last seen");
                }
            }
            ApplyOutcome::Duplicate => {
                self.metrics.record_heartbeat("duplicate");
                debug!(provider_id = %heartbeat.provider_id, "Duplicate heartbeat ignored");
                response.accepted = false;
                response
                    .warnings
                    .push("duplicate heartbeat: already applied".to_string());
            }
            ApplyOutcome::Stale => {
                self.metrics.record_heartbeat("stale");
                debug!(provider_id = %heartbeat.provider_id, "Stale heartbeat ignored");
                response.accepted = false;
                response.warnings.push(format!(
                    "stale heartbeat: timestamp {} is older than the last applied heartbeat",
                    heartbeat.timestamp.to_rfc3339()
                ));
            }
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::collaborators::{MockIdentityRegistry, ProviderRecord};
    use crate::config::FleetConfig;
    use crate::incidents::{AlertManager, IncidentManager};
    use crate::telemetry::FleetMetricsRegistry;
    use chrono::{Duration, Utc};

    fn ingestor(identity: MockIdentityRegistry, clock: &ManualClock) -> (HeartbeatIngestor, Arc<HealthAggregator>) {
        let config = FleetConfig::default();
        let metrics = FleetMetricsRegistry::new().unwrap().fleet();
        let aggregator = Arc::new(HealthAggregator::new(
            &config,
            Arc::new(IncidentManager::new(metrics.clone())),
            Arc::new(AlertManager::new(config.alerts.clone(), metrics.clone())),
            Arc::new(clock.clone()),
            metrics.clone(),
        ));
        (
            HeartbeatIngestor::new(
                Arc::new(identity),
                aggregator.clone(),
                config.heartbeat,
                Arc::new(clock.clone()),
                metrics,
            ),
            aggregator,
        )
    }

    fn known_provider() -> MockIdentityRegistry {
        let mut identity = MockIdentityRegistry::new();
        identity
            .expect_get_by_id()
            .returning(|id| Ok(Some(ProviderRecord::new(id, "ops@provider.example"))));
        identity
    }

    #[tokio::test]
    async fn test_unknown_provider_rejected() {
        let mut identity = MockIdentityRegistry::new();
        identity.expect_get_by_id().times(1).returning(|_| Ok(None));
        identity.expect_update_last_seen().never();

        let clock = ManualClock::new(Utc::now());
        let (ingestor, aggregator) = ingestor(identity, &clock);
        let result = ingestor.ingest(Heartbeat::new("ghost", clock.now())).await;

        assert!(matches!(result, Err(FleetError::UnknownProvider(id)) if id == "ghost"));
        assert!(aggregator.provider_health("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_clock_skew_rejected_without_state_change() {
        let mut identity = known_provider();
        identity.expect_update_last_seen().never();

        let clock = ManualClock::new(Utc::now());
        let (ingestor, aggregator) = ingestor(identity, &clock);
        let future = clock.now() + Duration::seconds(31);
        let result = ingestor.ingest(Heartbeat::new("p1", future)).await;

        assert!(matches!(
            result,
            Err(FleetError::ClockSkew { skew_secs: 31, tolerance_secs: 30, .. })
        ));
        assert!(aggregator.provider_health("p1").await.is_err());
    }

    #[tokio::test]
    async fn test_within_tolerance_accepted() {
        let mut identity = known_provider();
        identity.expect_update_last_seen().times(1).returning(|_, _| Ok(()));

        let clock = ManualClock::new(Utc::now());
        let (ingestor, _) = ingestor(identity, &clock);
        let response = ingestor
            .ingest(Heartbeat::new("p1", clock.now() + Duration::seconds(29)))
            .await
            .unwrap();

        assert!(response.accepted);
        assert_eq!(response.next_heartbeat_interval_secs, 60);
        assert_eq!(response.received_at, clock.now());
    }

    #[tokio::test]
    async fn test_duplicate_acknowledged_not_applied() {
        let mut identity = known_provider();
        identity.expect_update_last_seen().times(1).returning(|_, _| Ok(()));

        let clock = ManualClock::new(Utc::now());
        let (ingestor, aggregator) = ingestor(identity, &clock);
        let hb = Heartbeat::new("p1", clock.now());

        assert!(ingestor.ingest(hb.clone()).await.unwrap().accepted);
        clock.advance_secs(5);
        let second = ingestor.ingest(hb).await.unwrap();

        assert!(!second.accepted);
        assert_eq!(second.warnings.len(), 1);
        let health = aggregator.provider_health("p1").await.unwrap();
        assert_eq!(health.summary.consecutive_successful_heartbeats, 1);
    }

    #[tokio::test]
    async fn test_last_seen_failure_does_not_reject() {
        let mut identity = known_provider();
        identity
            .expect_update_last_seen()
            .returning(|_, _| Err(FleetError::StoreUnavailable("registry down".into())));

        let clock = ManualClock::new(Utc::now());
        let (ingestor, _) = ingestor(identity, &clock);
        let response = ingestor.ingest(Heartbeat::new("p1", clock.now())).await.unwrap();
        assert!(response.accepted);
    }
}
