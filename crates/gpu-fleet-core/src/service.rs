//! Service facade wiring discovery, health and incidents together
//!
//! [`FleetService::builder`] performs the startup sequence: connect the
//! store (failing fast if the primary is down), register one detector per
//! enabled vendor, initialize them in parallel and start the persistence
//! writer. [`FleetService::start`] spawns the remaining background tasks,
//! all bound to one cancellation token that [`FleetService::shutdown`]
//! cancels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{SharedClock, SystemClock};
use crate::collaborators::{
    FleetStore, IdentityRegistry, InMemoryIdentityRegistry, InMemoryStore, PersistenceStore,
};
use crate::config::FleetConfig;
use crate::contracts::{
    AvailabilityEvent, BenchmarkKind, BenchmarkResult, HealthIncident, Heartbeat, HeartbeatResponse,
    IncidentStatus, ProviderHealthStatus, ResourceDescriptor, SystemAlert, SystemHealthOverview, Vendor,
};
use crate::detectors::{
    default_detectors, CommandRunner, DetectorRegistry, InitializationReport, SystemCommandRunner,
    VendorDetector,
};
use crate::discovery::{ChangeSubscription, DiscoveryEngine, DiscoveryReport};
use crate::error::Result;
use crate::health::{HealthAggregator, HeartbeatIngestor, SweepReport};
use crate::incidents::{AlertFilter, AlertManager, IncidentFilter, IncidentManager};
use crate::persistence::{persistence_channel, PersistenceHandle};
use crate::telemetry::FleetMetricsRegistry;

const ALERT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Builder for [`FleetService`]
pub struct FleetServiceBuilder {
    config: FleetConfig,
    clock: Option<SharedClock>,
    identity: Option<Arc<dyn IdentityRegistry>>,
    primary: Option<Arc<dyn PersistenceStore>>,
    cache: Option<Arc<dyn PersistenceStore>>,
    runner: Option<Arc<dyn CommandRunner>>,
    detectors: Vec<Arc<dyn VendorDetector>>,
    metrics: Option<Arc<FleetMetricsRegistry>>,
}

impl FleetServiceBuilder {
    pub fn new(config: FleetConfig) -> Self {
        Self {
            config,
            clock: None,
            identity: None,
            primary: None,
            cache: None,
            runner: None,
            detectors: Vec::new(),
            metrics: None,
        }
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn identity(mut self, identity: Arc<dyn IdentityRegistry>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn primary_store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.primary = Some(store);
        self
    }

    pub fn cache_store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.cache = Some(store);
        self
    }

    /// Runner used by the built-in vendor detectors
    pub fn command_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Use explicit detectors instead of the built-in ones
    pub fn detector(mut self, detector: Arc<dyn VendorDetector>) -> Self {
        self.detectors.push(detector);
        self
    }

    pub fn metrics(mut self, metrics: Arc<FleetMetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn build(self) -> Result<FleetService> {
        let config = self.config;
        config.validate()?;

        let primary = self
            .primary
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn PersistenceStore>);
        let store = FleetStore::connect(primary, self.cache).await?;

        let metrics_registry = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(FleetMetricsRegistry::new()?),
        };
        let metrics = metrics_registry.fleet();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let registry = Arc::new(DetectorRegistry::new(
            config.discovery.detector_timeout(),
            config.benchmark.clone(),
        ));
        let detectors = if self.detectors.is_empty() {
            let runner = self.runner.unwrap_or_else(|| {
                Arc::new(SystemCommandRunner::new(config.detectors.command_timeout())) as Arc<dyn CommandRunner>
            });
            default_detectors(&config.detectors, runner)
        } else {
            self.detectors
        };
        for detector in detectors {
            registry.register_detector(detector)?;
        }

        let cancel = CancellationToken::new();
        let init_report = registry.initialize_all(&cancel).await;
        if init_report.all_failed() && !registry.vendors().is_empty() {
            warn!("No vendor detector initialized, inventory will stay empty");
        }

        let discovery = Arc::new(DiscoveryEngine::new(
            registry.clone(),
            config.discovery.clone(),
            config.benchmark.clone(),
            clock.clone(),
            metrics.clone(),
        ));

        let incidents = Arc::new(IncidentManager::new(metrics.clone()));
        let alerts = Arc::new(AlertManager::new(config.alerts.clone(), metrics.clone()));

        let (persistence, writer) = persistence_channel(
            store.clone(),
            config.persistence.clone(),
            alerts.clone(),
            clock.clone(),
            metrics.clone(),
        );
        let writer_task = tokio::spawn(writer.run(cancel.child_token()));

        let aggregator = Arc::new(
            HealthAggregator::new(&config, incidents.clone(), alerts.clone(), clock.clone(), metrics.clone())
                .with_persistence(persistence.clone()),
        );
        let identity = self.identity.unwrap_or_else(|| {
            Arc::new(InMemoryIdentityRegistry::with_providers(config.identity.providers.iter().cloned()))
                as Arc<dyn IdentityRegistry>
        });
        let ingestor = HeartbeatIngestor::new(
            identity,
            aggregator.clone(),
            config.heartbeat.clone(),
            clock.clone(),
            metrics,
        );

        info!(
            vendors = ?registry.vendors(),
            initialized = ?init_report.initialized,
            "Fleet service ready"
        );

        Ok(FleetService {
            config,
            clock,
            metrics: metrics_registry,
            registry,
            discovery,
            aggregator,
            ingestor,
            incidents,
            alerts,
            persistence,
            store,
            init_report,
            cancel,
            tasks: Mutex::new(vec![writer_task]),
            started: AtomicBool::new(false),
        })
    }
}

pub struct FleetService {
    config: FleetConfig,
    clock: SharedClock,
    metrics: Arc<FleetMetricsRegistry>,
    registry: Arc<DetectorRegistry>,
    discovery: Arc<DiscoveryEngine>,
    aggregator: Arc<HealthAggregator>,
    ingestor: HeartbeatIngestor,
    incidents: Arc<IncidentManager>,
    alerts: Arc<AlertManager>,
    persistence: PersistenceHandle,
    store: FleetStore,
    init_report: InitializationReport,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl FleetService {
    pub fn builder(config: FleetConfig) -> FleetServiceBuilder {
        FleetServiceBuilder::new(config)
    }

    /// Spawn periodic discovery, detector monitors, the heartbeat sweeper
    /// and the alert retention purge; later calls do nothing
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut handles = Vec::new();
        handles.push(tokio::spawn(
            self.discovery.clone().run_periodic(self.cancel.child_token()),
        ));
        handles.extend(self.discovery.start_monitoring(&self.cancel));
        handles.push(tokio::spawn(
            self.aggregator.clone().run_sweeper(self.cancel.child_token()),
        ));

        let alerts = self.alerts.clone();
        let clock = self.clock.clone();
        let cancel = self.cancel.child_token();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ALERT_PURGE_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        alerts.purge_expired(clock.now());
                    }
                }
            }
        }));

        info!(tasks = handles.len(), "Background tasks started");
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);
    }

    /// Cancel background work, wait for it and release the detectors
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.registry.cleanup_all().await;
        info!("Fleet service stopped");
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn initialization_report(&self) -> &InitializationReport {
        &self.init_report
    }

    pub fn metrics(&self) -> &Arc<FleetMetricsRegistry> {
        &self.metrics
    }

    pub fn vendors(&self) -> Vec<Vendor> {
        self.registry.vendors()
    }

    pub fn available_vendors(&self) -> Vec<Vendor> {
        self.registry
            .available_detectors(None)
            .iter()
            .map(|d| d.vendor())
            .collect()
    }

    pub async fn store_healthy(&self) -> bool {
        self.store.is_healthy().await
    }

    /// Token for request-scoped work; cancelled on shutdown
    pub fn request_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub async fn discover_all(&self, force_refresh: bool, vendor_filter: Option<&[Vendor]>) -> Result<DiscoveryReport> {
        self.discovery
            .discover_all(&self.request_token(), force_refresh, vendor_filter)
            .await
    }

    pub fn inventory(&self, vendor_filter: Option<&[Vendor]>) -> Vec<ResourceDescriptor> {
        self.discovery.inventory(vendor_filter)
    }

    pub async fn get_resource_info(&self, resource_id: &str) -> Result<ResourceDescriptor> {
        self.discovery
            .get_resource_info(&self.request_token(), resource_id)
            .await
    }

    pub async fn run_benchmark(
        &self,
        resource_id: &str,
        kinds: &[BenchmarkKind],
        duration: Option<Duration>,
    ) -> Result<Vec<BenchmarkResult>> {
        self.discovery
            .run_benchmark(&self.request_token(), resource_id, kinds, duration)
            .await
    }

    pub fn benchmark_history(&self, resource_id: &str) -> Vec<BenchmarkResult> {
        self.discovery.benchmark_history(resource_id)
    }

    pub fn stream_changes(&self) -> ChangeSubscription {
        self.discovery.subscribe()
    }

    pub fn stream_availability(&self) -> broadcast::Receiver<AvailabilityEvent> {
        self.aggregator.subscribe_availability()
    }

    pub fn stream_alerts(&self) -> broadcast::Receiver<SystemAlert> {
        self.alerts.subscribe()
    }

    pub async fn submit_heartbeat(&self, heartbeat: Heartbeat) -> Result<HeartbeatResponse> {
        self.ingestor.ingest(heartbeat).await
    }

    pub async fn provider_health(&self, provider_id: &str) -> Result<ProviderHealthStatus> {
        self.aggregator.provider_health(provider_id).await
    }

    pub async fn providers(&self) -> Vec<ProviderHealthStatus> {
        self.aggregator.providers().await
    }

    pub async fn system_overview(&self) -> SystemHealthOverview {
        self.aggregator.system_overview().await
    }

    /// Run the missed-heartbeat sweep now instead of waiting for the next tick
    pub async fn sweep_now(&self) -> SweepReport {
        self.aggregator.sweep_at(self.clock.now()).await
    }

    pub fn list_incidents(&self, filter: &IncidentFilter) -> Vec<HealthIncident> {
        self.incidents.list(filter)
    }

    pub fn get_incident(&self, id: Uuid) -> Result<HealthIncident> {
        self.incidents.get(id)
    }

    /// Operator transition; alerts whose incidents are all done get resolved
    pub async fn transition_incident(
        &self,
        id: Uuid,
        status: IncidentStatus,
        note: Option<String>,
    ) -> Result<HealthIncident> {
        let now = self.clock.now();
        let incident = self.incidents.transition(id, status, note, now)?;
        let resolved = self.alerts.reconcile(&self.incidents, now);

        self.persistence.submit(incident.clone());
        for alert in resolved {
            self.persistence.submit(alert);
        }
        Ok(incident)
    }

    pub fn list_alerts(&self, filter: &AlertFilter) -> Vec<SystemAlert> {
        self.alerts.list(filter)
    }

    pub fn get_alert(&self, id: Uuid) -> Result<SystemAlert> {
        self.alerts.get(id)
    }

    pub async fn acknowledge_alert(&self, id: Uuid) -> Result<SystemAlert> {
        let alert = self.alerts.acknowledge(id, self.clock.now())?;
        self.persistence.submit(alert.clone());
        Ok(alert)
    }

    pub async fn suppress_alert(&self, id: Uuid) -> Result<SystemAlert> {
        let alert = self.alerts.suppress(id, self.clock.now())?;
        self.persistence.submit(alert.clone());
        Ok(alert)
    }

    pub async fn resolve_alert(&self, id: Uuid) -> Result<SystemAlert> {
        let alert = self.alerts.resolve(id, self.clock.now())?;
        self.persistence.submit(alert.clone());
        Ok(alert)
    }

    pub fn metrics_text(&self) -> Result<String> {
        self.metrics.encode_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::ScriptedCommandRunner;
    use crate::error::FleetError;

    #[tokio::test]
    async fn test_unhealthy_primary_store_fails_startup() {
        let store = Arc::new(InMemoryStore::new());
        store.set_healthy(false);
        let result = FleetService::builder(FleetConfig::default())
            .primary_store(store)
            .command_runner(Arc::new(ScriptedCommandRunner::new()))
            .build()
            .await;
        assert!(matches!(result, Err(FleetError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_missing_vendor_tools_do_not_fail_startup() {
        let service = FleetService::builder(FleetConfig::default())
            .command_runner(Arc::new(ScriptedCommandRunner::new()))
            .build()
            .await
            .unwrap();

        assert_eq!(service.vendors().len(), 3);
        assert!(service.available_vendors().is_empty());
        assert_eq!(service.initialization_report().failed.len(), 3);

        service.start();
        service.start();
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_vendors_not_registered() {
        let config = FleetConfig::builder().vendors(&[Vendor::Nvidia]).build();
        let service = FleetService::builder(config)
            .command_runner(Arc::new(ScriptedCommandRunner::new()))
            .build()
            .await
            .unwrap();
        assert_eq!(service.vendors(), vec![Vendor::Nvidia]);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_configured_providers_seed_identity_registry() {
        let config = FleetConfig::builder().providers(["p1"]).build();
        let service = FleetService::builder(config)
            .command_runner(Arc::new(ScriptedCommandRunner::new()))
            .build()
            .await
            .unwrap();

        let now = chrono::Utc::now();
        assert!(service.submit_heartbeat(Heartbeat::new("p1", now)).await.unwrap().accepted);
        assert!(matches!(
            service.submit_heartbeat(Heartbeat::new("p2", now)).await,
            Err(FleetError::UnknownProvider(_))
        ));
        service.shutdown().await;
    }
}
