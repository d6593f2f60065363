//! Integration tests for GPU Fleet Core

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gpu_fleet_core::detectors::{CommandOutput, SnapshotDiffer};
use gpu_fleet_core::*;
use proptest::prelude::*;
use std::sync::Arc;

const NVIDIA_QUERY: &str = "nvidia-smi --query-gpu=index,uuid,name,memory.total,memory.used,memory.free,utilization.gpu,\
temperature.gpu,power.draw,clocks.max.sm,clocks.max.mem,driver_version,compute_cap,pcie.link.gen.max \
--format=csv,noheader,nounits";
const NVIDIA_APPS: &str =
    "nvidia-smi --query-compute-apps=gpu_uuid,pid,process_name,used_memory --format=csv,noheader,nounits";

const GPU_0: &str = "0, GPU-aaaa, NVIDIA A100-SXM4-80GB, 81920, 1024, 80896, 35, 41, 92.50, 1410, 1593, 550.54.15, 8.0, 4";
const GPU_1: &str = "1, GPU-bbbb, NVIDIA A100-SXM4-80GB, 81920, 0, 81920, 0, 38, 60.00, 1410, 1593, 550.54.15, 8.0, 4";

fn nvidia_host() -> Arc<ScriptedCommandRunner> {
    Arc::new(
        ScriptedCommandRunner::new()
            .installed("nvidia-smi")
            .respond(
                "nvidia-smi -L",
                "GPU 0: NVIDIA A100-SXM4-80GB (UUID: GPU-aaaa)\nGPU 1: NVIDIA A100-SXM4-80GB (UUID: GPU-bbbb)\n",
            )
            .respond(NVIDIA_QUERY, &format!("{}\n{}\n", GPU_0, GPU_1))
            .respond(NVIDIA_APPS, "")
            .respond(&format!("{} -i GPU-aaaa", NVIDIA_QUERY), &format!("{}\n", GPU_0)),
    )
}

async fn discovery_service(runner: Arc<ScriptedCommandRunner>) -> FleetService {
    let config = FleetConfig::builder()
        .vendors(&[Vendor::Nvidia, Vendor::Amd])
        .build();
    FleetService::builder(config)
        .command_runner(runner)
        .build()
        .await
        .expect("service should start")
}

async fn health_service(clock: &ManualClock) -> FleetService {
    FleetService::builder(FleetConfig::default())
        .clock(Arc::new(clock.clone()))
        .identity(Arc::new(InMemoryIdentityRegistry::with_providers(["p1", "p2"])))
        .command_runner(Arc::new(ScriptedCommandRunner::new()))
        .build()
        .await
        .expect("service should start")
}

#[tokio::test]
async fn test_discovery_isolates_unavailable_vendor() {
    let service = discovery_service(nvidia_host()).await;

    assert_eq!(service.available_vendors(), vec![Vendor::Nvidia]);

    let report = service.discover_all(false, None).await.unwrap();
    assert_eq!(report.resources.len(), 2);
    assert!(report.resources.iter().all(|r| r.vendor == Vendor::Nvidia));
    assert!(report.warnings.iter().any(|w| w.starts_with("amd")));
    assert_eq!(report.events.len(), 2);
    assert!(!report.from_cache);

    let cached = service.discover_all(false, None).await.unwrap();
    assert!(cached.from_cache);
    assert_eq!(cached.resources.len(), 2);
    assert!(cached.events.is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn test_only_amd_filter_fails_when_amd_missing() {
    let service = discovery_service(nvidia_host()).await;
    let result = service.discover_all(true, Some(&[Vendor::Amd])).await;
    assert!(matches!(result, Err(FleetError::DiscoveryFailed(_))));
    service.shutdown().await;
}

#[tokio::test]
async fn test_removed_gpu_reported_after_grace_period() {
    let runner = nvidia_host();
    let service = discovery_service(runner.clone()).await;
    let mut changes = service.stream_changes();

    service.discover_all(true, None).await.unwrap();
    runner.set(
        NVIDIA_QUERY,
        CommandOutput {
            stdout: format!("{}\n", GPU_0),
            stderr: String::new(),
            exit_code: Some(0),
        },
    );

    for _ in 0..2 {
        let report = service.discover_all(true, None).await.unwrap();
        assert!(report.events.is_empty());
        assert_eq!(report.resources.len(), 2);
    }
    let report = service.discover_all(true, None).await.unwrap();
    assert_eq!(report.events.len(), 1);
    assert_eq!(report.events[0].change_type, ChangeType::Removed);
    assert_eq!(report.events[0].resource.uuid, "GPU-bbbb");
    assert_eq!(report.resources.len(), 1);

    let mut seen = Vec::new();
    for _ in 0..3 {
        if let Some(event) = changes.recv().await {
            seen.push(event.change_type);
        }
    }
    assert_eq!(seen, vec![ChangeType::Added, ChangeType::Added, ChangeType::Removed]);

    service.shutdown().await;
}

#[tokio::test]
async fn test_benchmark_recorded_in_history() {
    let config = FleetConfig::builder()
        .vendors(&[Vendor::Nvidia])
        .benchmark_grace_factor(2.0)
        .build();
    let service = FleetService::builder(config)
        .command_runner(nvidia_host())
        .build()
        .await
        .unwrap();
    service.discover_all(true, None).await.unwrap();

    let results = service
        .run_benchmark(
            "nvidia-GPU-aaaa",
            &[BenchmarkKind::Thermal],
            Some(std::time::Duration::from_millis(50)),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].score, 41.0);
    assert_eq!(service.benchmark_history("nvidia-GPU-aaaa").len(), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_provider_offline_after_missed_threshold() {
    let clock = ManualClock::new(Utc::now());
    let service = health_service(&clock).await;

    let response = service
        .submit_heartbeat(
            Heartbeat::new("p1", clock.now())
                .with_resource(ResourceStatus::new("gpu-0", ResourceState::Available)),
        )
        .await
        .unwrap();
    assert!(response.accepted);
    assert_eq!(service.provider_health("p1").await.unwrap().status, ProviderStatus::Healthy);

    clock.advance_secs(179);
    service.sweep_now().await;
    let health = service.provider_health("p1").await.unwrap();
    assert_ne!(health.status, ProviderStatus::Offline);
    assert_eq!(health.summary.missed_heartbeats, 2);

    clock.advance_secs(2);
    let report = service.sweep_now().await;
    assert_eq!(report.newly_offline, vec!["p1".to_string()]);

    let health = service.provider_health("p1").await.unwrap();
    assert_eq!(health.status, ProviderStatus::Offline);
    assert_eq!(health.resource("gpu-0").unwrap().state, ResourceState::Offline);

    clock.advance_secs(60);
    service.sweep_now().await;

    let incidents = service.list_incidents(&IncidentFilter {
        provider_id: Some("p1".to_string()),
        incident_type: Some(IncidentType::HeartbeatMissed),
        ..Default::default()
    });
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].severity, IncidentSeverity::Medium);
    assert_eq!(incidents[0].status, IncidentStatus::Open);

    service.shutdown().await;
}

#[tokio::test]
async fn test_recovery_resolves_missed_heartbeat_incident() {
    let clock = ManualClock::new(Utc::now());
    let service = health_service(&clock).await;

    service.submit_heartbeat(Heartbeat::new("p1", clock.now())).await.unwrap();
    clock.advance_secs(200);
    service.sweep_now().await;

    service.submit_heartbeat(Heartbeat::new("p1", clock.now())).await.unwrap();
    assert_eq!(service.provider_health("p1").await.unwrap().status, ProviderStatus::Healthy);

    let open = service.list_incidents(&IncidentFilter {
        active_only: true,
        ..Default::default()
    });
    assert!(open.is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn test_flip_within_one_heartbeat_emits_nothing() {
    let clock = ManualClock::new(Utc::now());
    let service = health_service(&clock).await;

    service
        .submit_heartbeat(
            Heartbeat::new("p1", clock.now())
                .with_resource(ResourceStatus::new("gpu-0", ResourceState::Available)),
        )
        .await
        .unwrap();

    let mut availability = service.stream_availability();
    clock.advance_secs(60);
    service
        .submit_heartbeat(
            Heartbeat::new("p1", clock.now())
                .with_resource(ResourceStatus::new("gpu-0", ResourceState::Available))
                .with_resource(ResourceStatus::new("gpu-0", ResourceState::Busy))
                .with_resource(ResourceStatus::new("gpu-0", ResourceState::Available)),
        )
        .await
        .unwrap();

    assert!(availability.try_recv().is_err());
    let health = service.provider_health("p1").await.unwrap();
    assert_eq!(health.resource("gpu-0").unwrap().state, ResourceState::Available);

    service.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_and_stale_heartbeats_are_no_ops() {
    let clock = ManualClock::new(Utc::now());
    let service = health_service(&clock).await;
    let t0 = clock.now();

    let busy = Heartbeat::new("p1", t0 + ChronoDuration::seconds(10))
        .with_resource(ResourceStatus::new("gpu-0", ResourceState::Busy));
    clock.advance_secs(10);
    assert!(service.submit_heartbeat(busy.clone()).await.unwrap().accepted);

    let duplicate = service.submit_heartbeat(busy).await.unwrap();
    assert!(!duplicate.accepted);

    let stale = service
        .submit_heartbeat(
            Heartbeat::new("p1", t0).with_resource(ResourceStatus::new("gpu-0", ResourceState::Available)),
        )
        .await
        .unwrap();
    assert!(!stale.accepted);
    assert!(!stale.warnings.is_empty());

    let health = service.provider_health("p1").await.unwrap();
    assert_eq!(health.summary.total_heartbeats, 1);
    assert_eq!(health.resource("gpu-0").unwrap().state, ResourceState::Busy);
    assert_eq!(health.last_heartbeat, Some(t0 + ChronoDuration::seconds(10)));

    service.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_provider_rejected() {
    let clock = ManualClock::new(Utc::now());
    let service = health_service(&clock).await;

    let result = service.submit_heartbeat(Heartbeat::new("intruder", clock.now())).await;
    assert!(matches!(result, Err(FleetError::UnknownProvider(_))));
    assert!(service.providers().await.is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn test_overheating_raises_alert_with_operator_lifecycle() {
    let clock = ManualClock::new(Utc::now());
    let service = health_service(&clock).await;
    let mut alerts = service.stream_alerts();

    service
        .submit_heartbeat(
            Heartbeat::new("p1", clock.now())
                .with_resource(ResourceStatus::new("gpu-0", ResourceState::Busy).with_metric("temperature_c", 97.0)),
        )
        .await
        .unwrap();

    let alert = alerts.recv().await.unwrap();
    assert_eq!(alert.severity, IncidentSeverity::High);
    assert_eq!(alert.affected_providers, vec!["p1".to_string()]);

    let acked = service.acknowledge_alert(alert.id).await.unwrap();
    assert_eq!(acked.status, AlertStatus::Acknowledged);
    assert!(matches!(
        service.acknowledge_alert(alert.id).await,
        Err(FleetError::InvalidTransition { .. })
    ));

    for incident_id in &acked.incident_ids {
        service
            .transition_incident(*incident_id, IncidentStatus::Resolved, Some("fan replaced".to_string()))
            .await
            .unwrap();
    }
    assert_eq!(service.get_alert(alert.id).unwrap().status, AlertStatus::Resolved);

    service.shutdown().await;
}

#[tokio::test]
async fn test_system_overview_counts_down_providers() {
    let clock = ManualClock::new(Utc::now());
    let service = health_service(&clock).await;

    service.submit_heartbeat(Heartbeat::new("p1", clock.now())).await.unwrap();
    service.submit_heartbeat(Heartbeat::new("p2", clock.now())).await.unwrap();
    assert_eq!(service.system_overview().await.overall_status, OverallStatus::Healthy);

    clock.advance_secs(150);
    service.submit_heartbeat(Heartbeat::new("p2", clock.now())).await.unwrap();
    clock.advance_secs(40);
    service.sweep_now().await;

    let overview = service.system_overview().await;
    assert_eq!(overview.total_providers, 2);
    assert_eq!(overview.overall_status, OverallStatus::Degraded);

    service.shutdown().await;
}

#[tokio::test]
async fn test_persistence_writes_reach_primary_store() {
    let clock = ManualClock::new(Utc::now());
    let store = Arc::new(InMemoryStore::new());
    let service = FleetService::builder(FleetConfig::default())
        .clock(Arc::new(clock.clone()))
        .identity(Arc::new(InMemoryIdentityRegistry::with_providers(["p1"])))
        .primary_store(store.clone())
        .command_runner(Arc::new(ScriptedCommandRunner::new()))
        .build()
        .await
        .unwrap();

    service.submit_heartbeat(Heartbeat::new("p1", clock.now())).await.unwrap();
    service.shutdown().await;

    assert_eq!(store.keys_with_prefix("provider_health/"), vec!["provider_health/p1".to_string()]);
}

#[tokio::test]
async fn test_failing_store_does_not_stall_heartbeats() {
    let clock = ManualClock::new(Utc::now());
    let store = Arc::new(InMemoryStore::new());
    store.fail_next_writes(u32::MAX);
    let config = FleetConfig::builder()
        .persistence_queue_size(1)
        .providers(["p1", "p2", "p3", "p4"])
        .build();
    let service = Arc::new(
        FleetService::builder(config)
            .clock(Arc::new(clock.clone()))
            .primary_store(store.clone())
            .command_runner(Arc::new(ScriptedCommandRunner::new()))
            .build()
            .await
            .unwrap(),
    );

    let tasks: Vec<_> = ["p1", "p2", "p3", "p4"]
        .into_iter()
        .map(|provider| {
            let service = service.clone();
            let at = clock.now();
            tokio::spawn(async move {
                tokio::time::timeout(
                    std::time::Duration::from_secs(3),
                    service.submit_heartbeat(
                        Heartbeat::new(provider, at)
                            .with_resource(ResourceStatus::new("gpu-0", ResourceState::Available)),
                    ),
                )
                .await
            })
        })
        .collect();

    for task in tasks {
        let response = task.await.unwrap().expect("heartbeat should not wait on the store");
        assert!(response.unwrap().accepted);
    }
    assert_eq!(service.providers().await.len(), 4);

    service.shutdown().await;
}

#[tokio::test]
async fn test_monitor_loss_waits_for_discovery_grace() {
    let runner = nvidia_host();
    let config = FleetConfig::builder()
        .vendors(&[Vendor::Nvidia])
        .removal_grace_cycles(5)
        .discovery_interval_secs(3600)
        .monitor_interval_secs(1)
        .build();
    let service = FleetService::builder(config)
        .command_runner(runner.clone())
        .build()
        .await
        .unwrap();

    service.discover_all(true, None).await.unwrap();
    service.start();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let empty = || CommandOutput {
        stdout: String::new(),
        stderr: String::new(),
        exit_code: Some(0),
    };
    runner.set("nvidia-smi -L", empty());
    runner.set(NVIDIA_QUERY, empty());

    tokio::time::sleep(std::time::Duration::from_millis(3500)).await;
    assert_eq!(service.inventory(None).len(), 2);

    for _ in 0..5 {
        let report = service.discover_all(true, None).await.unwrap();
        assert!(report.events.iter().all(|e| e.change_type != ChangeType::Removed));
        assert_eq!(service.inventory(None).len(), 2);
    }
    let report = service.discover_all(true, None).await.unwrap();
    assert_eq!(report.events.len(), 2);
    assert!(report.events.iter().all(|e| e.change_type == ChangeType::Removed));
    assert!(service.inventory(None).is_empty());

    service.shutdown().await;
}

mockall::mock! {
    Registry {}

    #[async_trait]
    impl IdentityRegistry for Registry {
        async fn get_by_id(&self, provider_id: &str) -> Result<Option<ProviderRecord>>;
        async fn get_by_email(&self, email: &str) -> Result<Option<ProviderRecord>>;
        async fn create(&self, record: ProviderRecord) -> Result<ProviderRecord>;
        async fn update(&self, record: ProviderRecord) -> Result<ProviderRecord>;
        async fn update_last_seen(&self, provider_id: &str, at: DateTime<Utc>) -> Result<()>;
    }
}

#[tokio::test]
async fn test_last_seen_forwarded_to_identity_registry() {
    let clock = ManualClock::new(Utc::now());
    let now = clock.now();

    let mut identity = MockRegistry::new();
    identity
        .expect_get_by_id()
        .returning(|id| Ok(Some(ProviderRecord::new(id, "ops@provider.example"))));
    identity
        .expect_update_last_seen()
        .withf(move |id, at| id == "p1" && *at == now)
        .times(1)
        .returning(|_, _| Ok(()));

    let service = FleetService::builder(FleetConfig::default())
        .clock(Arc::new(clock.clone()))
        .identity(Arc::new(identity))
        .command_runner(Arc::new(ScriptedCommandRunner::new()))
        .build()
        .await
        .unwrap();

    service.submit_heartbeat(Heartbeat::new("p1", now)).await.unwrap();
    service.shutdown().await;
}

fn gpu(uuid: &str) -> ResourceDescriptor {
    ResourceDescriptor::new(Vendor::Nvidia, uuid, 0, "NVIDIA A100")
}

proptest! {
    #[test]
    fn prop_removal_waits_for_grace(grace in 0u32..6) {
        let mut differ = SnapshotDiffer::new(ChangeThresholds::default(), grace);
        differ.apply(vec![gpu("GPU-aaaa"), gpu("GPU-bbbb")], true);

        for _ in 0..grace {
            let events = differ.apply(vec![gpu("GPU-aaaa")], true);
            prop_assert!(events.iter().all(|e| e.change_type != ChangeType::Removed));
        }
        let events = differ.apply(vec![gpu("GPU-aaaa")], true);
        prop_assert_eq!(events.len(), 1);
        prop_assert_eq!(events[0].change_type, ChangeType::Removed);
    }

    #[test]
    fn prop_fewer_than_threshold_misses_keep_provider_online(threshold in 1u32..6, slack in 0i64..59) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let clock = ManualClock::new(Utc::now());
            let config = FleetConfig::builder().missed_threshold(threshold).build();
            let service = FleetService::builder(config)
                .clock(Arc::new(clock.clone()))
                .identity(Arc::new(InMemoryIdentityRegistry::with_providers(["p1"])))
                .command_runner(Arc::new(ScriptedCommandRunner::new()))
                .build()
                .await
                .unwrap();

            service.submit_heartbeat(Heartbeat::new("p1", clock.now())).await.unwrap();
            clock.advance_secs(60 * (threshold as i64 - 1) + slack);
            service.sweep_now().await;
            let status = service.provider_health("p1").await.unwrap().status;
            service.shutdown().await;
            assert_ne!(status, ProviderStatus::Offline);
        });
    }

    #[test]
    fn prop_newer_heartbeat_supersedes_older(
        first in proptest::collection::vec(
            prop_oneof![Just(ResourceState::Available), Just(ResourceState::Allocated), Just(ResourceState::Busy)],
            3,
        ),
        second in proptest::collection::vec(
            prop_oneof![
                Just(ResourceState::Available),
                Just(ResourceState::Allocated),
                Just(ResourceState::Busy),
                Just(ResourceState::Maintenance),
                Just(ResourceState::Offline),
                Just(ResourceState::Error),
            ],
            3,
        ),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (replayed, direct) = runtime.block_on(async {
            let reports = |states: &[ResourceState], at: DateTime<Utc>| {
                states.iter().enumerate().fold(Heartbeat::new("p1", at), |hb, (i, state)| {
                    hb.with_resource(ResourceStatus::new(format!("gpu-{}", i), *state))
                })
            };
            let states = |health: ProviderHealthStatus| {
                health.resource_statuses.iter().map(|r| (r.resource_id.clone(), r.state)).collect::<Vec<_>>()
            };

            let clock = ManualClock::new(Utc::now());
            let both = health_service(&clock).await;
            let only_second = health_service(&clock).await;
            both.submit_heartbeat(reports(&first[..], clock.now())).await.unwrap();
            clock.advance_secs(60);
            both.submit_heartbeat(reports(&second[..], clock.now())).await.unwrap();
            only_second.submit_heartbeat(reports(&second[..], clock.now())).await.unwrap();

            let replayed = states(both.provider_health("p1").await.unwrap());
            let direct = states(only_second.provider_health("p1").await.unwrap());
            both.shutdown().await;
            only_second.shutdown().await;
            (replayed, direct)
        });
        prop_assert_eq!(replayed, direct);
    }

    #[test]
    fn prop_score_never_rises_while_silent(steps in proptest::collection::vec(1i64..200, 1..8)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let scores = runtime.block_on(async {
            let clock = ManualClock::new(Utc::now());
            let service = health_service(&clock).await;
            service
                .submit_heartbeat(
                    Heartbeat::new("p1", clock.now())
                        .with_resource(ResourceStatus::new("gpu-0", ResourceState::Available)),
                )
                .await
                .unwrap();

            let mut scores = vec![service.provider_health("p1").await.unwrap().health_score];
            for step in &steps {
                clock.advance_secs(*step);
                service.sweep_now().await;
                scores.push(service.provider_health("p1").await.unwrap().health_score);
            }
            service.shutdown().await;
            scores
        });
        for pair in scores.windows(2) {
            prop_assert!(pair[1] <= pair[0], "score rose from {} to {}", pair[0], pair[1]);
        }
    }
}
