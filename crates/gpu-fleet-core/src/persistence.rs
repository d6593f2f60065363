//! Durable writes for health state, incidents and alerts
//!
//! Producers hand records to a bounded pending set without waiting; a
//! single background writer commits them to the [`FleetStore`] with
//! exponential backoff. A newer record for a key already pending replaces
//! the older one. When the set is full and the key is new, the record is
//! dropped, counted in `fleet_persistence_dropped_total`, and a critical
//! alert about the aggregator is raised. A record is retried until it is
//! written or the writer is cancelled; once it has failed
//! `alert_after_attempts` times the same alert is raised. The alert is
//! cleared after the next successful write.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::collaborators::{FleetStore, Transaction};
use crate::config::PersistenceConfig;
use crate::contracts::{HealthIncident, ProviderHealthStatus, SystemAlert};
use crate::error::Result;
use crate::incidents::AlertManager;
use crate::telemetry::FleetMetrics;

/// Something the aggregator wants stored
#[derive(Debug, Clone)]
pub enum PersistRecord {
    ProviderHealth(Box<ProviderHealthStatus>),
    Incident(Box<HealthIncident>),
    Alert(Box<SystemAlert>),
}

impl PersistRecord {
    pub fn key(&self) -> String {
        match self {
            PersistRecord::ProviderHealth(status) => format!("provider_health/{}", status.provider_id),
            PersistRecord::Incident(incident) => format!("incident/{}", incident.id),
            PersistRecord::Alert(alert) => format!("alert/{}", alert.id),
        }
    }

    fn transaction(&self) -> Result<Transaction> {
        fn single<T: Serialize>(key: String, value: &T) -> Result<Transaction> {
            Transaction::new().set(key, value)
        }
        match self {
            PersistRecord::ProviderHealth(status) => single(self.key(), status.as_ref()),
            PersistRecord::Incident(incident) => single(self.key(), incident.as_ref()),
            PersistRecord::Alert(alert) => single(self.key(), alert.as_ref()),
        }
    }
}

impl From<ProviderHealthStatus> for PersistRecord {
    fn from(status: ProviderHealthStatus) -> Self {
        PersistRecord::ProviderHealth(Box::new(status))
    }
}

impl From<HealthIncident> for PersistRecord {
    fn from(incident: HealthIncident) -> Self {
        PersistRecord::Incident(Box::new(incident))
    }
}

impl From<SystemAlert> for PersistRecord {
    fn from(alert: SystemAlert) -> Self {
        PersistRecord::Alert(Box::new(alert))
    }
}

#[derive(Debug, Default)]
struct Pending {
    order: VecDeque<String>,
    records: HashMap<String, PersistRecord>,
}

enum Enqueued {
    Added,
    Replaced,
    Full,
}

impl Pending {
    fn push(&mut self, key: String, record: PersistRecord, capacity: usize) -> Enqueued {
        if let Some(slot) = self.records.get_mut(&key) {
            *slot = record;
            return Enqueued::Replaced;
        }
        if self.records.len() >= capacity {
            return Enqueued::Full;
        }
        self.order.push_back(key.clone());
        self.records.insert(key, record);
        Enqueued::Added
    }

    fn pop(&mut self) -> Option<PersistRecord> {
        let key = self.order.pop_front()?;
        self.records.remove(&key)
    }
}

#[derive(Debug)]
struct Shared {
    pending: Mutex<Pending>,
    capacity: usize,
    alert_raised: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Producer side of the persistence queue
#[derive(Clone)]
pub struct PersistenceHandle {
    shared: Arc<Shared>,
    wake: mpsc::Sender<()>,
    alerts: Arc<AlertManager>,
    clock: SharedClock,
    metrics: Arc<FleetMetrics>,
}

impl std::fmt::Debug for PersistenceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceHandle")
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

impl PersistenceHandle {
    /// Queue a record without waiting
    pub fn submit(&self, record: impl Into<PersistRecord>) {
        let record = record.into();
        let key = record.key();
        let outcome = self.shared.lock().push(key.clone(), record, self.shared.capacity);

        match outcome {
            Enqueued::Added | Enqueued::Replaced => {
                if let Err(mpsc::error::TrySendError::Closed(_)) = self.wake.try_send(()) {
                    warn!(key = %key, "Persistence writer stopped, record not written");
                }
            }
            Enqueued::Full => {
                self.metrics.record_persistence_dropped();
                warn!(key = %key, capacity = self.shared.capacity, "Persistence queue full, record dropped");
                if !self.shared.alert_raised.swap(true, Ordering::AcqRel) {
                    self.alerts.raise_internal(
                        &format!("Persistence queue full ({} records), dropping writes", self.shared.capacity),
                        self.clock.now(),
                    );
                }
            }
        }
    }

    /// Records waiting for the writer
    pub fn pending(&self) -> usize {
        self.shared.lock().records.len()
    }
}

/// Consumer side, run by the service as a background task
pub struct PersistenceWriter {
    store: FleetStore,
    config: PersistenceConfig,
    alerts: Arc<AlertManager>,
    clock: SharedClock,
    metrics: Arc<FleetMetrics>,
    shared: Arc<Shared>,
    wake: mpsc::Receiver<()>,
}

/// Create a connected handle and writer
pub fn persistence_channel(
    store: FleetStore,
    config: PersistenceConfig,
    alerts: Arc<AlertManager>,
    clock: SharedClock,
    metrics: Arc<FleetMetrics>,
) -> (PersistenceHandle, PersistenceWriter) {
    let (sender, receiver) = mpsc::channel(1);
    let shared = Arc::new(Shared {
        pending: Mutex::new(Pending::default()),
        capacity: config.queue_size.max(1),
        alert_raised: AtomicBool::new(false),
    });
    (
        PersistenceHandle {
            shared: shared.clone(),
            wake: sender,
            alerts: alerts.clone(),
            clock: clock.clone(),
            metrics: metrics.clone(),
        },
        PersistenceWriter {
            store,
            config,
            alerts,
            clock,
            metrics,
            shared,
            wake: receiver,
        },
    )
}

impl PersistenceWriter {
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Persistence writer started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                signal = self.wake.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
            }
            while !cancel.is_cancelled() {
                let Some(record) = self.next() else { break };
                self.write(record, &cancel).await;
            }
        }

        self.wake.close();
        let mut flushed = 0usize;
        while let Some(record) = self.next() {
            if self.attempt(&record).await.is_ok() {
                flushed += 1;
            } else {
                error!(key = %record.key(), "Record not persisted before shutdown");
            }
        }
        info!(flushed, "Persistence writer stopped");
    }

    fn next(&self) -> Option<PersistRecord> {
        self.shared.lock().pop()
    }

    async fn attempt(&self, record: &PersistRecord) -> Result<()> {
        let tx = record.transaction()?;
        self.store.commit(tx).await
    }

    async fn write(&mut self, record: PersistRecord, cancel: &CancellationToken) {
        let key = record.key();
        let tx = match record.transaction() {
            Ok(tx) => tx,
            Err(e) => {
                error!(key = %key, error = %e, "Record cannot be serialized");
                return;
            }
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.commit(tx.clone()).await {
                Ok(()) => {
                    debug!(key = %key, attempt, "Record persisted");
                    if self.shared.alert_raised.swap(false, Ordering::AcqRel) {
                        self.alerts.clear_internal(self.clock.now());
                        info!("Persistence recovered");
                    }
                    return;
                }
                Err(e) => {
                    self.metrics.record_persistence_retry();
                    warn!(key = %key, attempt, error = %e, "Persistence write failed");

                    if attempt == self.config.alert_after_attempts
                        && !self.shared.alert_raised.swap(true, Ordering::AcqRel)
                    {
                        self.alerts.raise_internal(
                            &format!("Health state persistence failing after {} attempts: {}", attempt, e),
                            self.clock.now(),
                        );
                    }
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    error!(key = %key, attempts = attempt, "Writer cancelled with record unpersisted");
                    return;
                }
                _ = tokio::time::sleep(self.config.backoff(attempt)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::collaborators::{InMemoryStore, PersistenceStore};
    use crate::config::AlertConfig;
    use crate::contracts::AlertStatus;
    use crate::incidents::AlertFilter;
    use crate::telemetry::FleetMetricsRegistry;
    use chrono::Utc;
    use std::time::Duration;

    async fn setup(
        primary: Arc<InMemoryStore>,
    ) -> (PersistenceHandle, PersistenceWriter, Arc<AlertManager>, Arc<FleetMetrics>) {
        let metrics = FleetMetricsRegistry::new().unwrap().fleet();
        let alerts = Arc::new(AlertManager::new(AlertConfig::default(), metrics.clone()));
        let store = FleetStore::connect(primary, None).await.unwrap();
        let config = PersistenceConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            alert_after_attempts: 3,
            queue_size: 8,
        };
        let (handle, writer) =
            persistence_channel(store, config, alerts.clone(), Arc::new(SystemClock), metrics.clone());
        (handle, writer, alerts, metrics)
    }

    #[tokio::test]
    async fn test_record_written_under_its_key() {
        let primary = Arc::new(InMemoryStore::new());
        let (handle, writer, _, _) = setup(primary.clone()).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(writer.run(cancel.clone()));

        handle.submit(ProviderHealthStatus::new("p1", Utc::now()));
        drop(handle);
        task.await.unwrap();

        let stored = primary.get("provider_health/p1").await.unwrap().unwrap();
        assert_eq!(stored["provider_id"], "p1");
    }

    #[tokio::test]
    async fn test_failures_retried_then_alerted_then_cleared() {
        let primary = Arc::new(InMemoryStore::new());
        primary.fail_next_writes(4);
        let (handle, writer, alerts, metrics) = setup(primary.clone()).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(writer.run(cancel.clone()));

        handle.submit(ProviderHealthStatus::new("p1", Utc::now()));
        drop(handle);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(metrics.persistence_retries(), 4);
        assert!(primary.get("provider_health/p1").await.unwrap().is_some());

        let raised = alerts.list(&AlertFilter::default());
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].status, AlertStatus::Resolved);
    }

    #[tokio::test]
    async fn test_pending_record_replaced_by_newer_one() {
        let primary = Arc::new(InMemoryStore::new());
        let (handle, writer, _, metrics) = setup(primary.clone()).await;

        let mut status = ProviderHealthStatus::new("p1", Utc::now());
        handle.submit(status.clone());
        status.summary.total_heartbeats = 7;
        handle.submit(status);
        assert_eq!(handle.pending(), 1);

        drop(handle);
        writer.run(CancellationToken::new()).await;

        let stored = primary.get("provider_health/p1").await.unwrap().unwrap();
        assert_eq!(stored["total_heartbeats"], 7);
        assert_eq!(metrics.persistence_dropped(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_waiting() {
        let primary = Arc::new(InMemoryStore::new());
        primary.fail_next_writes(u32::MAX);
        let (handle, writer, alerts, metrics) = setup(primary.clone()).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(writer.run(cancel.clone()));

        for i in 0..32 {
            handle.submit(ProviderHealthStatus::new(format!("p{}", i), Utc::now()));
        }

        assert!(metrics.persistence_dropped() > 0);
        assert!(handle.pending() <= 8);
        let raised = alerts.list(&AlertFilter::default());
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].status, AlertStatus::Active);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
