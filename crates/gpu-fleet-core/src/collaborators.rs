//! External collaborators: provider identity registry and persistence
//!
//! The heartbeat path only ever calls [`IdentityRegistry::get_by_id`] and
//! [`IdentityRegistry::update_last_seen`]; registration lives elsewhere.
//! Persistence is a primary store plus an optional cache, combined by
//! [`FleetStore`], which reads through the cache and falls back to the
//! primary whenever the cache misbehaves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::error::{FleetError, Result};

/// Provider identity as held by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ProviderRecord {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            email: email.into(),
            name: String::new(),
            created_at: now,
            updated_at: now,
            last_seen: None,
            metadata: HashMap::new(),
        }
    }
}

/// Provider registry
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityRegistry: Send + Sync {
    async fn get_by_id(&self, provider_id: &str) -> Result<Option<ProviderRecord>>;

    async fn get_by_email(&self, email: &str) -> Result<Option<ProviderRecord>>;

    async fn create(&self, record: ProviderRecord) -> Result<ProviderRecord>;

    async fn update(&self, record: ProviderRecord) -> Result<ProviderRecord>;

    async fn update_last_seen(&self, provider_id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// One write inside a [`Transaction`]
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set { key: String, value: Value },
    Delete { key: String },
}

/// Writes applied all-or-nothing by [`PersistenceStore::with_transaction`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    ops: Vec<WriteOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Serialize>(mut self, key: impl Into<String>, value: &T) -> Result<Self> {
        self.ops.push(WriteOp::Set {
            key: key.into(),
            value: serde_json::to_value(value)?,
        });
        Ok(self)
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Delete { key: key.into() });
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Key-value view of the durable store
#[async_trait]
pub trait PersistenceStore: Send + Sync + Debug {
    async fn with_transaction(&self, tx: Transaction) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn is_healthy(&self) -> bool;
}

/// Primary store with an optional read cache
#[derive(Debug, Clone)]
pub struct FleetStore {
    primary: Arc<dyn PersistenceStore>,
    cache: Option<Arc<dyn PersistenceStore>>,
}

impl FleetStore {
    /// Fails fast when the primary store is unreachable; a broken cache only degrades reads
    pub async fn connect(
        primary: Arc<dyn PersistenceStore>,
        cache: Option<Arc<dyn PersistenceStore>>,
    ) -> Result<Self> {
        if !primary.is_healthy().await {
            return Err(FleetError::StoreUnavailable(
                "primary store failed its health check".to_string(),
            ));
        }
        if let Some(cache) = &cache {
            if !cache.is_healthy().await {
                warn!("Cache unavailable at startup, reads go to the primary store");
            }
        }
        Ok(Self { primary, cache })
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(cache) = &self.cache {
            match cache.get(key).await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(e) => debug!(key = %key, error = %e, "Cache read failed"),
            }
        }

        let value = self.primary.get(key).await?;
        if let (Some(cache), Some(value)) = (&self.cache, &value) {
            if let Err(e) = cache.set(key, value.clone()).await {
                debug!(key = %key, error = %e, "Cache fill failed");
            }
        }
        Ok(value)
    }

    /// Commit to the primary, then mirror into the cache best-effort
    pub async fn commit(&self, tx: Transaction) -> Result<()> {
        self.primary.with_transaction(tx.clone()).await?;

        if let Some(cache) = &self.cache {
            for op in tx.ops() {
                let result = match op {
                    WriteOp::Set { key, value } => cache.set(key, value.clone()).await,
                    WriteOp::Delete { key } => cache.delete(key).await,
                };
                if let Err(e) = result {
                    debug!(error = %e, "Cache write failed");
                }
            }
        }
        Ok(())
    }

    pub async fn is_healthy(&self) -> bool {
        self.primary.is_healthy().await
    }
}

/// In-process store with failure injection
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: RwLock<HashMap<String, Value>>,
    unhealthy: AtomicBool,
    failing_writes: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle availability; an unhealthy store fails every call
    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    /// Fail the next `count` writes
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .data
            .read()
            .map(|d| d.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn check_available(&self) -> Result<()> {
        if self.unhealthy.load(Ordering::SeqCst) {
            Err(FleetError::StoreUnavailable("in-memory store marked unhealthy".to_string()))
        } else {
            Ok(())
        }
    }

    fn check_write(&self) -> Result<()> {
        self.check_available()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(FleetError::Persistence("injected write failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Value>>> {
        self.data
            .write()
            .map_err(|_| FleetError::Persistence("store lock poisoned".to_string()))
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn with_transaction(&self, tx: Transaction) -> Result<()> {
        self.check_write()?;
        let mut data = self.write_lock()?;
        for op in tx.ops {
            match op {
                WriteOp::Set { key, value } => {
                    data.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.check_available()?;
        let data = self
            .data
            .read()
            .map_err(|_| FleetError::Persistence("store lock poisoned".to_string()))?;
        Ok(data.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.check_write()?;
        self.write_lock()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_write()?;
        self.write_lock()?.remove(key);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::SeqCst)
    }
}

/// In-process provider registry
#[derive(Debug, Default)]
pub struct InMemoryIdentityRegistry {
    providers: DashMap<String, ProviderRecord>,
}

impl InMemoryIdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the given provider ids
    pub fn with_providers<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        for id in ids {
            let id = id.into();
            let email = format!("{}@providers.local", id);
            registry.providers.insert(id.clone(), ProviderRecord::new(id, email));
        }
        registry
    }

    pub fn last_seen(&self, provider_id: &str) -> Option<DateTime<Utc>> {
        self.providers.get(provider_id).and_then(|p| p.last_seen)
    }
}

#[async_trait]
impl IdentityRegistry for InMemoryIdentityRegistry {
    async fn get_by_id(&self, provider_id: &str) -> Result<Option<ProviderRecord>> {
        Ok(self.providers.get(provider_id).map(|p| p.clone()))
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<ProviderRecord>> {
        Ok(self
            .providers
            .iter()
            .find(|p| p.email.eq_ignore_ascii_case(email))
            .map(|p| p.clone()))
    }

    async fn create(&self, record: ProviderRecord) -> Result<ProviderRecord> {
        if record.id.trim().is_empty() {
            return Err(FleetError::invalid_input("provider id must not be empty"));
        }
        if self.get_by_email(&record.email).await?.is_some() {
            return Err(FleetError::invalid_input(format!(
                "email already registered: {}",
                record.email
            )));
        }
        match self.providers.entry(record.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(FleetError::invalid_input(format!(
                "provider already exists: {}",
                record.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn update(&self, mut record: ProviderRecord) -> Result<ProviderRecord> {
        let mut existing = self
            .providers
            .get_mut(&record.id)
            .ok_or_else(|| FleetError::UnknownProvider(record.id.clone()))?;
        record.created_at = existing.created_at;
        record.updated_at = Utc::now();
        *existing = record.clone();
        Ok(record)
    }

    async fn update_last_seen(&self, provider_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut existing = self
            .providers
            .get_mut(provider_id)
            .ok_or_else(|| FleetError::UnknownProvider(provider_id.to_string()))?;
        if existing.last_seen.map_or(true, |seen| seen < at) {
            existing.last_seen = Some(at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unhealthy_primary_fails_fast() {
        let primary = Arc::new(InMemoryStore::new());
        primary.set_healthy(false);
        let result = FleetStore::connect(primary, None).await;
        assert!(matches!(result, Err(FleetError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_broken_cache_degrades_to_primary() {
        let primary = Arc::new(InMemoryStore::new());
        let cache = Arc::new(InMemoryStore::new());
        cache.set_healthy(false);

        let store = FleetStore::connect(primary.clone(), Some(cache)).await.unwrap();
        store
            .commit(Transaction::new().set("provider/p1", &json!({"status": "healthy"})).unwrap())
            .await
            .unwrap();

        assert_eq!(store.get("provider/p1").await.unwrap(), Some(json!({"status": "healthy"})));
        assert_eq!(primary.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_filled_on_read() {
        let primary = Arc::new(InMemoryStore::new());
        let cache = Arc::new(InMemoryStore::new());
        primary.set("k", json!(1)).await.unwrap();

        let store = FleetStore::connect(primary, Some(cache.clone())).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
        assert_eq!(cache.get("k").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_failed_transaction_applies_nothing() {
        let store = InMemoryStore::new();
        store.fail_next_writes(1);
        let tx = Transaction::new()
            .set("a", &1)
            .unwrap()
            .set("b", &2)
            .unwrap();
        assert!(store.with_transaction(tx.clone()).await.is_err());
        assert!(store.is_empty());
        assert!(store.with_transaction(tx).await.is_ok());
        assert_eq!(store.keys_with_prefix(""), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_identity_registry_round_trip() {
        let registry = InMemoryIdentityRegistry::with_providers(["p1"]);
        assert!(registry.get_by_id("p1").await.unwrap().is_some());
        assert!(registry.get_by_email("P1@providers.local").await.unwrap().is_some());
        assert!(registry.create(ProviderRecord::new("p1", "other@x")).await.is_err());

        let at = Utc::now();
        registry.update_last_seen("p1", at).await.unwrap();
        registry
            .update_last_seen("p1", at - chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(registry.last_seen("p1"), Some(at));
        assert!(matches!(
            registry.update_last_seen("ghost", at).await,
            Err(FleetError::UnknownProvider(_))
        ));
    }
}
