//! Persisted workload state.
//!
//! Records are flat JSON objects of primitive values stored under a logical
//! key (for example `SpecCpuState`). They survive across runs on the same
//! agent and are what idempotent one-time setup consults. A peer's records
//! can be read over the agent API through [`RemoteStateReader`].
//!
//! Two agents checking and saving the same key concurrently may both run the
//! guarded setup. That race is accepted; guarded steps must be safe to repeat.

mod backend;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::api::ApiError;
use crate::error::{Error, Result};
use crate::layout::ClientInstance;

pub use backend::{FileStateBackend, MemoryStateBackend};

/// Local persistence for state records.
pub trait StateBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Overwrites the record atomically before returning.
    fn save(&self, key: &str, value: &Value) -> Result<()>;
}

/// Reads state another agent has published.
#[async_trait]
pub trait RemoteStateReader: Send + Sync {
    async fn read_state(
        &self,
        peer: &ClientInstance,
        key: &str,
    ) -> std::result::Result<Option<Value>, ApiError>;
}

#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    remote: Option<Arc<dyn RemoteStateReader>>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            remote: None,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStateBackend::new()))
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStateReader>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// The last saved record for `key`, or `T::default()` if there is none.
    pub fn get_or_create<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        match self.backend.get(key)? {
            Some(value) => decode(key, value),
            None => Ok(T::default()),
        }
    }

    /// Persists `record` under `key`, replacing any previous record.
    pub fn save<T: Serialize>(&self, key: &str, record: &T) -> Result<()> {
        let value = serde_json::to_value(record)?;
        ensure_flat_record(key, &value)?;
        self.backend.save(key, &value)?;
        debug!(key, "Saved state record");
        Ok(())
    }

    /// Fetches `key` from `peer` and decodes it into the local record shape.
    pub async fn fetch_remote<T: DeserializeOwned>(&self, peer: &ClientInstance, key: &str) -> Result<T> {
        let remote = self.remote.as_ref().ok_or_else(|| {
            Error::Config("no remote state reader configured for this run".to_string())
        })?;
        let value = remote.read_state(peer, key).await?.ok_or_else(|| Error::State {
            key: key.to_string(),
            reason: format!("peer {} has no published state", peer.endpoint()),
        })?;
        decode(key, value)
    }

    /// Runs `setup` unless `flag` is already true in the record under `key`,
    /// then saves the flag. Returns whether `setup` ran.
    ///
    /// The flag is only saved if `setup` succeeds. Other fields of the record
    /// are preserved.
    pub async fn run_once<F, Fut>(&self, key: &str, flag: &str, setup: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut record: Map<String, Value> = self.get_or_create(key)?;
        if record.get(flag).and_then(Value::as_bool) == Some(true) {
            debug!(key, flag, "One-time setup already done, skipping");
            return Ok(false);
        }

        setup().await?;

        record.insert(flag.to_string(), Value::Bool(true));
        self.save(key, &record)?;
        info!(key, flag, "One-time setup completed");
        Ok(true)
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::State {
        key: key.to_string(),
        reason: format!("record does not match expected shape: {e}"),
    })
}

/// Records are objects of bool, string, number or null values.
fn ensure_flat_record(key: &str, value: &Value) -> Result<()> {
    let Some(object) = value.as_object() else {
        return Err(Error::State {
            key: key.to_string(),
            reason: "state records must be JSON objects".to_string(),
        });
    };
    if let Some((field, _)) = object
        .iter()
        .find(|(_, v)| v.is_object() || v.is_array())
    {
        return Err(Error::State {
            key: key.to_string(),
            reason: format!("field '{field}' is not a primitive value"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Role;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct DemoState {
        #[serde(rename = "DemoInitialized", default)]
        initialized: bool,
        #[serde(rename = "DiskPaths", default)]
        disk_paths: String,
        #[serde(rename = "Tables", default)]
        tables: i64,
    }

    #[test]
    fn get_or_create_returns_default_when_absent() {
        let store = StateStore::in_memory();
        let state: DemoState = store.get_or_create("DemoState").unwrap();
        assert_eq!(state, DemoState::default());
    }

    #[test]
    fn save_then_read_back() {
        let store = StateStore::in_memory();
        let state = DemoState {
            initialized: true,
            disk_paths: "/mnt/d1".into(),
            tables: 10,
        };
        store.save("DemoState", &state).unwrap();
        let read: DemoState = store.get_or_create("DemoState").unwrap();
        assert_eq!(read, state);
    }

    #[test]
    fn save_rejects_nested_records() {
        let store = StateStore::in_memory();
        let err = store.save("Nested", &json!({"a": {"b": 1}})).unwrap_err();
        assert!(matches!(err, Error::State { .. }));
        assert!(store.save("List", &json!([1, 2])).is_err());
    }

    #[test]
    fn mismatched_record_is_state_error() {
        let store = StateStore::in_memory();
        store.save("DemoState", &json!({"DemoInitialized": "yes"})).unwrap();
        let err = store.get_or_create::<DemoState>("DemoState").unwrap_err();
        assert!(matches!(err, Error::State { ref key, .. } if key == "DemoState"));
    }

    #[tokio::test]
    async fn run_once_skips_when_flag_set() {
        let store = StateStore::in_memory();
        let side_effects = AtomicUsize::new(0);

        let ran = store
            .run_once("DemoState", "DemoInitialized", || async {
                side_effects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert!(ran);

        let ran_again = store
            .run_once("DemoState", "DemoInitialized", || async {
                side_effects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert!(!ran_again);
        assert_eq!(side_effects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_once_preserves_other_fields_and_skips_save_on_failure() {
        let store = StateStore::in_memory();
        store.save("DemoState", &json!({"Tables": 4})).unwrap();

        let err = store
            .run_once("DemoState", "DemoInitialized", || async {
                Err(Error::Config("install failed".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let state: DemoState = store.get_or_create("DemoState").unwrap();
        assert!(!state.initialized);

        store
            .run_once("DemoState", "DemoInitialized", || async { Ok(()) })
            .await
            .unwrap();
        let state: DemoState = store.get_or_create("DemoState").unwrap();
        assert!(state.initialized);
        assert_eq!(state.tables, 4);
    }

    #[test]
    fn state_persists_across_store_instances() {
        let dir = tempfile::tempdir().unwrap();
        let first = StateStore::new(Arc::new(FileStateBackend::new(dir.path()).unwrap()));
        first
            .save("DemoState", &DemoState { initialized: true, ..Default::default() })
            .unwrap();

        let second = StateStore::new(Arc::new(FileStateBackend::new(dir.path()).unwrap()));
        let state: DemoState = second.get_or_create("DemoState").unwrap();
        assert!(state.initialized);
    }

    struct FixedRemote(Option<Value>);

    #[async_trait]
    impl RemoteStateReader for FixedRemote {
        async fn read_state(
            &self,
            _peer: &ClientInstance,
            _key: &str,
        ) -> std::result::Result<Option<Value>, ApiError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn fetch_remote_decodes_peer_record() {
        let store = StateStore::in_memory().with_remote(Arc::new(FixedRemote(Some(
            json!({"DiskPaths": "/mnt/a /mnt/b", "Tables": 2}),
        ))));
        let peer = ClientInstance::new("server", Role::Server, "10.0.0.2", 4500);

        let state: DemoState = store.fetch_remote(&peer, "DemoState").await.unwrap();
        assert_eq!(state.disk_paths, "/mnt/a /mnt/b");
        assert_eq!(state.tables, 2);
    }

    #[tokio::test]
    async fn fetch_remote_missing_record_is_error() {
        let store = StateStore::in_memory().with_remote(Arc::new(FixedRemote(None)));
        let peer = ClientInstance::new("server", Role::Server, "10.0.0.2", 4500);
        let err = store.fetch_remote::<DemoState>(&peer, "DemoState").await.unwrap_err();
        assert!(matches!(err, Error::State { .. }));
    }

    #[tokio::test]
    async fn fetch_remote_without_reader_is_config_error() {
        let store = StateStore::in_memory();
        let peer = ClientInstance::new("server", Role::Server, "10.0.0.2", 4500);
        let err = store.fetch_remote::<DemoState>(&peer, "DemoState").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
