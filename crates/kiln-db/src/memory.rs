//! In-memory store for tests and single-node runs without a database.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use kiln_core::{
    PluginBuildRecord, PluginBuildStore, Result, VersionKey, VersionRecord, VersionStore,
    VersionUpdate, WorkloadName, WorkloadResolver,
};

/// Implements every persistence contract over process memory.
#[derive(Default)]
pub struct MemoryStore {
    versions: Mutex<HashMap<VersionKey, VersionRecord>>,
    plugins: Mutex<HashMap<(String, String), PluginBuildRecord>>,
    workloads: Mutex<HashMap<String, WorkloadName>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_workload(&self, service_id: impl Into<String>, name: WorkloadName) {
        self.workloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service_id.into(), name);
    }

    /// Every version record, for introspection.
    pub fn versions(&self) -> Vec<VersionRecord> {
        self.versions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl VersionStore for MemoryStore {
    async fn get(&self, key: &VersionKey) -> Result<Option<VersionRecord>> {
        Ok(self
            .versions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn upsert(&self, key: &VersionKey, update: &VersionUpdate) -> Result<VersionRecord> {
        let mut versions = self.versions.lock().unwrap_or_else(|e| e.into_inner());
        let record = versions
            .entry(key.clone())
            .or_insert_with(|| VersionRecord::new(key.clone()));
        record.apply(update);
        Ok(record.clone())
    }
}

#[async_trait]
impl PluginBuildStore for MemoryStore {
    async fn get(&self, plugin_id: &str, version_id: &str) -> Result<Option<PluginBuildRecord>> {
        Ok(self
            .plugins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(plugin_id.to_string(), version_id.to_string()))
            .cloned())
    }

    async fn put(&self, mut record: PluginBuildRecord) -> Result<()> {
        let mut plugins = self.plugins.lock().unwrap_or_else(|e| e.into_inner());
        let key = (record.plugin_id.clone(), record.version_id.clone());
        if record.image.is_none() {
            record.image = plugins.get(&key).and_then(|r| r.image.clone());
        }
        plugins.insert(key, record);
        Ok(())
    }
}

#[async_trait]
impl WorkloadResolver for MemoryStore {
    async fn workload_name(&self, service_id: &str) -> Result<Option<WorkloadName>> {
        Ok(self
            .workloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(service_id)
            .cloned())
    }
}
