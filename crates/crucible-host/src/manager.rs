//! Script manager: id generation, compile-and-store, prefix operations, and
//! pooled execution of stored bytecode.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::HostError;
use crate::metrics::{inc, Metrics};
use crucible_lang::{codec, HostValue, VmPool};
use crucible_store::KvStore;

pub struct ScriptManager {
    store: KvStore,
    pool: Arc<VmPool>,
    metrics: Arc<Metrics>,
}

impl ScriptManager {
    pub fn new(store: KvStore, pool: Arc<VmPool>, metrics: Arc<Metrics>) -> ScriptManager {
        ScriptManager {
            store,
            pool,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn script_count(&self) -> usize {
        self.store.len()
    }

    /// Fresh 32-character lowercase hex id from a time-ordered UUID.
    pub fn new_key(&self) -> String {
        let id = Uuid::now_v7().simple().to_string();
        inc(&self.metrics.new_keys_total);
        id
    }

    /// Compiles the source and persists the blob under `key`.
    pub fn set(&self, key: &str, source: &str) -> Result<(), HostError> {
        inc(&self.metrics.compiled_scripts_total);
        let blob = codec::compile(source).inspect_err(|_| {
            inc(&self.metrics.compilation_failures_total);
        })?;
        self.store
            .set(key, &blob)
            .map_err(|e| HostError::from_store(key, e))
    }

    /// Resolves a full id or unique prefix to the stored full id.
    pub fn exists(&self, prefix: &str) -> Option<String> {
        self.store.has_prefix(prefix)
    }

    pub fn ids_by_prefix(&self, prefix: &str, limit: usize) -> Vec<String> {
        self.store.keys_with_prefix(prefix, Some(limit))
    }

    pub fn remove(&self, key: &str) -> Result<(), HostError> {
        self.store
            .delete(key)
            .map_err(|e| HostError::from_store(key, e))
    }

    /// Loads, decodes and runs a stored script; returns the values the script
    /// recorded through `this.returns`.
    pub async fn execute(
        &self,
        key: &str,
        args: Vec<HostValue>,
    ) -> Result<Vec<HostValue>, HostError> {
        let blob = self
            .store
            .get(key)
            .map_err(|e| HostError::from_store(key, e))?;
        let proto = codec::load(&blob)?;
        inc(&self.metrics.executed_scripts_total);
        let values = self.pool.run_proto(proto, args).await?;
        Ok(values)
    }

    /// Compiles and runs a one-shot script without persisting it.
    pub async fn run_once(
        &self,
        source: &str,
        args: Vec<HostValue>,
    ) -> Result<Vec<HostValue>, HostError> {
        let values = self.pool.run(source, args).await?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_lang::{PoolConfig, TypeRegistry};
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> ScriptManager {
        let store = KvStore::open(dir.path()).unwrap();
        let pool = VmPool::new(PoolConfig { limit: 4 }, TypeRegistry::with_defaults());
        ScriptManager::new(store, pool, Arc::new(Metrics::default()))
    }

    #[test]
    fn new_keys_are_32_lowercase_hex() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        for _ in 0..64 {
            let id = mgr.new_key();
            assert_eq!(id.len(), 32);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
        assert_eq!(mgr.metrics().snapshot().new_keys_total, 64);
    }

    #[tokio::test]
    async fn set_then_execute_round_trips() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let id = mgr.new_key();
        mgr.set(&id, "this.returns(this.argv(1) + this.argv(2))")
            .unwrap();
        let out = mgr
            .execute(&id, vec![HostValue::Int(2), HostValue::Int(3)])
            .await
            .unwrap();
        assert_eq!(out, vec![HostValue::Int(5)]);
        assert_eq!(mgr.metrics().snapshot().executed_scripts_total, 1);
    }

    #[tokio::test]
    async fn execute_by_unique_prefix() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let id = mgr.new_key();
        mgr.set(&id, "this.returns(7)").unwrap();
        let out = mgr.execute(&id[..6], vec![]).await.unwrap();
        assert_eq!(out, vec![HostValue::Int(7)]);
    }

    #[test]
    fn compile_failures_count_and_store_nothing() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let id = mgr.new_key();
        let err = mgr.set(&id, "local = broken").unwrap_err();
        assert_eq!(err.code(), "compile_error");
        let snap = mgr.metrics().snapshot();
        assert_eq!(snap.compiled_scripts_total, 1);
        assert_eq!(snap.compilation_failures_total, 1);
        assert_eq!(mgr.script_count(), 0);
    }

    #[tokio::test]
    async fn remove_then_execute_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let id = mgr.new_key();
        mgr.set(&id, "this.returns(1)").unwrap();
        mgr.remove(&id).unwrap();
        let err = mgr.execute(&id, vec![]).await.unwrap_err();
        assert_eq!(err.code(), "script_not_found");
    }

    #[tokio::test]
    async fn run_once_does_not_persist() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let out = mgr
            .run_once("this.returns(this.argc())", vec![HostValue::Bool(true)])
            .await
            .unwrap();
        assert_eq!(out, vec![HostValue::Int(1)]);
        assert_eq!(mgr.script_count(), 0);
    }

    #[tokio::test]
    async fn runtime_failures_surface_as_runtime_errors() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let id = mgr.new_key();
        mgr.set(&id, "error('nope')").unwrap();
        let err = mgr.execute(&id, vec![]).await.unwrap_err();
        assert_eq!(err.code(), "runtime_error");
    }

    #[test]
    fn exists_and_ids_by_prefix() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let id = mgr.new_key();
        mgr.set(&id, "this.returns(1)").unwrap();
        assert_eq!(mgr.exists(&id[..4]), Some(id.clone()));
        assert_eq!(mgr.ids_by_prefix("", 10), vec![id]);
    }
}
