//! Scoped acquisition of a fixture with guaranteed release.
//!
//! A [`FixtureScope`] owns every external resource a run creates. Release
//! actions are registered as soon as a resource might exist (a pool name
//! before `create_pool`, the Terraform config before `apply`) and each
//! registration is written to the [`FixtureStore`] immediately.
//!
//! [`FixtureScope::release`] consumes the scope, so a scope tears down at most
//! once. It destroys the fixture first, then deletes pools newest first, and
//! keeps going when an individual action fails.

use crate::client::{FixtureClient, PoolRef};
use crate::error::{HarnessError, Result};
use crate::fixture::{FixtureHandle, FixtureRecord, PoolEntry, Stage};
use crate::identity::RunIdentity;
use crate::obs;
use crate::provisioner::{ProvisionConfig, Provisioner};
use crate::store::FixtureStore;
use serde::Serialize;
use std::collections::BTreeMap;

/// One teardown action that failed.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TeardownFailure {
    pub resource: String,
    pub error: String,
}

/// What teardown did. Failures are collected here instead of propagated.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TeardownReport {
    pub destroyed: bool,
    pub deleted_pools: Vec<String>,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct FixtureScope {
    store: FixtureStore,
    record: FixtureRecord,
    released: bool,
}

impl FixtureScope {
    /// Open a scope for a fresh run and persist its empty record.
    pub fn open(store: FixtureStore, run: RunIdentity) -> Result<Self> {
        let mut scope = Self {
            store,
            record: FixtureRecord::new(run),
            released: false,
        };
        scope.persist()?;
        Ok(scope)
    }

    /// Re-enter a scope from a persisted record.
    pub fn resume(store: FixtureStore, record: FixtureRecord) -> Self {
        Self {
            store,
            record,
            released: false,
        }
    }

    pub fn run(&self) -> &RunIdentity {
        &self.record.run
    }

    pub fn record(&self) -> &FixtureRecord {
        &self.record
    }

    pub fn handle(&self) -> Option<&FixtureHandle> {
        self.record.handle.as_ref()
    }

    pub fn stage(&self) -> Stage {
        self.record.stage
    }

    pub fn set_stage(&mut self, stage: Stage) -> Result<()> {
        self.record.stage = stage;
        self.persist()
    }

    /// Register deletion of `name`; call before attempting creation.
    pub fn register_pool(&mut self, name: &str) -> Result<()> {
        if !self.record.pools.iter().any(|p| p.name == name) {
            self.record.pools.push(PoolEntry {
                name: name.to_string(),
                id: None,
            });
        }
        self.persist()
    }

    pub fn pool_created(&mut self, pool: &PoolRef) -> Result<()> {
        self.record.mark_created(pool);
        self.persist()
    }

    /// Register destruction of `config`; call before attempting apply.
    pub fn register_fixture(&mut self, config: ProvisionConfig) -> Result<()> {
        if self.record.handle.is_some() {
            return Err(HarnessError::State(format!(
                "{} run {} already holds a fixture",
                self.record.run.scenario(),
                self.record.run.suffix()
            )));
        }
        self.record.handle = Some(FixtureHandle::new(config));
        self.persist()
    }

    pub fn record_outputs(&mut self, outputs: BTreeMap<String, String>) -> Result<()> {
        let handle = self.handle_mut()?;
        handle.outputs.extend(outputs);
        self.persist()
    }

    /// Replace the fixture config after an in-place update.
    pub fn replace_config(&mut self, config: ProvisionConfig) -> Result<()> {
        self.handle_mut()?.replace_config(config);
        self.persist()
    }

    /// Drop the fixture from the scope after it was destroyed explicitly.
    pub fn forget_fixture(&mut self) -> Result<Option<FixtureHandle>> {
        let handle = self.record.handle.take();
        self.persist()?;
        Ok(handle)
    }

    /// Leave every resource in place for a later stage invocation.
    pub fn detach(mut self) -> Result<FixtureRecord> {
        self.released = true;
        self.persist()?;
        obs::emit_scope_detached(&self.record);
        Ok(self.record.clone())
    }

    /// Tear everything down. Never fails; see [`TeardownReport`].
    pub async fn release(
        mut self,
        client: &dyn FixtureClient,
        provisioner: &dyn Provisioner,
    ) -> TeardownReport {
        self.released = true;
        let scenario = self.record.run.scenario().to_string();
        let mut report = TeardownReport::default();

        self.record.stage = Stage::Teardown;
        if let Err(e) = self.persist() {
            obs::emit_teardown_error(&scenario, "fixture record", &e);
        }

        if let Some(handle) = &self.record.handle {
            match provisioner.destroy(&handle.config).await {
                Ok(()) => report.destroyed = true,
                Err(e) => {
                    let resource = format!("fixture {}", handle.config.dir.display());
                    obs::emit_teardown_error(&scenario, &resource, &e);
                    report.failures.push(TeardownFailure {
                        resource,
                        error: e.to_string(),
                    });
                }
            }
        }

        for pool in self.record.pools.iter().rev() {
            match client.delete_pool(&pool.name).await {
                Ok(()) => report.deleted_pools.push(pool.name.clone()),
                Err(e) => {
                    let resource = format!("agent pool {}", pool.name);
                    obs::emit_teardown_error(&scenario, &resource, &e);
                    report.failures.push(TeardownFailure {
                        resource,
                        error: e.to_string(),
                    });
                }
            }
        }

        let suffix = self.record.run.suffix();
        if let Err(e) = self.store.remove(&scenario, suffix) {
            obs::emit_teardown_error(&scenario, "fixture record", &e);
        }
        // A failed destroy keeps the working copy: it holds the only state.
        if self.record.handle.is_none() || report.destroyed {
            if let Err(e) = self.store.remove_work_dir(&scenario, suffix) {
                obs::emit_teardown_error(&scenario, "fixture working copy", &e);
            }
        }
        obs::emit_teardown_finished(&self.record, &report);
        report
    }

    fn handle_mut(&mut self) -> Result<&mut FixtureHandle> {
        let run = &self.record.run;
        let (scenario, suffix) = (run.scenario().to_string(), run.suffix());
        self.record.handle.as_mut().ok_or_else(|| {
            HarnessError::State(format!("{scenario} run {suffix} has no fixture"))
        })
    }

    fn persist(&mut self) -> Result<()> {
        self.store.save(&mut self.record)
    }
}

impl Drop for FixtureScope {
    fn drop(&mut self) {
        if !self.released && self.record.owns_resources() {
            obs::emit_scope_leaked(
                &self.record,
                &self
                    .store
                    .record_path(self.record.run.scenario(), self.record.run.suffix()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemoryFixtureClient, ScriptedProvisioner};
    use crate::identity::RunSuffix;

    fn open_scope(dir: &tempfile::TempDir) -> FixtureScope {
        let store = FixtureStore::new(dir.path()).unwrap();
        let run = RunIdentity::with_suffix(
            "linux-agents",
            RunSuffix(5),
            [("azure_devops_pool_name", "e2e-agents")],
        );
        FixtureScope::open(store, run).unwrap()
    }

    #[tokio::test]
    async fn test_release_destroys_then_deletes_pools_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let client = MemoryFixtureClient::new();
        let provisioner = ScriptedProvisioner::new();

        let mut scope = open_scope(&dir);
        for name in ["a-5", "b-5"] {
            scope.register_pool(name).unwrap();
            client.create_pool(name).await.unwrap();
        }
        scope
            .register_fixture(ProvisionConfig::new("fixture/linux-agents"))
            .unwrap();

        let report = scope.release(&client, &provisioner).await;

        assert!(report.is_clean());
        assert!(report.destroyed);
        assert_eq!(report.deleted_pools, vec!["b-5", "a-5"]);
        assert_eq!(provisioner.destroy_count(), 1);
        assert!(!dir.path().join("linux-agents/5").exists());
        assert!(FixtureStore::new(dir.path()).unwrap().list("linux-agents").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_continues_after_failures() {
        let dir = tempfile::tempdir().unwrap();
        let client = MemoryFixtureClient::new();
        let provisioner = ScriptedProvisioner::new().failing_destroy();

        let mut scope = open_scope(&dir);
        let work_dir = FixtureStore::new(dir.path())
            .unwrap()
            .work_dir("linux-agents", RunSuffix(5));
        std::fs::create_dir_all(&work_dir).unwrap();
        // Registered but never created: delete reports NotFound.
        scope.register_pool("never-created-5").unwrap();
        scope.register_pool("created-5").unwrap();
        client.create_pool("created-5").await.unwrap();
        scope
            .register_fixture(ProvisionConfig::new("fixture/linux-agents"))
            .unwrap();

        let report = scope.release(&client, &provisioner).await;

        assert!(!report.destroyed);
        assert_eq!(report.deleted_pools, vec!["created-5"]);
        assert_eq!(report.failures.len(), 2);
        assert!(!client.pool_exists("created-5"));
        assert!(work_dir.is_dir());
    }

    #[tokio::test]
    async fn test_detach_keeps_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut scope = open_scope(&dir);
        scope.register_pool("e2e-agents-5").unwrap();

        let record = scope.detach().unwrap();
        let store = FixtureStore::new(dir.path()).unwrap();
        assert_eq!(store.load("linux-agents", RunSuffix(5)).unwrap(), record);
    }

    #[test]
    fn test_second_fixture_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut scope = open_scope(&dir);
        scope
            .register_fixture(ProvisionConfig::new("fixture/linux-agents"))
            .unwrap();
        let err = scope
            .register_fixture(ProvisionConfig::new("fixture/linux-agents"))
            .unwrap_err();
        assert!(matches!(err, HarnessError::State(_)));
        scope.detach().unwrap();
    }
}
