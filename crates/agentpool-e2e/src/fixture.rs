//! Fixture handle and the persisted record of a scenario run.

use crate::client::PoolRef;
use crate::error::{HarnessError, Result};
use crate::identity::RunIdentity;
use crate::provisioner::ProvisionConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle position of a scenario run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Setup,
    Validate,
    Teardown,
    Done,
    Failed,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Setup => "setup",
            Stage::Validate => "validate",
            Stage::Teardown => "teardown",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An applied (or being-applied) provisioning configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureHandle {
    pub config: ProvisionConfig,
    /// Digest of `config` when it was last applied.
    pub config_digest: String,
    /// Outputs read back after apply, already unquoted.
    pub outputs: BTreeMap<String, String>,
    pub applied_at: DateTime<Utc>,
}

impl FixtureHandle {
    pub fn new(config: ProvisionConfig) -> Self {
        Self {
            config_digest: config.digest(),
            config,
            outputs: BTreeMap::new(),
            applied_at: Utc::now(),
        }
    }

    pub fn output(&self, key: &str) -> Option<&str> {
        self.outputs.get(key).map(String::as_str)
    }

    /// Swap in a re-applied configuration.
    pub fn replace_config(&mut self, config: ProvisionConfig) {
        self.config_digest = config.digest();
        self.config = config;
        self.applied_at = Utc::now();
    }

    /// Reject a record whose configuration was edited after it was written.
    pub fn verify(&self) -> Result<()> {
        let actual = self.config.digest();
        if actual != self.config_digest {
            return Err(HarnessError::State(format!(
                "fixture config digest mismatch for {}: recorded {}, computed {}",
                self.config.dir.display(),
                &self.config_digest[..12.min(self.config_digest.len())],
                &actual[..12]
            )));
        }
        Ok(())
    }
}

/// A pool the run owns; deletion is registered before creation is attempted,
/// so `id` is only known once creation succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub name: String,
    pub id: Option<u64>,
}

/// Everything TEARDOWN needs, persisted between stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureRecord {
    pub run: RunIdentity,
    pub stage: Stage,
    pub pools: Vec<PoolEntry>,
    pub handle: Option<FixtureHandle>,
    pub updated_at: DateTime<Utc>,
}

impl FixtureRecord {
    pub fn new(run: RunIdentity) -> Self {
        Self {
            run,
            stage: Stage::Init,
            pools: Vec::new(),
            handle: None,
            updated_at: Utc::now(),
        }
    }

    pub(crate) fn mark_created(&mut self, pool: &PoolRef) {
        if let Some(entry) = self.pools.iter_mut().find(|p| p.name == pool.name) {
            entry.id = Some(pool.id);
        }
    }

    /// Whether anything external is still owned by this run.
    pub fn owns_resources(&self) -> bool {
        !self.pools.is_empty() || self.handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RunSuffix;

    #[test]
    fn test_handle_verify_detects_edits() {
        let mut handle = FixtureHandle::new(
            ProvisionConfig::new("fixture/linux-agents").with_var("agents_count", 2),
        );
        assert!(handle.verify().is_ok());

        handle.config.vars.insert("agents_count".to_string(), serde_json::json!(5));
        assert!(matches!(handle.verify(), Err(HarnessError::State(_))));

        let config = handle.config.clone();
        handle.replace_config(config);
        assert!(handle.verify().is_ok());
    }

    #[test]
    fn test_mark_created_sets_id() {
        let run = RunIdentity::with_suffix("linux-agents", RunSuffix(1), [("pool", "e2e")]);
        let mut record = FixtureRecord::new(run);
        record.pools.push(PoolEntry {
            name: "e2e-1".to_string(),
            id: None,
        });

        record.mark_created(&PoolRef {
            id: 12,
            name: "e2e-1".to_string(),
        });
        assert_eq!(record.pools[0].id, Some(12));
        assert!(record.owns_resources());
    }

    #[test]
    fn test_stage_serializes_snake_case() {
        assert_eq!(serde_json::to_value(Stage::Validate).unwrap(), "validate");
        assert_eq!(Stage::Teardown.to_string(), "teardown");
    }
}
