//! Declarative scenario definitions.
//!
//! A scenario names a Terraform fixture, the agent pools to pre-create, and
//! the post-conditions VALIDATE must observe. The orchestrator does the rest.

use crate::client::IdentityAttachments;
use crate::identity::RunIdentity;
use crate::poller::SettlePolicy;
use crate::provisioner::ProvisionConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Input variable receiving the run suffix.
pub const RANDOM_SUFFIX_VAR: &str = "random_suffix";

/// Where a pool's base name comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolBase {
    /// The environment's default pool-name base
    Configured,
    Named(String),
}

/// A pool the harness creates before provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub base: PoolBase,
    /// Input variable that receives the generated pool name.
    pub variable: String,
}

impl PoolSpec {
    pub fn configured(variable: &str) -> Self {
        Self {
            base: PoolBase::Configured,
            variable: variable.to_string(),
        }
    }

    pub fn named(base: &str, variable: &str) -> Self {
        Self {
            base: PoolBase::Named(base.to_string()),
            variable: variable.to_string(),
        }
    }
}

/// A post-condition checked against the external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expectation {
    /// Pool bound to `pool_variable` holds exactly `expected` agents.
    AgentCount { pool_variable: String, expected: usize },
    /// Container group named by an output carries these identities.
    IdentityAttachments {
        resource_group_output: String,
        container_group_output: String,
        expected: IdentityAttachments,
    },
}

impl Expectation {
    pub fn agent_count(pool_variable: &str, expected: usize) -> Self {
        Expectation::AgentCount {
            pool_variable: pool_variable.to_string(),
            expected,
        }
    }

    pub fn identities(
        resource_group_output: &str,
        container_group_output: &str,
        expected: IdentityAttachments,
    ) -> Self {
        Expectation::IdentityAttachments {
            resource_group_output: resource_group_output.to_string(),
            container_group_output: container_group_output.to_string(),
            expected,
        }
    }
}

/// One step of VALIDATE, executed in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStep {
    Expect(Vec<Expectation>),
    /// Re-apply in place with changed variables, then check.
    Update {
        overrides: BTreeMap<String, Value>,
        expect: Vec<Expectation>,
    },
    /// Destroy the fixture early, then check; teardown only deletes pools.
    Destroy { expect: Vec<Expectation> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    /// Fixture directory relative to the fixtures root.
    pub fixture: String,
    pub pools: Vec<PoolSpec>,
    pub vars: BTreeMap<String, Value>,
    /// Outputs recorded into the fixture handle after apply.
    pub outputs: Vec<String>,
    pub settle: SettlePolicy,
    pub steps: Vec<ValidationStep>,
}

impl Scenario {
    pub fn new(name: &str, fixture: &str) -> Self {
        Self {
            name: name.to_string(),
            fixture: fixture.to_string(),
            pools: Vec::new(),
            vars: BTreeMap::new(),
            outputs: Vec::new(),
            settle: SettlePolicy::bounded(Duration::from_secs(45)),
            steps: Vec::new(),
        }
    }

    pub fn pool(mut self, pool: PoolSpec) -> Self {
        self.pools.push(pool);
        self
    }

    pub fn var(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }

    pub fn output(mut self, key: &str) -> Self {
        self.outputs.push(key.to_string());
        self
    }

    pub fn settle(mut self, policy: SettlePolicy) -> Self {
        self.settle = policy;
        self
    }

    pub fn expect(mut self, expectations: Vec<Expectation>) -> Self {
        self.steps.push(ValidationStep::Expect(expectations));
        self
    }

    pub fn update(mut self, overrides: &[(&str, Value)], expect: Vec<Expectation>) -> Self {
        let overrides = overrides
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.steps.push(ValidationStep::Update { overrides, expect });
        self
    }

    pub fn destroy(mut self, expect: Vec<Expectation>) -> Self {
        self.steps.push(ValidationStep::Destroy { expect });
        self
    }

    /// Create the run identity, resolving pool bases against `default_base`.
    pub fn new_run(&self, default_base: &str) -> RunIdentity {
        let bases: Vec<(&str, &str)> = self
            .pools
            .iter()
            .map(|p| {
                let base = match &p.base {
                    PoolBase::Configured => default_base,
                    PoolBase::Named(name) => name.as_str(),
                };
                (p.variable.as_str(), base)
            })
            .collect();
        RunIdentity::generate(&self.name, bases)
    }

    /// Fixture module this scenario applies, under `fixtures_root`.
    pub fn fixture_source(&self, fixtures_root: &Path) -> PathBuf {
        fixtures_root.join(&self.fixture)
    }

    /// Provisioning config for `run` in its working directory `work_dir`: the
    /// scenario variables plus the run suffix and every generated pool name.
    pub fn provision_config(&self, work_dir: impl Into<PathBuf>, run: &RunIdentity) -> ProvisionConfig {
        let mut config = ProvisionConfig::new(work_dir);
        config.vars = self.vars.clone();
        config
            .vars
            .insert(RANDOM_SUFFIX_VAR.to_string(), Value::String(run.suffix().to_string()));
        for binding in run.pools() {
            config
                .vars
                .insert(binding.variable.clone(), Value::String(binding.name.clone()));
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RunSuffix;
    use serde_json::json;

    fn two_pool_scenario() -> Scenario {
        Scenario::new("linux-and-windows-agents", "linux-and-windows-agents")
            .pool(PoolSpec::named("linux-e2e-agents", "linux_azure_devops_pool_name"))
            .pool(PoolSpec::named("windows-e2e-agents", "windows_azure_devops_pool_name"))
            .var("agents_count", 2)
    }

    #[test]
    fn test_new_run_resolves_bases() {
        let scenario = Scenario::new("linux-agents", "linux-agents")
            .pool(PoolSpec::configured("azure_devops_pool_name"));
        let run = scenario.new_run("aci-agents");

        let name = run.pool_name("azure_devops_pool_name").unwrap();
        assert_eq!(name, format!("aci-agents-{}", run.suffix()));
    }

    #[test]
    fn test_provision_config_injects_run_values() {
        let scenario = two_pool_scenario();
        let run = RunIdentity::with_suffix(
            &scenario.name,
            RunSuffix(77),
            [
                ("linux_azure_devops_pool_name", "linux-e2e-agents"),
                ("windows_azure_devops_pool_name", "windows-e2e-agents"),
            ],
        );

        assert_eq!(
            scenario.fixture_source(Path::new("fixture")),
            Path::new("fixture/linux-and-windows-agents")
        );
        let config = scenario.provision_config("state/linux-and-windows-agents/77/tf", &run);
        assert_eq!(config.dir, Path::new("state/linux-and-windows-agents/77/tf"));
        assert_eq!(config.vars[RANDOM_SUFFIX_VAR], json!("77"));
        assert_eq!(config.vars["linux_azure_devops_pool_name"], json!("linux-e2e-agents-77"));
        assert_eq!(config.vars["windows_azure_devops_pool_name"], json!("windows-e2e-agents-77"));
        assert_eq!(config.vars["agents_count"], json!(2));
    }

    #[test]
    fn test_steps_keep_declaration_order() {
        let scenario = Scenario::new("linux-agents-scale", "linux-agents")
            .expect(vec![Expectation::agent_count("azure_devops_pool_name", 2)])
            .update(
                &[("agents_count", json!(1))],
                vec![Expectation::agent_count("azure_devops_pool_name", 1)],
            )
            .destroy(vec![Expectation::agent_count("azure_devops_pool_name", 0)]);

        assert!(matches!(scenario.steps[0], ValidationStep::Expect(_)));
        assert!(matches!(scenario.steps[1], ValidationStep::Update { .. }));
        assert!(matches!(scenario.steps[2], ValidationStep::Destroy { .. }));
    }
}
