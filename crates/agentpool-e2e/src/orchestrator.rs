//! Stage orchestration: SETUP → VALIDATE → TEARDOWN for one scenario.
//!
//! ```text
//! INIT ─▶ SETUP ─▶ VALIDATE ─▶ TEARDOWN ─▶ DONE
//!           │          │           ▲
//!           └────▶ FAILED ─────────┘
//! ```
//!
//! Once a run's scope is open, teardown happens before `run_scenario`
//! returns, whatever SETUP or VALIDATE did: return an error, or panic. The
//! only way around it is dropping the future mid-flight (an outer timeout),
//! in which case the persisted record lets a later `teardown` finish the job.

use crate::client::FixtureClient;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::fixture::{FixtureHandle, Stage};
use crate::identity::{RunIdentity, RunSuffix};
use crate::obs;
use crate::poller::{poll_until, PollOutcome, SettlePolicy};
use crate::provisioner::Provisioner;
use crate::scenario::{Expectation, Scenario, ValidationStep};
use crate::scope::{FixtureScope, TeardownReport};
use crate::store::FixtureStore;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Instrument};

/// Which stages an invocation runs.
///
/// Running a subset lets an operator provision once and iterate on VALIDATE;
/// the skipped stages pick up from the fixture store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSelection {
    pub setup: bool,
    pub validate: bool,
    pub teardown: bool,
}

impl Default for StageSelection {
    fn default() -> Self {
        Self::all()
    }
}

impl StageSelection {
    pub fn all() -> Self {
        Self {
            setup: true,
            validate: true,
            teardown: true,
        }
    }

    pub fn only(stages: &[Stage]) -> Self {
        Self {
            setup: stages.contains(&Stage::Setup),
            validate: stages.contains(&Stage::Validate),
            teardown: stages.contains(&Stage::Teardown),
        }
    }

    pub fn includes(&self, stage: Stage) -> bool {
        match stage {
            Stage::Setup => self.setup,
            Stage::Validate => self.validate,
            Stage::Teardown => self.teardown,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub duration_ms: u64,
}

/// Summary of a scenario run that completed without SETUP/VALIDATE errors.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub run: RunIdentity,
    pub stages: Vec<StageReport>,
    /// `None` when teardown was not selected.
    pub teardown: Option<TeardownReport>,
}

impl ScenarioReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

pub struct StageOrchestrator {
    client: Arc<dyn FixtureClient>,
    provisioner: Arc<dyn Provisioner>,
    store: FixtureStore,
    fixtures_dir: PathBuf,
    pool_name_base: String,
    stages: StageSelection,
}

impl StageOrchestrator {
    pub fn new(
        client: Arc<dyn FixtureClient>,
        provisioner: Arc<dyn Provisioner>,
        store: FixtureStore,
        config: &HarnessConfig,
    ) -> Self {
        Self {
            client,
            provisioner,
            store,
            fixtures_dir: config.fixtures_dir.clone(),
            pool_name_base: config.pool_name_base.clone(),
            stages: StageSelection::all(),
        }
    }

    pub fn with_stages(mut self, stages: StageSelection) -> Self {
        self.stages = stages;
        self
    }

    pub fn store(&self) -> &FixtureStore {
        &self.store
    }

    /// Run the selected stages of `scenario` for a new (or the only persisted) run.
    pub async fn run_scenario(&self, scenario: &Scenario) -> Result<ScenarioReport> {
        self.run_scenario_for(scenario, None).await
    }

    /// Like [`run_scenario`](Self::run_scenario), resuming the persisted run
    /// with `suffix`. A suffix cannot be combined with SETUP, which always
    /// opens a new run.
    pub async fn run_scenario_for(
        &self,
        scenario: &Scenario,
        suffix: Option<RunSuffix>,
    ) -> Result<ScenarioReport> {
        self.run_staged(scenario, suffix)
            .instrument(obs::scenario_span(&scenario.name))
            .await
    }

    async fn run_staged(
        &self,
        scenario: &Scenario,
        suffix: Option<RunSuffix>,
    ) -> Result<ScenarioReport> {
        let mut scope = match (self.stages.setup, suffix) {
            (true, Some(suffix)) => {
                return Err(HarnessError::State(format!(
                    "setup always starts a new run of {}, run {suffix} can only be validated or torn down",
                    scenario.name
                )))
            }
            (true, None) => {
                FixtureScope::open(self.store.clone(), scenario.new_run(&self.pool_name_base))?
            }
            (false, _) if self.stages.validate => {
                FixtureScope::resume(self.store.clone(), self.store.find(&scenario.name, suffix)?)
            }
            (false, _) => FixtureScope::resume(
                self.store.clone(),
                self.store.find_for_release(&scenario.name, suffix)?,
            ),
        };
        obs::record_run_suffix(scope.run().suffix());

        let mut stages = Vec::new();
        let outcome = AssertUnwindSafe(self.setup_and_validate(scenario, &mut scope, &mut stages))
            .catch_unwind()
            .await;

        if !matches!(outcome, Ok(Ok(()))) {
            if let Err(e) = scope.set_stage(Stage::Failed) {
                warn!(scenario = %scenario.name, error = %e, "could not persist failed stage");
            }
        }

        let run = scope.run().clone();
        let teardown = if self.stages.teardown {
            let start = Instant::now();
            obs::emit_stage_started(&scenario.name, Stage::Teardown);
            let report = scope
                .release(self.client.as_ref(), self.provisioner.as_ref())
                .await;
            let duration_ms = start.elapsed().as_millis() as u64;
            obs::emit_stage_finished(&scenario.name, Stage::Teardown, duration_ms, report.is_clean());
            stages.push(StageReport {
                stage: Stage::Teardown,
                status: if report.is_clean() {
                    StageStatus::Passed
                } else {
                    StageStatus::Failed
                },
                duration_ms,
            });
            Some(report)
        } else {
            obs::emit_stage_skipped(&scenario.name, Stage::Teardown);
            stages.push(skipped(Stage::Teardown));
            if let Err(e) = scope.detach() {
                warn!(scenario = %scenario.name, error = %e, "could not persist detached fixture");
            }
            None
        };

        match outcome {
            Err(panic) => std::panic::resume_unwind(panic),
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => Ok(ScenarioReport {
                scenario: scenario.name.clone(),
                run,
                stages,
                teardown,
            }),
        }
    }

    async fn setup_and_validate(
        &self,
        scenario: &Scenario,
        scope: &mut FixtureScope,
        stages: &mut Vec<StageReport>,
    ) -> Result<()> {
        for stage in [Stage::Setup, Stage::Validate] {
            if !self.stages.includes(stage) {
                obs::emit_stage_skipped(&scenario.name, stage);
                stages.push(skipped(stage));
                continue;
            }

            let start = Instant::now();
            obs::emit_stage_started(&scenario.name, stage);
            scope.set_stage(stage)?;

            let result = match stage {
                Stage::Setup => self.setup(scenario, scope).await,
                _ => self.validate(scenario, scope).await,
            };

            let duration_ms = start.elapsed().as_millis() as u64;
            obs::emit_stage_finished(&scenario.name, stage, duration_ms, result.is_ok());
            stages.push(StageReport {
                stage,
                status: if result.is_ok() {
                    StageStatus::Passed
                } else {
                    StageStatus::Failed
                },
                duration_ms,
            });
            result?;
        }
        Ok(())
    }

    async fn setup(&self, scenario: &Scenario, scope: &mut FixtureScope) -> Result<()> {
        let bindings = scope.run().pools().to_vec();
        for binding in &bindings {
            scope.register_pool(&binding.name)?;
            let pool = self.client.create_pool(&binding.name).await?;
            scope.pool_created(&pool)?;
        }

        let run = scope.run();
        let work_dir = self.store.work_dir(run.scenario(), run.suffix());
        self.provisioner
            .prepare(&scenario.fixture_source(&self.fixtures_dir), &work_dir)
            .await?;

        let config = scenario.provision_config(work_dir, scope.run());
        scope.register_fixture(config.clone())?;
        self.provisioner.apply(&config).await?;

        let mut outputs = BTreeMap::new();
        for key in &scenario.outputs {
            let value = self.provisioner.read_output(&config, key).await?;
            outputs.insert(key.clone(), value);
        }
        scope.record_outputs(outputs)
    }

    async fn validate(&self, scenario: &Scenario, scope: &mut FixtureScope) -> Result<()> {
        for step in &scenario.steps {
            let expectations = match step {
                ValidationStep::Expect(expect) => expect,
                ValidationStep::Update { overrides, expect } => {
                    let config = fixture(scope)?.config.clone();
                    info!(scenario = %scenario.name, overrides = ?overrides, "updating fixture in place");
                    let updated = self.provisioner.update(&config, overrides).await?;
                    scope.replace_config(updated)?;
                    expect
                }
                ValidationStep::Destroy { expect } => {
                    let config = fixture(scope)?.config.clone();
                    info!(scenario = %scenario.name, "destroying fixture before teardown");
                    self.provisioner.destroy(&config).await?;
                    scope.forget_fixture()?;
                    expect
                }
            };
            self.check_all(scenario, scope, expectations).await?;
        }
        Ok(())
    }

    async fn check_all(
        &self,
        scenario: &Scenario,
        scope: &FixtureScope,
        expectations: &[Expectation],
    ) -> Result<()> {
        let mut policy = scenario.settle;
        for expectation in expectations {
            self.check(scenario, scope, &policy, expectation).await?;
            // Only the first check of a step waits out the settle delay.
            policy = policy.with_initial_delay(Duration::ZERO);
        }
        Ok(())
    }

    async fn check(
        &self,
        scenario: &Scenario,
        scope: &FixtureScope,
        policy: &SettlePolicy,
        expectation: &Expectation,
    ) -> Result<()> {
        let client = self.client.as_ref();

        match expectation {
            Expectation::AgentCount {
                pool_variable,
                expected,
            } => {
                let pool = scope.run().pool_name(pool_variable).ok_or_else(|| {
                    HarnessError::State(format!(
                        "{} declares no pool bound to {}",
                        scenario.name, pool_variable
                    ))
                })?;
                let outcome = poll_until(policy, *expected, move || client.count_agents(pool)).await?;
                conclude(scenario, &format!("agents in pool {pool}"), outcome)
            }
            Expectation::IdentityAttachments {
                resource_group_output,
                container_group_output,
                expected,
            } => {
                let resource_group = self.output(scope, resource_group_output).await?;
                let container_group = self.output(scope, container_group_output).await?;
                let (rg, cg) = (resource_group.as_str(), container_group.as_str());
                let outcome = poll_until(policy, *expected, move || {
                    client.count_identity_attachments(rg, cg)
                })
                .await?;
                conclude(scenario, &format!("identities of container group {rg}/{cg}"), outcome)
            }
        }
    }

    /// Recorded output, falling back to asking the engine.
    async fn output(&self, scope: &FixtureScope, key: &str) -> Result<String> {
        let handle = fixture(scope)?;
        match handle.output(key) {
            Some(value) => Ok(value.to_string()),
            None => self.provisioner.read_output(&handle.config, key).await,
        }
    }
}

fn fixture(scope: &FixtureScope) -> Result<&FixtureHandle> {
    scope.handle().ok_or_else(|| {
        HarnessError::State(format!(
            "{} run {} has no provisioned fixture",
            scope.run().scenario(),
            scope.run().suffix()
        ))
    })
}

fn conclude<T: Debug>(scenario: &Scenario, check: &str, outcome: PollOutcome<T>) -> Result<()> {
    obs::emit_postcondition(
        &scenario.name,
        check,
        outcome.matches_expected,
        outcome.attempts,
        outcome.elapsed.as_millis() as u64,
    );
    outcome.into_result(check).map(|_| ())
}

fn skipped(stage: Stage) -> StageReport {
    StageReport {
        stage,
        status: StageStatus::Skipped,
        duration_ms: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_selection_only() {
        let selection = StageSelection::only(&[Stage::Validate]);
        assert!(!selection.includes(Stage::Setup));
        assert!(selection.includes(Stage::Validate));
        assert!(!selection.includes(Stage::Teardown));
        assert!(!selection.includes(Stage::Done));
    }

    #[test]
    fn test_stage_selection_default_is_all() {
        let selection = StageSelection::default();
        assert!(selection.setup && selection.validate && selection.teardown);
    }
}
