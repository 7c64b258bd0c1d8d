//! agentpool-e2e: staged end-to-end harness for self-hosted agent pools
//!
//! Each scenario provisions a Terraform fixture that runs build agents in
//! container instances, checks that the agents register with the expected
//! pool, and tears everything down again.
//!
//! ## Lifecycle
//!
//! - SETUP: create agent pools, apply the fixture, record outputs
//! - VALIDATE: poll post-conditions until they hold or a deadline passes
//! - TEARDOWN: destroy the fixture and delete pools, whatever happened before
//!
//! Stages can run in separate invocations; the [`FixtureStore`] carries the
//! run between them.

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod fakes;
pub mod fixture;
pub mod identity;
pub mod obs;
pub mod orchestrator;
pub mod poller;
pub mod provisioner;
pub mod scenario;
pub mod scope;
pub mod store;
pub mod telemetry;

pub use client::{AzureFixtureClient, FixtureClient, IdentityAttachments, PoolRef};
pub use config::HarnessConfig;
pub use error::{HarnessError, Result};
pub use fixture::{FixtureHandle, FixtureRecord, Stage};
pub use identity::{new_run_suffix, RunIdentity, RunSuffix};
pub use orchestrator::{ScenarioReport, StageOrchestrator, StageReport, StageSelection, StageStatus};
pub use poller::{poll_until, wait_then_check, PollOutcome, SettlePolicy};
pub use provisioner::{remove_quotes, ProvisionConfig, Provisioner, TerraformDriver};
pub use scenario::{Expectation, PoolSpec, Scenario, ValidationStep};
pub use scope::{FixtureScope, TeardownReport};
pub use store::FixtureStore;
pub use telemetry::init_tracing;
