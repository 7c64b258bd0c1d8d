//! Structured observability hooks for scenario runs.
//!
//! This module provides:
//! - A scenario-scoped span to instrument a run's future with
//! - Emission functions for stage transitions, settle waits and teardown
//!
//! Events are emitted at `info!` level; teardown problems at `warn!` so they
//! stay visible without failing the run.

use crate::fixture::{FixtureRecord, Stage};
use crate::identity::RunSuffix;
use crate::scope::TeardownReport;
use std::path::Path;
use tracing::{info, warn, Span};

/// Span tagging every event of one scenario run.
///
/// Attach it with `tracing::Instrument` rather than entering it, so the run's
/// future stays `Send`.
pub fn scenario_span(scenario: &str) -> Span {
    tracing::info_span!("e2e.scenario", scenario = %scenario, run_suffix = tracing::field::Empty)
}

/// Record the run suffix on the current scenario span once it is known.
pub fn record_run_suffix(suffix: RunSuffix) {
    Span::current().record("run_suffix", suffix.0);
}

pub fn emit_stage_started(scenario: &str, stage: Stage) {
    info!(event = "stage.started", scenario = %scenario, stage = %stage);
}

pub fn emit_stage_finished(scenario: &str, stage: Stage, duration_ms: u64, success: bool) {
    info!(
        event = "stage.finished",
        scenario = %scenario,
        stage = %stage,
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_stage_skipped(scenario: &str, stage: Stage) {
    info!(event = "stage.skipped", scenario = %scenario, stage = %stage);
}

/// Emit event: a post-condition was evaluated after a settle wait.
pub fn emit_postcondition(
    scenario: &str,
    check: &str,
    matched: bool,
    attempts: u32,
    elapsed_ms: u64,
) {
    info!(
        event = "postcondition.evaluated",
        scenario = %scenario,
        check = %check,
        matched = matched,
        attempts = attempts,
        elapsed_ms = elapsed_ms,
    );
}

pub fn emit_teardown_error(scenario: &str, resource: &str, error: &dyn std::fmt::Display) {
    warn!(event = "teardown.error", scenario = %scenario, resource = %resource, error = %error);
}

pub fn emit_teardown_finished(record: &FixtureRecord, report: &TeardownReport) {
    info!(
        event = "teardown.finished",
        scenario = %record.run.scenario(),
        run_suffix = record.run.suffix().0,
        destroyed = report.destroyed,
        deleted_pools = report.deleted_pools.len(),
        failures = report.failures.len(),
    );
}

pub fn emit_scope_detached(record: &FixtureRecord) {
    info!(
        event = "scope.detached",
        scenario = %record.run.scenario(),
        run_suffix = record.run.suffix().0,
        stage = %record.stage,
        "fixture kept for a later stage"
    );
}

/// Emit event: a scope was dropped before teardown ran (outer cancellation).
pub fn emit_scope_leaked(record: &FixtureRecord, path: &Path) {
    warn!(
        event = "scope.leaked",
        scenario = %record.run.scenario(),
        run_suffix = record.run.suffix().0,
        pools = ?record.pools.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        provisioned = record.handle.is_some(),
        record = %path.display(),
        "scope dropped without teardown, run the teardown stage to clean up"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_span_create() {
        let span = scenario_span("linux-agents");
        let _entered = span.enter();
        record_run_suffix(RunSuffix(3));
    }
}
