//! agentpool-e2e - end-to-end runner for self-hosted agent pool fixtures
//!
//! ## Commands
//!
//! - `list`: Show the built-in scenarios
//! - `run`: Run SETUP, VALIDATE and TEARDOWN (or a subset) for scenarios
//! - `status`: Show persisted runs of a scenario

use agentpool_e2e::{
    catalog, AzureFixtureClient, FixtureStore, HarnessConfig, RunSuffix, Scenario, ScenarioReport,
    Stage, StageOrchestrator, StageSelection, TerraformDriver,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "agentpool-e2e")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Staged end-to-end tests for self-hosted agent pools", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and reports
    #[arg(long, global = true)]
    json: bool,

    /// Fixture store directory shared by separate stage invocations
    #[arg(long, global = true, env = "E2E_STATE_DIR", default_value = ".test-data")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in scenarios
    List,

    /// Run scenarios
    Run {
        /// Scenario names
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        scenarios: Vec<String>,

        /// Run every built-in scenario concurrently
        #[arg(long)]
        all: bool,

        /// Stage to run; repeat to run several (default: all three)
        #[arg(long = "stage", value_enum)]
        stages: Vec<StageArg>,

        /// Run suffix of a persisted run to validate or tear down (single
        /// scenario only, not with the setup stage)
        #[arg(long = "run")]
        suffix: Option<u64>,
    },

    /// Show persisted runs of a scenario
    Status {
        /// Scenario name
        scenario: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StageArg {
    Setup,
    Validate,
    Teardown,
}

impl From<StageArg> for Stage {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Setup => Stage::Setup,
            StageArg::Validate => Stage::Validate,
            StageArg::Teardown => Stage::Teardown,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    agentpool_e2e::init_tracing(cli.json, level);

    match cli.command {
        Commands::List => cmd_list(cli.json),
        Commands::Run {
            scenarios,
            all,
            stages,
            suffix,
        } => {
            let scenarios = resolve_scenarios(&scenarios, all)?;
            if suffix.is_some() && scenarios.len() != 1 {
                bail!("--run selects a persisted run of exactly one scenario");
            }
            let selection = stage_selection(stages, suffix)?;
            cmd_run(
                &cli.state_dir,
                scenarios,
                selection,
                suffix.map(RunSuffix),
                cli.json,
            )
            .await
        }
        Commands::Status { scenario } => cmd_status(&cli.state_dir, &scenario, cli.json),
    }
}

fn stage_selection(stages: Vec<StageArg>, suffix: Option<u64>) -> Result<StageSelection> {
    let selection = if stages.is_empty() {
        StageSelection::all()
    } else {
        let stages: Vec<Stage> = stages.into_iter().map(Stage::from).collect();
        StageSelection::only(&stages)
    };
    if let (Some(suffix), true) = (suffix, selection.setup) {
        bail!("setup always starts a new run; use --stage validate/teardown to resume run {suffix}");
    }
    Ok(selection)
}

fn resolve_scenarios(names: &[String], all: bool) -> Result<Vec<Scenario>> {
    if all {
        return Ok(catalog::all());
    }
    names
        .iter()
        .map(|name| {
            catalog::find(name).with_context(|| {
                format!("unknown scenario '{name}', see `agentpool-e2e list`")
            })
        })
        .collect()
}

/// List the built-in scenarios
fn cmd_list(json: bool) -> Result<()> {
    let scenarios = catalog::all();
    if json {
        println!("{}", serde_json::to_string_pretty(&scenarios)?);
        return Ok(());
    }

    for scenario in scenarios {
        println!(
            "{:<34} fixture={:<34} pools={} settle={}s",
            scenario.name,
            scenario.fixture,
            scenario.pools.len(),
            scenario.settle.deadline.as_secs()
        );
    }
    Ok(())
}

/// Run the selected stages of every scenario, one task per scenario
async fn cmd_run(
    state_dir: &Path,
    scenarios: Vec<Scenario>,
    stages: StageSelection,
    suffix: Option<RunSuffix>,
    json: bool,
) -> Result<()> {
    let config = HarnessConfig::from_env()
        .context("Failed to read harness configuration")?
        .with_state_dir(state_dir);
    let client = AzureFixtureClient::new(&config).context("Failed to build Azure client")?;
    let provisioner = TerraformDriver::from_config(&config);
    let store = FixtureStore::new(&config.state_dir)
        .with_context(|| format!("Failed to open fixture store at {:?}", config.state_dir))?;

    let orchestrator = Arc::new(
        StageOrchestrator::new(Arc::new(client), Arc::new(provisioner), store, &config)
            .with_stages(stages),
    );

    info!(scenarios = scenarios.len(), "starting scenario runs");
    let mut join_set = JoinSet::new();
    for scenario in scenarios {
        let orchestrator = Arc::clone(&orchestrator);
        join_set.spawn(async move {
            let result = orchestrator.run_scenario_for(&scenario, suffix).await;
            (scenario.name, result)
        });
    }

    let mut reports: Vec<ScenarioReport> = Vec::new();
    let mut failed = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((_, Ok(report))) => {
                if !teardown_clean(&report) {
                    error!(scenario = %report.scenario, "teardown left resources behind");
                }
                reports.push(report);
            }
            Ok((name, Err(e))) => {
                error!(scenario = %name, error = %e, "scenario failed");
                failed.push(name);
            }
            Err(e) => {
                error!(error = %e, "scenario task panicked");
                failed.push("<panicked task>".to_string());
            }
        }
    }

    reports.sort_by(|a, b| a.scenario.cmp(&b.scenario));
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            let stages: Vec<String> = report
                .stages
                .iter()
                .map(|s| format!("{}={:?}", s.stage, s.status))
                .collect();
            let verdict = if teardown_clean(report) { "PASS" } else { "LEAK" };
            println!(
                "{} {} (run {}) {}",
                verdict,
                report.scenario,
                report.run.suffix(),
                stages.join(" ")
            );
        }
        for name in &failed {
            println!("FAIL {name}");
        }
    }

    let leaked = reports.iter().filter(|r| !teardown_clean(r)).count();
    if !failed.is_empty() || leaked > 0 {
        bail!(
            "{} of {} scenario(s) failed, {} left resources behind",
            failed.len(),
            failed.len() + reports.len(),
            leaked
        );
    }
    Ok(())
}

fn teardown_clean(report: &ScenarioReport) -> bool {
    report.teardown.as_ref().map_or(true, |t| t.is_clean())
}

/// Show persisted runs of a scenario
fn cmd_status(state_dir: &Path, scenario: &str, json: bool) -> Result<()> {
    let store = FixtureStore::new(state_dir)
        .with_context(|| format!("Failed to open fixture store at {:?}", state_dir))?;
    let records = store
        .list(scenario)
        .with_context(|| format!("Failed to read persisted runs of {scenario}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No persisted runs for '{}'", scenario);
        return Ok(());
    }

    for record in records {
        let pools: Vec<&str> = record.pools.iter().map(|p| p.name.as_str()).collect();
        println!("run {}", record.run.suffix());
        println!("  stage:       {}", record.stage);
        println!("  pools:       {}", pools.join(", "));
        println!(
            "  provisioned: {}",
            record
                .handle
                .as_ref()
                .map(|h| h.config.dir.display().to_string())
                .unwrap_or_else(|| "no".to_string())
        );
        println!("  updated:     {}", record.updated_at.to_rfc3339());
    }
    Ok(())
}
