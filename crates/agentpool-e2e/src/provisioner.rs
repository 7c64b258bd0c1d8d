//! Provisioning driver: applies and destroys Terraform fixtures.

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info};

/// Keep only the tail of engine stderr in errors.
const STDERR_TAIL_BYTES: usize = 4096;

/// Engine-local state that must never be shared between working copies.
const ENGINE_STATE_ENTRIES: &[&str] = &[
    ".terraform",
    "terraform.tfstate",
    "terraform.tfstate.backup",
    ".terraform.tfstate.lock.info",
];

/// A fixture working directory plus the input variables it is applied with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Per-run Terraform working directory, holding the run's local state
    pub dir: PathBuf,
    /// Input variables passed as `-var key=value`
    pub vars: BTreeMap<String, Value>,
}

impl ProvisionConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            vars: BTreeMap::new(),
        }
    }

    /// Set a single input variable.
    pub fn with_var(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }

    /// Copy of this config with `overrides` merged over its variables.
    pub fn with_overrides(&self, overrides: &BTreeMap<String, Value>) -> Self {
        let mut updated = self.clone();
        for (key, value) in overrides {
            updated.vars.insert(key.clone(), value.clone());
        }
        updated
    }

    /// `-var` arguments in key order.
    pub fn var_args(&self) -> Vec<String> {
        self.vars
            .iter()
            .flat_map(|(key, value)| ["-var".to_string(), render_var(key, value)])
            .collect()
    }

    /// Deterministic SHA-256 over the directory and variables.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.dir.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        for (key, value) in &self.vars {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.to_string().as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }
}

fn render_var(key: &str, value: &Value) -> String {
    match value {
        Value::String(s) => format!("{key}={s}"),
        other => format!("{key}={other}"),
    }
}

/// Strip one leading and one trailing double quote.
///
/// `terraform output NAME` prints string outputs quoted on some engine
/// versions; the harness always normalizes them.
pub fn remove_quotes(s: &str) -> &str {
    let s = s.strip_prefix('"').unwrap_or(s);
    s.strip_suffix('"').unwrap_or(s)
}

/// Copy the fixture module at `source` into `dest`, leaving engine state
/// (`.terraform/`, `terraform.tfstate*`) behind.
pub fn copy_fixture(source: &Path, dest: &Path) -> Result<()> {
    if !source.is_dir() {
        return Err(HarnessError::NotFound {
            kind: "fixture",
            name: source.display().to_string(),
        });
    }
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        if ENGINE_STATE_ENTRIES.iter().any(|skip| name == *skip) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            copy_fixture(&path, &dest.join(&name))?;
        } else {
            std::fs::copy(&path, dest.join(&name))?;
        }
    }
    Ok(())
}

/// Applies, updates and destroys a declared resource configuration.
///
/// Every failure is fatal to the scenario; nothing is retried here.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Stage a private working copy of the fixture at `source` in `work_dir`.
    ///
    /// Every run applies from its own copy so concurrent runs of one fixture
    /// never share engine state.
    async fn prepare(&self, source: &Path, work_dir: &Path) -> Result<()>;

    /// Initialize and apply the configuration.
    async fn apply(&self, config: &ProvisionConfig) -> Result<()>;

    /// Destroy everything the configuration declares.
    async fn destroy(&self, config: &ProvisionConfig) -> Result<()>;

    /// Read a named output as a plain string.
    async fn read_output(&self, config: &ProvisionConfig, key: &str) -> Result<String>;

    /// Re-apply with `overrides` merged into the variables, in place.
    ///
    /// Returns the updated configuration so it can be persisted.
    async fn update(
        &self,
        config: &ProvisionConfig,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<ProvisionConfig> {
        let updated = config.with_overrides(overrides);
        self.apply(&updated).await?;
        Ok(updated)
    }
}

/// [`Provisioner`] that shells out to the `terraform` binary.
pub struct TerraformDriver {
    binary: String,
    timeout: Duration,
}

impl TerraformDriver {
    pub fn new(binary: &str, timeout: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(&config.terraform_bin, config.terraform_timeout)
    }

    /// Run one engine command in `dir` and return its stdout; fails on
    /// non-zero exit.
    pub async fn run(&self, dir: &Path, args: &[String]) -> Result<String> {
        let start = Instant::now();
        let command_line = format!(
            "{} {}",
            self.binary,
            args.iter()
                .take_while(|a| a.as_str() != "-var")
                .cloned()
                .collect::<Vec<_>>()
                .join(" ")
        );
        info!(command = %command_line, dir = %dir.display(), "running provisioning engine");

        let child = Command::new(&self.binary)
            .args(args)
            .current_dir(dir)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HarnessError::Provisioning {
                command: command_line.clone(),
                exit_code: None,
                stderr: format!("failed to start {}: {}", self.binary, e),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| HarnessError::Provisioning {
                command: command_line.clone(),
                exit_code: None,
                stderr: format!("timed out after {} seconds", self.timeout.as_secs()),
            })??;

        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        debug!(command = %command_line, duration_ms, stdout = %stdout, "provisioning engine finished");

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HarnessError::Provisioning {
                command: command_line,
                exit_code: output.status.code(),
                stderr: tail(&stderr, STDERR_TAIL_BYTES).to_string(),
            });
        }

        Ok(stdout)
    }

    async fn init(&self, config: &ProvisionConfig) -> Result<()> {
        let args = strings(&["init", "-input=false", "-no-color"]);
        self.run(&config.dir, &args).await.map(|_| ())
    }

    async fn apply_only(&self, config: &ProvisionConfig) -> Result<()> {
        let mut args = strings(&["apply", "-auto-approve", "-input=false", "-no-color"]);
        args.extend(config.var_args());
        self.run(&config.dir, &args).await.map(|_| ())
    }
}

#[async_trait]
impl Provisioner for TerraformDriver {
    async fn prepare(&self, source: &Path, work_dir: &Path) -> Result<()> {
        info!(source = %source.display(), work_dir = %work_dir.display(), "staging fixture working copy");
        let (source, work_dir) = (source.to_path_buf(), work_dir.to_path_buf());
        tokio::task::spawn_blocking(move || copy_fixture(&source, &work_dir))
            .await
            .map_err(|e| HarnessError::State(format!("fixture copy task failed: {e}")))?
    }

    async fn apply(&self, config: &ProvisionConfig) -> Result<()> {
        self.init(config).await?;
        self.apply_only(config).await
    }

    async fn destroy(&self, config: &ProvisionConfig) -> Result<()> {
        let mut args = strings(&["destroy", "-auto-approve", "-input=false", "-no-color"]);
        args.extend(config.var_args());
        self.run(&config.dir, &args).await.map(|_| ())
    }

    async fn read_output(&self, config: &ProvisionConfig, key: &str) -> Result<String> {
        let args = strings(&["output", "-no-color", key]);
        let stdout = self.run(&config.dir, &args).await?;
        Ok(remove_quotes(stdout.trim()).to_string())
    }

    async fn update(
        &self,
        config: &ProvisionConfig,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<ProvisionConfig> {
        let updated = config.with_overrides(overrides);
        self.apply_only(&updated).await?;
        Ok(updated)
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

fn tail(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remove_quotes() {
        assert_eq!(remove_quotes("\"rg-e2e-42\""), "rg-e2e-42");
        assert_eq!(remove_quotes("rg-e2e-42"), "rg-e2e-42");
        assert_eq!(remove_quotes(""), "");
        assert_eq!(remove_quotes("\""), "");
        assert_eq!(remove_quotes("\"\""), "");
        assert_eq!(remove_quotes("\"half"), "half");
    }

    #[test]
    fn test_remove_quotes_roundtrip_unquoted() {
        for s in ["aci-devops-linux", "with space", "a\"b", "x"] {
            let wrapped = format!("\"{s}\"");
            assert_eq!(remove_quotes(&wrapped), s);
        }
    }

    #[test]
    fn test_var_args_rendering() {
        let config = ProvisionConfig::new("fixture/linux-agents")
            .with_var("azure_devops_pool_name", "e2e-agents-7")
            .with_var("agents_count", 2)
            .with_var("enable_vnet", true)
            .with_var("zones", json!(["1", "2"]));

        assert_eq!(
            config.var_args(),
            vec![
                "-var",
                "agents_count=2",
                "-var",
                "azure_devops_pool_name=e2e-agents-7",
                "-var",
                "enable_vnet=true",
                "-var",
                "zones=[\"1\",\"2\"]",
            ]
        );
    }

    #[test]
    fn test_overrides_merge_and_digest_changes() {
        let config = ProvisionConfig::new("fixture/linux-agents").with_var("agents_count", 2);
        let mut overrides = BTreeMap::new();
        overrides.insert("agents_count".to_string(), json!(1));

        let updated = config.with_overrides(&overrides);
        assert_eq!(updated.vars["agents_count"], json!(1));
        assert_eq!(config.vars["agents_count"], json!(2));
        assert_ne!(config.digest(), updated.digest());
        assert_eq!(config.digest(), config.clone().digest());
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let s = "ééééé";
        let t = tail(s, 3);
        assert!(s.ends_with(t));
        assert!(t.len() <= 3);
    }

    #[tokio::test]
    async fn test_run_success_captures_stdout() {
        let driver = TerraformDriver::new("echo", Duration::from_secs(30));
        let dir = tempfile::tempdir().unwrap();

        let stdout = driver
            .run(dir.path(), &strings(&["plan", "-no-color"]))
            .await
            .expect("echo should succeed");
        assert!(stdout.contains("plan -no-color"));
    }

    #[tokio::test]
    async fn test_prepare_copies_module_without_engine_state() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("linux-agents");
        std::fs::create_dir_all(source.join("modules/aci")).unwrap();
        std::fs::create_dir_all(source.join(".terraform/providers")).unwrap();
        std::fs::write(source.join("main.tf"), "module \"aci\" {}\n").unwrap();
        std::fs::write(source.join("modules/aci/main.tf"), "# aci\n").unwrap();
        std::fs::write(source.join("terraform.tfstate"), "{}").unwrap();
        std::fs::write(source.join(".terraform/providers/lock"), "x").unwrap();

        let work_dir = root.path().join("state/linux-agents/42/tf");
        let driver = TerraformDriver::new("terraform", Duration::from_secs(5));
        driver.prepare(&source, &work_dir).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(work_dir.join("main.tf")).unwrap(),
            "module \"aci\" {}\n"
        );
        assert!(work_dir.join("modules/aci/main.tf").is_file());
        assert!(!work_dir.join("terraform.tfstate").exists());
        assert!(!work_dir.join(".terraform").exists());
    }

    #[tokio::test]
    async fn test_prepare_missing_fixture_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let driver = TerraformDriver::new("terraform", Duration::from_secs(5));

        let err = driver
            .prepare(&root.path().join("nope"), &root.path().join("tf"))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::NotFound { kind: "fixture", .. }));
        assert!(!root.path().join("tf").exists());
    }

    #[tokio::test]
    async fn test_failing_engine_is_provisioning_error() {
        let driver = TerraformDriver::new("false", Duration::from_secs(30));
        let dir = tempfile::tempdir().unwrap();
        let config = ProvisionConfig::new(dir.path());

        let err = driver.destroy(&config).await.unwrap_err();
        match err {
            HarnessError::Provisioning {
                command, exit_code, ..
            } => {
                assert!(command.starts_with("false destroy"));
                assert_ne!(exit_code, Some(0));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_provisioning_error() {
        let driver = TerraformDriver::new("definitely-not-terraform-e2e", Duration::from_secs(5));
        let dir = tempfile::tempdir().unwrap();
        let config = ProvisionConfig::new(dir.path());

        let err = driver.apply(&config).await.unwrap_err();
        assert!(matches!(err, HarnessError::Provisioning { exit_code: None, .. }));
    }

    #[tokio::test]
    async fn test_read_output_strips_quotes() {
        // `echo output -no-color "name"` prints the key back, quoted.
        let driver = TerraformDriver::new("echo", Duration::from_secs(30));
        let dir = tempfile::tempdir().unwrap();
        let config = ProvisionConfig::new(dir.path());

        let value = driver
            .read_output(&config, "\"resource_group_name\"")
            .await
            .unwrap();
        assert_eq!(value, "output -no-color \"resource_group_name");
    }
}
