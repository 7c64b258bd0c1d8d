//! Filesystem fixture store.
//!
//! Layout: `<root>/<scenario>/<run suffix>.json`, one record per run, and
//! `<root>/<scenario>/<run suffix>/tf/` holding that run's Terraform working
//! copy. The store, not process memory, is the source of truth between stages.

use crate::error::{HarnessError, Result};
use crate::fixture::FixtureRecord;
use crate::identity::RunSuffix;
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct FixtureStore {
    root: PathBuf,
}

impl FixtureStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, scenario: &str, suffix: RunSuffix) -> PathBuf {
        self.root.join(scenario).join(format!("{suffix}.json"))
    }

    /// Private Terraform working directory of one run.
    pub fn work_dir(&self, scenario: &str, suffix: RunSuffix) -> PathBuf {
        self.root
            .join(scenario)
            .join(suffix.to_string())
            .join("tf")
    }

    /// Persist `record`, replacing any previous version atomically.
    pub fn save(&self, record: &mut FixtureRecord) -> Result<()> {
        record.updated_at = Utc::now();
        let path = self.record_path(record.run.scenario(), record.run.suffix());
        let dir = path.parent().expect("record path always has parent");
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.write_all(b"\n")?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Load one run's record and check its fixture digest.
    pub fn load(&self, scenario: &str, suffix: RunSuffix) -> Result<FixtureRecord> {
        let record = self.read(scenario, suffix)?;
        verified(record)
    }

    fn read(&self, scenario: &str, suffix: RunSuffix) -> Result<FixtureRecord> {
        let path = self.record_path(scenario, suffix);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HarnessError::State(format!(
                    "no persisted fixture for {scenario} run {suffix}"
                ))
            } else {
                HarnessError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All persisted runs of `scenario`, oldest first.
    pub fn list(&self, scenario: &str) -> Result<Vec<FixtureRecord>> {
        let dir = self.root.join(scenario);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let bytes = fs::read(&path)?;
                records.push(serde_json::from_slice::<FixtureRecord>(&bytes)?);
            }
        }
        records.sort_by_key(|r| r.updated_at);
        Ok(records)
    }

    /// Resolve the run a standalone stage should act on.
    ///
    /// With an explicit suffix that run is loaded; otherwise exactly one
    /// persisted run must exist for the scenario.
    pub fn find(&self, scenario: &str, suffix: Option<RunSuffix>) -> Result<FixtureRecord> {
        verified(self.locate(scenario, suffix)?)
    }

    /// Like [`find`](Self::find), but a digest mismatch only warns: teardown
    /// must still be able to release a run whose record was edited by hand.
    pub fn find_for_release(
        &self,
        scenario: &str,
        suffix: Option<RunSuffix>,
    ) -> Result<FixtureRecord> {
        let record = self.locate(scenario, suffix)?;
        if let Some(Err(e)) = record.handle.as_ref().map(|h| h.verify()) {
            warn!(scenario, suffix = %record.run.suffix(), error = %e, "releasing fixture with edited record");
        }
        Ok(record)
    }

    fn locate(&self, scenario: &str, suffix: Option<RunSuffix>) -> Result<FixtureRecord> {
        if let Some(suffix) = suffix {
            return self.read(scenario, suffix);
        }

        let mut records = self.list(scenario)?;
        match records.len() {
            0 => Err(HarnessError::State(format!(
                "no persisted fixture for {scenario}, run the setup stage first"
            ))),
            1 => Ok(records.remove(0)),
            n => Err(HarnessError::State(format!(
                "{n} persisted runs for {scenario}, select one by run suffix"
            ))),
        }
    }

    /// Delete a run's record. Missing records are not an error.
    pub fn remove(&self, scenario: &str, suffix: RunSuffix) -> Result<()> {
        match fs::remove_file(self.record_path(scenario, suffix)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a run's working copy. Missing directories are not an error.
    pub fn remove_work_dir(&self, scenario: &str, suffix: RunSuffix) -> Result<()> {
        let run_dir = self.root.join(scenario).join(suffix.to_string());
        match fs::remove_dir_all(run_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn verified(record: FixtureRecord) -> Result<FixtureRecord> {
    if let Some(handle) = &record.handle {
        handle.verify()?;
    }
    Ok(record)
}
