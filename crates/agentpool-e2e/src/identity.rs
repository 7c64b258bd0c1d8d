//! Run-unique naming for external resources.
//!
//! Every pool and fixture a scenario touches is named `base-suffix`, where the
//! suffix comes from [`new_run_suffix`]. Concurrent runs are kept apart by the
//! suffix alone; nothing is locked.
//!
//! The suffix is a time-seeded random value with a process-wide sequence
//! number in its low 16 bits. Two suffixes generated by the same process are
//! distinct for the first 65 536 calls. Across processes a collision is still
//! possible (about one in four billion per pair of runs started together).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Random suffix shared by every resource of one scenario run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunSuffix(pub u64);

impl std::fmt::Display for RunSuffix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate a fresh run suffix.
pub fn new_run_suffix() -> RunSuffix {
    let seed = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    let entropy = Uuid::new_v4().as_u128();
    let random = (entropy as u64) ^ ((entropy >> 64) as u64) ^ seed;
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) & 0xFFFF;

    // 48 bits total keeps rendered names within 15 decimal digits.
    RunSuffix(((random & 0xFFFF_FFFF) << 16) | seq)
}

/// A pool name bound to the provisioning variable that receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolBinding {
    /// Provisioning input variable, e.g. `azure_devops_pool_name`.
    pub variable: String,
    /// Run-unique pool name.
    pub name: String,
}

/// Identity of a single scenario run.
///
/// Created once at the start of a run and never mutated afterwards; it is
/// persisted alongside the fixture so later stages address the same resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    scenario: String,
    suffix: RunSuffix,
    pools: Vec<PoolBinding>,
}

impl RunIdentity {
    /// Create an identity for `scenario`, deriving one pool name per
    /// `(variable, base)` pair.
    pub fn generate<'a>(
        scenario: &str,
        pools: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        Self::with_suffix(scenario, new_run_suffix(), pools)
    }

    /// Create an identity with a known suffix.
    pub fn with_suffix<'a>(
        scenario: &str,
        suffix: RunSuffix,
        pools: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let pools = pools
            .into_iter()
            .map(|(variable, base)| PoolBinding {
                variable: variable.to_string(),
                name: format!("{base}-{suffix}"),
            })
            .collect();
        Self {
            scenario: scenario.to_string(),
            suffix,
            pools,
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn suffix(&self) -> RunSuffix {
        self.suffix
    }

    pub fn pools(&self) -> &[PoolBinding] {
        &self.pools
    }

    /// Pool name bound to `variable`, if the run declared one.
    pub fn pool_name(&self, variable: &str) -> Option<&str> {
        self.pools
            .iter()
            .find(|p| p.variable == variable)
            .map(|p| p.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_suffixes_distinct_within_process() {
        let mut seen = HashSet::new();
        for _ in 0..5_000 {
            assert!(seen.insert(new_run_suffix()), "duplicate run suffix");
        }
    }

    #[test]
    fn test_suffixes_distinct_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..1_000).map(|_| new_run_suffix()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for suffix in handle.join().unwrap() {
                assert!(seen.insert(suffix), "duplicate run suffix across threads");
            }
        }
        assert_eq!(seen.len(), 4_000);
    }

    #[test]
    fn test_pool_names_use_base_dash_suffix() {
        let run = RunIdentity::with_suffix(
            "linux-and-windows-agents",
            RunSuffix(4217),
            [
                ("linux_azure_devops_pool_name", "linux-e2e-agents"),
                ("windows_azure_devops_pool_name", "windows-e2e-agents"),
            ],
        );

        assert_eq!(
            run.pool_name("linux_azure_devops_pool_name"),
            Some("linux-e2e-agents-4217")
        );
        assert_eq!(
            run.pool_name("windows_azure_devops_pool_name"),
            Some("windows-e2e-agents-4217")
        );
        assert_eq!(run.pool_name("missing"), None);
    }

    #[test]
    fn test_identity_serializes_suffix_as_integer() {
        let run = RunIdentity::with_suffix("linux-agents", RunSuffix(99), [("pool", "e2e")]);
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["suffix"], 99);

        let back: RunIdentity = serde_json::from_value(value).unwrap();
        assert_eq!(back, run);
    }
}
