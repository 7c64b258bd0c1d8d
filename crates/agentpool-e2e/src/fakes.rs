//! In-memory fakes for the external seams (testing only)
//!
//! Provides `MemoryFixtureClient` and `ScriptedProvisioner`, which satisfy the
//! [`FixtureClient`] and [`Provisioner`] contracts without touching Azure or
//! running Terraform. Both keep a call log so tests can assert on exactly
//! what the orchestrator did.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::client::{FixtureClient, IdentityAttachments, PoolRef};
use crate::error::{HarnessError, Result};
use crate::provisioner::{remove_quotes, ProvisionConfig, Provisioner};

// ---------------------------------------------------------------------------
// MemoryFixtureClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCall {
    CreatePool(String),
    DeletePool(String),
    CountAgents(String),
    CountIdentities {
        resource_group: String,
        container_group: String,
    },
}

#[derive(Debug)]
struct FakePool {
    agents: usize,
    /// Agent count that becomes visible after `lag` more reads.
    pending: Option<(usize, u32)>,
}

#[derive(Debug, Default)]
struct ClientState {
    next_id: u64,
    pools: BTreeMap<String, FakePool>,
    identities: HashMap<(String, String), IdentityAttachments>,
    calls: Vec<ClientCall>,
    failing_creates: HashSet<String>,
    failing_deletes: HashSet<String>,
    panic_on_count: bool,
}

/// Agent pools and container groups held in a `Mutex`.
///
/// With a registration lag, agent count changes surface only after that many
/// `count_agents` reads, which exercises the settle poller.
#[derive(Debug, Default)]
pub struct MemoryFixtureClient {
    state: Mutex<ClientState>,
    registration_lag: u32,
}

impl MemoryFixtureClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registration_lag(reads: u32) -> Self {
        Self {
            registration_lag: reads,
            ..Self::default()
        }
    }

    /// Schedule the agent count of an existing pool. Unknown pools are ignored.
    pub fn set_agents(&self, pool: &str, agents: usize) {
        let mut state = self.state.lock().unwrap();
        if let Some(p) = state.pools.get_mut(pool) {
            if self.registration_lag == 0 {
                p.agents = agents;
                p.pending = None;
            } else {
                p.pending = Some((agents, self.registration_lag));
            }
        }
    }

    pub fn set_identities(
        &self,
        resource_group: &str,
        container_group: &str,
        attachments: IdentityAttachments,
    ) {
        let mut state = self.state.lock().unwrap();
        state.identities.insert(
            (resource_group.to_string(), container_group.to_string()),
            attachments,
        );
    }

    /// Reject creation of every pool whose name starts with `prefix`.
    pub fn fail_create(&self, prefix: &str) {
        self.state.lock().unwrap().failing_creates.insert(prefix.to_string());
    }

    /// Reject deletion of every pool whose name starts with `prefix`.
    pub fn fail_delete(&self, prefix: &str) {
        self.state.lock().unwrap().failing_deletes.insert(prefix.to_string());
    }

    /// Panic inside the next `count_agents` call.
    pub fn panic_on_count(&self) {
        self.state.lock().unwrap().panic_on_count = true;
    }

    pub fn pool_exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().pools.contains_key(name)
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.state.lock().unwrap().pools.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn created_pools(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClientCall::CreatePool(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn deleted_pools(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClientCall::DeletePool(name) => Some(name),
                _ => None,
            })
            .collect()
    }
}

fn matches_any(prefixes: &HashSet<String>, name: &str) -> bool {
    prefixes.iter().any(|p| name.starts_with(p.as_str()))
}

#[async_trait]
impl FixtureClient for MemoryFixtureClient {
    async fn create_pool(&self, name: &str) -> Result<PoolRef> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ClientCall::CreatePool(name.to_string()));
        if matches_any(&state.failing_creates, name) {
            return Err(HarnessError::Api(format!("creating pool {name} was rejected")));
        }
        if state.pools.contains_key(name) {
            return Err(HarnessError::Api(format!("pool {name} already exists")));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.pools.insert(
            name.to_string(),
            FakePool {
                agents: 0,
                pending: None,
            },
        );
        Ok(PoolRef {
            id,
            name: name.to_string(),
        })
    }

    async fn delete_pool(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ClientCall::DeletePool(name.to_string()));
        if matches_any(&state.failing_deletes, name) {
            return Err(HarnessError::Api(format!("deleting pool {name} was rejected")));
        }
        state
            .pools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HarnessError::pool_not_found(name))
    }

    async fn count_agents(&self, name: &str) -> Result<usize> {
        let should_panic = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(ClientCall::CountAgents(name.to_string()));
            std::mem::take(&mut state.panic_on_count)
        };
        // Lock released first so the mutex is not poisoned for teardown.
        if should_panic {
            panic!("injected panic while counting agents in {name}");
        }

        let mut state = self.state.lock().unwrap();
        let pool = state
            .pools
            .get_mut(name)
            .ok_or_else(|| HarnessError::pool_not_found(name))?;
        pool.pending = match pool.pending.take() {
            Some((agents, 0)) => {
                pool.agents = agents;
                None
            }
            Some((agents, reads)) => Some((agents, reads - 1)),
            None => None,
        };
        Ok(pool.agents)
    }

    async fn count_identity_attachments(
        &self,
        resource_group: &str,
        container_group: &str,
    ) -> Result<IdentityAttachments> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ClientCall::CountIdentities {
            resource_group: resource_group.to_string(),
            container_group: container_group.to_string(),
        });
        state
            .identities
            .get(&(resource_group.to_string(), container_group.to_string()))
            .copied()
            .ok_or_else(|| HarnessError::NotFound {
                kind: "container group",
                name: format!("{resource_group}/{container_group}"),
            })
    }
}

// ---------------------------------------------------------------------------
// ScriptedProvisioner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionCall {
    Prepare { source: PathBuf, work_dir: PathBuf },
    Apply(ProvisionConfig),
    Update(ProvisionConfig),
    Destroy(ProvisionConfig),
    ReadOutput(String),
}

/// Provisioner that records calls and, when wired to a
/// [`MemoryFixtureClient`], registers agents the way a real fixture would.
///
/// Applying registers `agents_count` agents (default 2) in every pool named by
/// a variable ending in `pool_name`; destroying empties those pools.
#[derive(Debug, Default)]
pub struct ScriptedProvisioner {
    cloud: Option<Arc<MemoryFixtureClient>>,
    outputs: BTreeMap<String, String>,
    fail_apply: bool,
    fail_destroy: bool,
    calls: Mutex<Vec<ProvisionCall>>,
}

impl ScriptedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wired_to(client: Arc<MemoryFixtureClient>) -> Self {
        Self {
            cloud: Some(client),
            ..Self::default()
        }
    }

    /// Raw engine output for `key`; quotes are stripped on read.
    pub fn with_output(mut self, key: &str, value: &str) -> Self {
        self.outputs.insert(key.to_string(), value.to_string());
        self
    }

    pub fn failing_apply(mut self) -> Self {
        self.fail_apply = true;
        self
    }

    pub fn failing_destroy(mut self) -> Self {
        self.fail_destroy = true;
        self
    }

    pub fn calls(&self) -> Vec<ProvisionCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Working directories of every apply, in call order.
    pub fn applied_dirs(&self) -> Vec<PathBuf> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                ProvisionCall::Apply(config) => Some(config.dir.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn apply_count(&self) -> usize {
        self.count(|c| matches!(c, ProvisionCall::Apply(_)))
    }

    pub fn update_count(&self) -> usize {
        self.count(|c| matches!(c, ProvisionCall::Update(_)))
    }

    pub fn destroy_count(&self) -> usize {
        self.count(|c| matches!(c, ProvisionCall::Destroy(_)))
    }

    fn count(&self, pred: impl Fn(&ProvisionCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: ProvisionCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn register_agents(&self, config: &ProvisionConfig, agents: usize) {
        let Some(cloud) = &self.cloud else {
            return;
        };
        let pools = config
            .vars
            .iter()
            .filter(|(key, _)| key.ends_with("pool_name"))
            .filter_map(|(_, value)| value.as_str());
        for pool in pools {
            cloud.set_agents(pool, agents);
        }
    }
}

fn agents_count(config: &ProvisionConfig) -> usize {
    config
        .vars
        .get("agents_count")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .unwrap_or(2)
}

fn scripted_failure(command: &str, config: &ProvisionConfig) -> HarnessError {
    HarnessError::Provisioning {
        command: format!("terraform {command}"),
        exit_code: Some(1),
        stderr: format!("scripted failure in {}", config.dir.display()),
    }
}

#[async_trait]
impl Provisioner for ScriptedProvisioner {
    async fn prepare(&self, source: &Path, work_dir: &Path) -> Result<()> {
        self.record(ProvisionCall::Prepare {
            source: source.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
        });
        Ok(())
    }

    async fn apply(&self, config: &ProvisionConfig) -> Result<()> {
        self.record(ProvisionCall::Apply(config.clone()));
        if self.fail_apply {
            return Err(scripted_failure("apply", config));
        }
        self.register_agents(config, agents_count(config));
        Ok(())
    }

    async fn destroy(&self, config: &ProvisionConfig) -> Result<()> {
        self.record(ProvisionCall::Destroy(config.clone()));
        if self.fail_destroy {
            return Err(scripted_failure("destroy", config));
        }
        self.register_agents(config, 0);
        Ok(())
    }

    async fn read_output(&self, _config: &ProvisionConfig, key: &str) -> Result<String> {
        self.record(ProvisionCall::ReadOutput(key.to_string()));
        self.outputs
            .get(key)
            .map(|v| remove_quotes(v).to_string())
            .ok_or_else(|| HarnessError::NotFound {
                kind: "output",
                name: key.to_string(),
            })
    }

    async fn update(
        &self,
        config: &ProvisionConfig,
        overrides: &BTreeMap<String, serde_json::Value>,
    ) -> Result<ProvisionConfig> {
        let updated = config.with_overrides(overrides);
        self.record(ProvisionCall::Update(updated.clone()));
        if self.fail_apply {
            return Err(scripted_failure("apply", &updated));
        }
        self.register_agents(&updated, agents_count(&updated));
        Ok(updated)
    }
}
