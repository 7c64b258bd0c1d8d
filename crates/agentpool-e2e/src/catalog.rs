//! Built-in scenarios for the ACI agent fixtures under `fixture/`.

use crate::client::IdentityAttachments;
use crate::poller::SettlePolicy;
use crate::scenario::{Expectation, PoolSpec, Scenario};
use serde_json::json;
use std::time::Duration;

pub const POOL_VAR: &str = "azure_devops_pool_name";
pub const LINUX_POOL_VAR: &str = "linux_azure_devops_pool_name";
pub const WINDOWS_POOL_VAR: &str = "windows_azure_devops_pool_name";
pub const AGENTS_COUNT_VAR: &str = "agents_count";

/// Linux agents only need to start and register.
const LINUX_SETTLE: Duration = Duration::from_secs(45);
/// Windows agents additionally pull a multi-gigabyte image.
const WINDOWS_SETTLE: Duration = Duration::from_secs(150);

fn single_pool(name: &str, fixture: &str) -> Scenario {
    Scenario::new(name, fixture)
        .pool(PoolSpec::configured(POOL_VAR))
        .settle(SettlePolicy::bounded(LINUX_SETTLE))
}

pub fn linux_agents() -> Scenario {
    single_pool("linux-agents", "linux-agents")
        .expect(vec![Expectation::agent_count(POOL_VAR, 2)])
}

pub fn linux_agents_managed_identities() -> Scenario {
    single_pool("linux-agents-managed-identities", "linux-agents-managed-identities")
        .output("resource_group_name")
        .output("linux_container_group_name")
        .expect(vec![
            Expectation::agent_count(POOL_VAR, 2),
            Expectation::identities(
                "resource_group_name",
                "linux_container_group_name",
                IdentityAttachments::new(true, 2),
            ),
        ])
}

pub fn linux_agents_vnet() -> Scenario {
    single_pool("linux-agents-vnet", "linux-agents-vnet")
        .expect(vec![Expectation::agent_count(POOL_VAR, 2)])
}

pub fn linux_agents_import_rg() -> Scenario {
    single_pool("linux-agents-import-rg", "linux-agents-import-rg")
        .expect(vec![Expectation::agent_count(POOL_VAR, 2)])
}

pub fn linux_and_windows_agents() -> Scenario {
    Scenario::new("linux-and-windows-agents", "linux-and-windows-agents")
        .pool(PoolSpec::named("linux-e2e-agents", LINUX_POOL_VAR))
        .pool(PoolSpec::named("windows-e2e-agents", WINDOWS_POOL_VAR))
        .settle(SettlePolicy::bounded(WINDOWS_SETTLE))
        .expect(vec![
            Expectation::agent_count(LINUX_POOL_VAR, 2),
            Expectation::agent_count(WINDOWS_POOL_VAR, 2),
        ])
}

/// Scale 2 → 1 in place, then destroy and expect an empty pool.
pub fn linux_agents_scale() -> Scenario {
    single_pool("linux-agents-scale", "linux-agents")
        .var(AGENTS_COUNT_VAR, 2)
        .expect(vec![Expectation::agent_count(POOL_VAR, 2)])
        .update(
            &[(AGENTS_COUNT_VAR, json!(1))],
            vec![Expectation::agent_count(POOL_VAR, 1)],
        )
        .destroy(vec![Expectation::agent_count(POOL_VAR, 0)])
}

pub fn all() -> Vec<Scenario> {
    vec![
        linux_agents(),
        linux_agents_managed_identities(),
        linux_agents_vnet(),
        linux_and_windows_agents(),
        linux_agents_import_rg(),
        linux_agents_scale(),
    ]
}

pub fn find(name: &str) -> Option<Scenario> {
    all().into_iter().find(|s| s.name == name)
}
