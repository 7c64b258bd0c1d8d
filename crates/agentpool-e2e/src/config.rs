//! Harness configuration
//!
//! Read once from the environment at the start of a run. The harness never
//! writes environment variables; per-run values reach Terraform through the
//! explicit variable map of a [`ProvisionConfig`](crate::provisioner::ProvisionConfig).

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_ORG_NAME: &str = "TF_VAR_azure_devops_org_name";
pub const ENV_PERSONAL_ACCESS_TOKEN: &str = "TF_VAR_azure_devops_personal_access_token";
pub const ENV_POOL_NAME: &str = "TF_VAR_azure_devops_pool_name";
pub const ENV_SUBSCRIPTION_ID: &str = "AZURE_SUBSCRIPTION_ID";
pub const ENV_ARM_ACCESS_TOKEN: &str = "AZURE_ACCESS_TOKEN";
pub const ENV_TENANT_ID: &str = "AZURE_TENANT_ID";
pub const ENV_CLIENT_ID: &str = "AZURE_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
pub const ENV_DEVOPS_URL: &str = "E2E_DEVOPS_URL";
pub const ENV_FIXTURES_DIR: &str = "E2E_FIXTURES_DIR";
pub const ENV_STATE_DIR: &str = "E2E_STATE_DIR";
pub const ENV_TERRAFORM_BIN: &str = "E2E_TERRAFORM_BIN";
pub const ENV_TERRAFORM_TIMEOUT: &str = "E2E_TERRAFORM_TIMEOUT_SECS";

const DEFAULT_POOL_BASE: &str = "e2e-agents";
const DEFAULT_TERRAFORM_TIMEOUT_SECS: u64 = 1800;

/// Everything the harness needs from its surroundings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Azure DevOps organization name
    pub org_name: String,
    /// Organization URL, `https://dev.azure.com/{org}` unless overridden
    pub org_url: String,
    /// Personal access token for the agent-pool API
    #[serde(skip_serializing, default)]
    pub personal_access_token: String,
    /// Subscription holding the provisioned container groups
    pub subscription_id: Option<String>,
    /// Pre-issued ARM bearer token; wins over the service principal
    #[serde(skip_serializing, default)]
    pub arm_access_token: Option<String>,
    /// Service principal tenant for the ARM client-credentials flow
    pub tenant_id: Option<String>,
    /// Service principal application id
    pub client_id: Option<String>,
    #[serde(skip_serializing, default)]
    pub client_secret: Option<String>,
    /// Base for generated pool names when a scenario does not name its own
    pub pool_name_base: String,
    /// Root directory containing the Terraform fixtures
    pub fixtures_dir: PathBuf,
    /// Root directory of the fixture store
    pub state_dir: PathBuf,
    /// Terraform executable
    pub terraform_bin: String,
    /// Upper bound for a single Terraform invocation
    pub terraform_timeout: Duration,
}

impl HarnessConfig {
    /// Create a config with defaults for everything but the credentials.
    pub fn new(org_name: &str, personal_access_token: &str) -> Self {
        HarnessConfig {
            org_name: org_name.to_string(),
            org_url: org_url_for(org_name),
            personal_access_token: personal_access_token.to_string(),
            subscription_id: None,
            arm_access_token: None,
            tenant_id: None,
            client_id: None,
            client_secret: None,
            pool_name_base: DEFAULT_POOL_BASE.to_string(),
            fixtures_dir: PathBuf::from("fixture"),
            state_dir: PathBuf::from(".test-data"),
            terraform_bin: "terraform".to_string(),
            terraform_timeout: Duration::from_secs(DEFAULT_TERRAFORM_TIMEOUT_SECS),
        }
    }

    /// Load the config from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the config through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require =
            |key: &str| get(key).ok_or_else(|| HarnessError::Config(format!("{key} is not set")));

        let org_name = require(ENV_ORG_NAME)?;
        let token = require(ENV_PERSONAL_ACCESS_TOKEN)?;
        let mut config = HarnessConfig::new(&org_name, &token);

        if let Some(url) = get(ENV_DEVOPS_URL) {
            config.org_url = url.trim_end_matches('/').to_string();
        }
        config.subscription_id = get(ENV_SUBSCRIPTION_ID);
        config.arm_access_token = get(ENV_ARM_ACCESS_TOKEN);
        config.tenant_id = get(ENV_TENANT_ID);
        config.client_id = get(ENV_CLIENT_ID);
        config.client_secret = get(ENV_CLIENT_SECRET);
        if let Some(base) = get(ENV_POOL_NAME) {
            config.pool_name_base = base;
        }
        if let Some(dir) = get(ENV_FIXTURES_DIR) {
            config.fixtures_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get(ENV_STATE_DIR) {
            config.state_dir = PathBuf::from(dir);
        }
        if let Some(bin) = get(ENV_TERRAFORM_BIN) {
            config.terraform_bin = bin;
        }
        if let Some(secs) = get(ENV_TERRAFORM_TIMEOUT) {
            let secs: u64 = secs.parse().map_err(|_| {
                HarnessError::Config(format!("{ENV_TERRAFORM_TIMEOUT} must be a number, got {secs:?}"))
            })?;
            config.terraform_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Set the subscription used for container group lookups.
    pub fn with_subscription(mut self, subscription_id: &str) -> Self {
        self.subscription_id = Some(subscription_id.to_string());
        self
    }

    /// Set the fixture root.
    pub fn with_fixtures_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fixtures_dir = dir.into();
        self
    }

    /// Set the fixture store root.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Set the default pool-name base.
    pub fn with_pool_name_base(mut self, base: &str) -> Self {
        self.pool_name_base = base.to_string();
        self
    }
}

fn org_url_for(org_name: &str) -> String {
    format!("https://dev.azure.com/{org_name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_from_lookup_requires_org_and_token() {
        let err = HarnessConfig::from_lookup(lookup_from(&[(ENV_ORG_NAME, "contoso")])).unwrap_err();
        assert!(err.to_string().contains(ENV_PERSONAL_ACCESS_TOKEN));

        let err = HarnessConfig::from_lookup(lookup_from(&[(ENV_PERSONAL_ACCESS_TOKEN, "pat")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_ORG_NAME));
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = HarnessConfig::from_lookup(lookup_from(&[
            (ENV_ORG_NAME, "contoso"),
            (ENV_PERSONAL_ACCESS_TOKEN, "pat"),
        ]))
        .unwrap();

        assert_eq!(config.org_url, "https://dev.azure.com/contoso");
        assert_eq!(config.pool_name_base, "e2e-agents");
        assert_eq!(config.terraform_bin, "terraform");
        assert_eq!(config.terraform_timeout, Duration::from_secs(1800));
        assert!(config.subscription_id.is_none());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = HarnessConfig::from_lookup(lookup_from(&[
            (ENV_ORG_NAME, "contoso"),
            (ENV_PERSONAL_ACCESS_TOKEN, "pat"),
            (ENV_DEVOPS_URL, "https://devops.internal/contoso/"),
            (ENV_POOL_NAME, "aci-agents"),
            (ENV_SUBSCRIPTION_ID, "0000-1111"),
            (ENV_TERRAFORM_TIMEOUT, "60"),
        ]))
        .unwrap();

        assert_eq!(config.org_url, "https://devops.internal/contoso");
        assert_eq!(config.pool_name_base, "aci-agents");
        assert_eq!(config.subscription_id.as_deref(), Some("0000-1111"));
        assert_eq!(config.terraform_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let err = HarnessConfig::from_lookup(lookup_from(&[
            (ENV_ORG_NAME, "contoso"),
            (ENV_PERSONAL_ACCESS_TOKEN, "pat"),
            (ENV_TERRAFORM_TIMEOUT, "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn test_arm_credentials_from_lookup() {
        let config = HarnessConfig::from_lookup(lookup_from(&[
            (ENV_ORG_NAME, "contoso"),
            (ENV_PERSONAL_ACCESS_TOKEN, "pat"),
            (ENV_TENANT_ID, "tenant"),
            (ENV_CLIENT_ID, "app"),
            (ENV_CLIENT_SECRET, "sp-secret"),
            (ENV_ARM_ACCESS_TOKEN, ""),
        ]))
        .unwrap();

        assert_eq!(config.tenant_id.as_deref(), Some("tenant"));
        assert_eq!(config.client_id.as_deref(), Some("app"));
        assert_eq!(config.client_secret.as_deref(), Some("sp-secret"));
        assert!(config.arm_access_token.is_none());
    }

    #[test]
    fn test_secrets_not_serialized() {
        let mut config = HarnessConfig::new("contoso", "secret-pat");
        config.arm_access_token = Some("secret-arm".to_string());
        config.client_id = Some("app".to_string());
        config.client_secret = Some("secret-sp".to_string());

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret-pat"));
        assert!(!json.contains("secret-arm"));
        assert!(!json.contains("secret-sp"));
        assert!(json.contains("\"client_id\":\"app\""));
    }
}
