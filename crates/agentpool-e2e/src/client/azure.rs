//! Azure-backed fixture client
//!
//! Agent pools are managed through the Azure DevOps distributed-task REST API
//! (PAT basic auth). Container group identities are read from Azure Resource
//! Manager with a bearer token.

use super::{identity_attachments_from, single_match, FixtureClient, IdentityAttachments, PoolRef};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const DEVOPS_API_VERSION: &str = "7.0";
const CONTAINER_INSTANCE_API_VERSION: &str = "2021-10-01";
const ARM_ENDPOINT: &str = "https://management.azure.com";
const ARM_SCOPE: &str = "https://management.azure.com/.default";
const LOGIN_ENDPOINT: &str = "https://login.microsoftonline.com";

/// How the client obtains an ARM bearer token.
#[derive(Debug, Clone)]
enum ArmCredentials {
    /// Pre-issued token (`AZURE_ACCESS_TOKEN`)
    Token(String),
    /// Service principal client-credentials flow
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    Missing,
}

impl ArmCredentials {
    fn from_config(config: &HarnessConfig) -> Self {
        if let Some(token) = &config.arm_access_token {
            return ArmCredentials::Token(token.clone());
        }
        match (&config.tenant_id, &config.client_id, &config.client_secret) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => ArmCredentials::ClientSecret {
                tenant_id: tenant_id.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            },
            _ => ArmCredentials::Missing,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Fixture client talking to Azure DevOps and Azure Resource Manager.
pub struct AzureFixtureClient {
    org_url: String,
    personal_access_token: String,
    subscription_id: Option<String>,
    arm_endpoint: String,
    credentials: ArmCredentials,
    arm_token: OnceCell<String>,
    http: reqwest::Client,
}

impl AzureFixtureClient {
    /// Create a client from harness configuration, including its ARM
    /// credentials.
    pub fn new(config: &HarnessConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("agentpool-e2e/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(AzureFixtureClient {
            org_url: config.org_url.clone(),
            personal_access_token: config.personal_access_token.clone(),
            subscription_id: config.subscription_id.clone(),
            arm_endpoint: ARM_ENDPOINT.to_string(),
            credentials: ArmCredentials::from_config(config),
            arm_token: OnceCell::new(),
            http,
        })
    }

    /// Use a pre-issued ARM bearer token.
    pub fn with_arm_token(mut self, token: &str) -> Self {
        self.credentials = ArmCredentials::Token(token.to_string());
        self.arm_token = OnceCell::new();
        self
    }

    /// Point ARM requests at a different endpoint (sovereign clouds).
    pub fn with_arm_endpoint(mut self, endpoint: &str) -> Self {
        self.arm_endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    fn pools_url(&self) -> String {
        format!("{}/_apis/distributedtask/pools", self.org_url)
    }

    async fn find_pool(&self, name: &str) -> Result<PoolRef> {
        let response = self
            .http
            .get(self.pools_url())
            .query(&[("poolName", name), ("api-version", DEVOPS_API_VERSION)])
            .basic_auth("", Some(&self.personal_access_token))
            .send()
            .await?;

        let pools: ListResponse<PoolRef> = checked(response, "agent pool", name).await?.json().await?;
        single_match(name, pools.value)
    }

    async fn arm_token(&self) -> Result<&str> {
        self.arm_token
            .get_or_try_init(|| self.fetch_arm_token())
            .await
            .map(String::as_str)
    }

    async fn fetch_arm_token(&self) -> Result<String> {
        match &self.credentials {
            ArmCredentials::Token(token) => Ok(token.clone()),
            ArmCredentials::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => {
                debug!(tenant_id = %tenant_id, "requesting ARM token");
                let response = self
                    .http
                    .post(format!("{LOGIN_ENDPOINT}/{tenant_id}/oauth2/v2.0/token"))
                    .form(&[
                        ("grant_type", "client_credentials"),
                        ("client_id", client_id.as_str()),
                        ("client_secret", client_secret.as_str()),
                        ("scope", ARM_SCOPE),
                    ])
                    .send()
                    .await?;
                let token: TokenResponse = checked(response, "tenant", tenant_id).await?.json().await?;
                Ok(token.access_token)
            }
            ArmCredentials::Missing => Err(HarnessError::Config(
                "no ARM credentials: set AZURE_ACCESS_TOKEN or AZURE_TENANT_ID, AZURE_CLIENT_ID and AZURE_CLIENT_SECRET"
                    .to_string(),
            )),
        }
    }
}

#[async_trait]
impl FixtureClient for AzureFixtureClient {
    async fn create_pool(&self, name: &str) -> Result<PoolRef> {
        info!(pool = %name, "creating agent pool");

        let response = self
            .http
            .post(self.pools_url())
            .query(&[("api-version", DEVOPS_API_VERSION)])
            .basic_auth("", Some(&self.personal_access_token))
            .json(&json!({
                "name": name,
                "poolType": "automation",
                "autoProvision": false,
            }))
            .send()
            .await?;
        checked(response, "agent pool", name).await?;

        // The create response is not trusted on its own; the pool must be
        // visible through the same lookup later stages use.
        self.find_pool(name).await
    }

    async fn delete_pool(&self, name: &str) -> Result<()> {
        let pool = self.find_pool(name).await?;
        info!(pool = %name, pool_id = pool.id, "deleting agent pool");

        let response = self
            .http
            .delete(format!("{}/{}", self.pools_url(), pool.id))
            .query(&[("api-version", DEVOPS_API_VERSION)])
            .basic_auth("", Some(&self.personal_access_token))
            .send()
            .await?;
        checked(response, "agent pool", name).await?;
        Ok(())
    }

    async fn count_agents(&self, name: &str) -> Result<usize> {
        let pool = self.find_pool(name).await?;

        let response = self
            .http
            .get(format!("{}/{}/agents", self.pools_url(), pool.id))
            .query(&[("api-version", DEVOPS_API_VERSION)])
            .basic_auth("", Some(&self.personal_access_token))
            .send()
            .await?;
        let agents: ListResponse<serde_json::Value> =
            checked(response, "agent pool", name).await?.json().await?;

        debug!(pool = %name, agents = agents.value.len(), "counted agents");
        Ok(agents.value.len())
    }

    async fn count_identity_attachments(
        &self,
        resource_group: &str,
        container_group: &str,
    ) -> Result<IdentityAttachments> {
        let subscription = self.subscription_id.as_deref().ok_or_else(|| {
            HarnessError::Config("AZURE_SUBSCRIPTION_ID is required for identity checks".to_string())
        })?;
        let token = self.arm_token().await?;

        let url = format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerInstance/containerGroups/{}",
            self.arm_endpoint, subscription, resource_group, container_group
        );
        let response = self
            .http
            .get(url)
            .query(&[("api-version", CONTAINER_INSTANCE_API_VERSION)])
            .bearer_auth(token)
            .send()
            .await?;
        let resource: serde_json::Value = checked(response, "container group", container_group)
            .await?
            .json()
            .await?;

        Ok(identity_attachments_from(&resource))
    }
}

/// Map HTTP failures onto the harness error taxonomy.
async fn checked(response: Response, kind: &'static str, name: &str) -> Result<Response> {
    let status = response.status();

    if status == StatusCode::NOT_FOUND {
        return Err(HarnessError::NotFound {
            kind,
            name: name.to_string(),
        });
    }
    // Azure DevOps answers a rejected PAT with a 203 sign-in page.
    if status == StatusCode::NON_AUTHORITATIVE_INFORMATION {
        return Err(HarnessError::Api(format!(
            "{kind} {name}: request was redirected to sign-in, check the personal access token"
        )));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(HarnessError::Api(format!("{kind} {name}: HTTP {status}: {body}")));
    }

    Ok(response)
}
