//! External fixture client: agent pools and container group identities.
//!
//! The harness only needs four operations from the outside world. They sit
//! behind [`FixtureClient`] so scenarios can be driven against the Azure
//! services ([`AzureFixtureClient`]) or an in-memory fake in tests.

mod azure;

pub use azure::AzureFixtureClient;

use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An agent pool in the agent-management service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRef {
    pub id: u64,
    pub name: String,
}

/// Identities attached to a provisioned container group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAttachments {
    /// 1 when a system-assigned identity is enabled, 0 otherwise.
    pub system_assigned: u8,
    /// Number of user-assigned identities.
    pub user_assigned: usize,
}

impl IdentityAttachments {
    pub fn new(system_assigned: bool, user_assigned: usize) -> Self {
        Self {
            system_assigned: u8::from(system_assigned),
            user_assigned,
        }
    }
}

impl std::fmt::Display for IdentityAttachments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{system_assigned: {}, user_assigned: {}}}",
            self.system_assigned, self.user_assigned
        )
    }
}

/// Operations the harness performs against external fixtures.
///
/// `create_pool` is not idempotent: creating a name that already exists is an
/// error. `delete_pool` is called unconditionally on the teardown path, so it
/// must tolerate pools that were never created (it reports `NotFound`).
#[async_trait]
pub trait FixtureClient: Send + Sync {
    /// Create a pool and confirm it can be found by name.
    async fn create_pool(&self, name: &str) -> Result<PoolRef>;

    /// Look a pool up by name and delete it.
    async fn delete_pool(&self, name: &str) -> Result<()>;

    /// Number of agents registered in the named pool.
    async fn count_agents(&self, name: &str) -> Result<usize>;

    /// Identity attachments of a container group.
    async fn count_identity_attachments(
        &self,
        resource_group: &str,
        container_group: &str,
    ) -> Result<IdentityAttachments>;
}

/// Resolve a name-filtered pool listing to exactly one pool.
pub(crate) fn single_match(name: &str, mut matches: Vec<PoolRef>) -> Result<PoolRef> {
    match matches.len() {
        0 => Err(HarnessError::pool_not_found(name)),
        1 => Ok(matches.remove(0)),
        n => Err(HarnessError::AmbiguousPool {
            name: name.to_string(),
            matches: n,
        }),
    }
}

/// Read the `identity` block of a container group resource.
///
/// A missing block means no identities; the `type` field lists the enabled
/// kinds, e.g. `"SystemAssigned, UserAssigned"`.
pub(crate) fn identity_attachments_from(resource: &serde_json::Value) -> IdentityAttachments {
    let Some(identity) = resource.get("identity").filter(|v| !v.is_null()) else {
        return IdentityAttachments::default();
    };

    let system = identity
        .get("type")
        .and_then(|t| t.as_str())
        .map(|t| t.contains("SystemAssigned"))
        .unwrap_or(false);

    let user = identity
        .get("userAssignedIdentities")
        .and_then(|u| u.as_object())
        .map(|u| u.len())
        .unwrap_or(0);

    IdentityAttachments::new(system, user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pool(id: u64, name: &str) -> PoolRef {
        PoolRef {
            id,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_single_match_zero_is_not_found() {
        let err = single_match("e2e-agents-1", vec![]).unwrap_err();
        assert!(matches!(err, HarnessError::NotFound { .. }));
    }

    #[test]
    fn test_single_match_one() {
        let found = single_match("e2e-agents-1", vec![pool(7, "e2e-agents-1")]).unwrap();
        assert_eq!(found.id, 7);
    }

    #[test]
    fn test_single_match_many_is_ambiguous() {
        let err = single_match(
            "e2e-agents-1",
            vec![pool(7, "e2e-agents-1"), pool(8, "E2E-agents-1")],
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::AmbiguousPool { matches: 2, .. }));
    }

    #[test]
    fn test_identity_absent() {
        let resource = json!({ "name": "aci-devops-linux", "properties": {} });
        assert_eq!(identity_attachments_from(&resource), IdentityAttachments::new(false, 0));

        let resource = json!({ "identity": null });
        assert_eq!(identity_attachments_from(&resource), IdentityAttachments::new(false, 0));
    }

    #[test]
    fn test_identity_system_and_user_assigned() {
        let resource = json!({
            "identity": {
                "type": "SystemAssigned, UserAssigned",
                "principalId": "p",
                "userAssignedIdentities": {
                    "/subscriptions/s/resourceGroups/rg/providers/Microsoft.ManagedIdentity/userAssignedIdentities/a": {},
                    "/subscriptions/s/resourceGroups/rg/providers/Microsoft.ManagedIdentity/userAssignedIdentities/b": {}
                }
            }
        });
        let attachments = identity_attachments_from(&resource);
        assert_eq!(attachments.system_assigned, 1);
        assert_eq!(attachments.user_assigned, 2);
    }

    #[test]
    fn test_identity_user_assigned_only() {
        let resource = json!({
            "identity": {
                "type": "UserAssigned",
                "userAssignedIdentities": { "a": {} }
            }
        });
        assert_eq!(identity_attachments_from(&resource), IdentityAttachments::new(false, 1));
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(
            IdentityAttachments::new(true, 2).to_string(),
            "{system_assigned: 1, user_assigned: 2}"
        );
    }
}
