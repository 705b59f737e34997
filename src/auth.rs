use std::fmt::Debug;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Org roles, ordered by privilege.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum Role {
    #[serde(alias = "viewer")]
    Viewer,
    #[serde(alias = "editor")]
    Editor,
    #[serde(alias = "admin")]
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUser {
    pub id: i64,
    #[serde(default)]
    pub login: String,
    pub org_id: i64,
    pub role: Role,
}

impl SignedUser {
    pub fn new(id: i64, org_id: i64, role: Role) -> Self {
        Self {
            id,
            login: String::new(),
            org_id,
            role,
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.role >= role
    }
}

#[async_trait]
pub trait SubscribeAuthorizer: Send + Sync + Debug {
    async fn can_subscribe(&self, user: &SignedUser) -> bool;
}

#[async_trait]
pub trait PublishAuthorizer: Send + Sync + Debug {
    async fn can_publish(&self, user: &SignedUser) -> bool;
}

/// Allows users holding at least `require_role`.
#[derive(Debug, Clone, Copy)]
pub struct RoleAuthorizer {
    pub require_role: Role,
}

impl RoleAuthorizer {
    pub fn new(require_role: Role) -> Self {
        Self { require_role }
    }
}

#[async_trait]
impl SubscribeAuthorizer for RoleAuthorizer {
    async fn can_subscribe(&self, user: &SignedUser) -> bool {
        user.has_role(self.require_role)
    }
}

#[async_trait]
impl PublishAuthorizer for RoleAuthorizer {
    async fn can_publish(&self, user: &SignedUser) -> bool {
        user.has_role(self.require_role)
    }
}
