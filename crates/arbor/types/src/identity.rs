//! Users, credentials and permission sets

use crate::UserId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An authenticated user, as returned by the authorization oracle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: UserId::generate(),
            username: username.into(),
            display_name: String::new(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }
}

/// Credentials presented when opening a session
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

// Never print the secret.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

/// The set of permissions granted to a user, loaded once per session.
///
/// Grant syntax:
/// - `*` grants everything
/// - `customer:read` grants exactly that permission on any resource
/// - `customer:*` grants every permission under the `customer:` prefix
/// - `customer:write@Customer:42` restricts a grant to one resource
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    grants: BTreeSet<String>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A permission set that allows everything
    pub fn unrestricted() -> Self {
        Self::from_grants(["*"])
    }

    pub fn from_grants<I, S>(grants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            grants: grants.into_iter().map(Into::into).collect(),
        }
    }

    pub fn grant(&mut self, grant: impl Into<String>) {
        self.grants.insert(grant.into());
    }

    pub fn revoke(&mut self, grant: &str) -> bool {
        self.grants.remove(grant)
    }

    pub fn grants(&self) -> impl Iterator<Item = &str> {
        self.grants.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    /// Check whether `permission` is granted, optionally on a specific resource
    pub fn allows(&self, permission: &str, resource: Option<&str>) -> bool {
        self.grants.iter().any(|grant| {
            let (pattern, scope) = match grant.split_once('@') {
                Some((pattern, scope)) => (pattern, Some(scope)),
                None => (grant.as_str(), None),
            };
            if let Some(scope) = scope {
                if resource != Some(scope) {
                    return false;
                }
            }
            permission_matches(pattern, permission)
        })
    }
}

fn permission_matches(pattern: &str, permission: &str) -> bool {
    if pattern == "*" || pattern == permission {
        return true;
    }
    match pattern.strip_suffix('*') {
        // keep the trailing ':' so `customer:*` does not match `customers:read`
        Some(prefix) if prefix.ends_with(':') => permission.starts_with(prefix),
        _ => false,
    }
}
