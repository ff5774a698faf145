//! Authorization oracle
//!
//! The runtime never decides who a user is or what they may do; it asks an
//! [`AuthorizationOracle`]. [`StaticAuthorizer`] is an in-process oracle
//! backed by a user table with SHA-256 password digests.

use crate::{RuntimeError, RuntimeResult};
use arbor_types::{Credentials, PermissionSet, SessionRef, User};
use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

#[async_trait]
pub trait AuthorizationOracle: Send + Sync {
    /// Resolve credentials to a user, or fail with `AuthenticationFailed`
    async fn authenticate(&self, credentials: &Credentials) -> RuntimeResult<User>;

    /// Look up a user by name without credentials (impersonation)
    async fn find_user(&self, username: &str) -> RuntimeResult<Option<User>>;

    async fn permission_set(&self, user: &User) -> RuntimeResult<PermissionSet>;

    fn check_permission(
        &self,
        _session: &SessionRef,
        permissions: &PermissionSet,
        permission: &str,
        resource: Option<&str>,
    ) -> bool {
        permissions.allows(permission, resource)
    }
}

struct Account {
    user: User,
    digest: String,
    permissions: PermissionSet,
}

/// In-process user table
#[derive(Default)]
pub struct StaticAuthorizer {
    accounts: DashMap<String, Account>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user
    pub fn add_user<I, S>(&self, username: &str, password: &str, grants: I) -> User
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let user = User::new(username);
        self.accounts.insert(
            username.to_string(),
            Account {
                user: user.clone(),
                digest: password_digest(username, password),
                permissions: PermissionSet::from_grants(grants),
            },
        );
        tracing::debug!(username, "User registered");
        user
    }

    pub fn remove_user(&self, username: &str) -> bool {
        self.accounts.remove(username).is_some()
    }

    pub fn user_count(&self) -> usize {
        self.accounts.len()
    }
}

#[async_trait]
impl AuthorizationOracle for StaticAuthorizer {
    async fn authenticate(&self, credentials: &Credentials) -> RuntimeResult<User> {
        let expected = password_digest(&credentials.username, &credentials.secret);
        match self.accounts.get(&credentials.username) {
            Some(account) if constant_time_eq(&account.digest, &expected) => Ok(account.user.clone()),
            _ => {
                tracing::warn!(username = %credentials.username, "Authentication rejected");
                Err(RuntimeError::AuthenticationFailed)
            }
        }
    }

    async fn find_user(&self, username: &str) -> RuntimeResult<Option<User>> {
        Ok(self.accounts.get(username).map(|account| account.user.clone()))
    }

    async fn permission_set(&self, user: &User) -> RuntimeResult<PermissionSet> {
        Ok(self
            .accounts
            .get(&user.username)
            .map(|account| account.permissions.clone())
            .unwrap_or_default())
    }
}

fn password_digest(username: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}
