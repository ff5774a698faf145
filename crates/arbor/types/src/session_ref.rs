//! Detached session references

use crate::{CompanyId, SessionId, TenantId, UserId};
use serde::{Deserialize, Serialize};

/// A snapshot of the identity and context of a session.
///
/// Extensions and workflows receive this instead of the session itself: they
/// may act on behalf of a session but never own its lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub username: String,
    pub company_id: CompanyId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
}
