use stocktake_auth::Role;
use stocktake_core::UserId;

/// Authenticated user context for a request.
///
/// This is immutable and must be present for all domain routes; it is the
/// provenance source for `created_by`/`counted_by` fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    user_id: UserId,
    roles: Vec<Role>,
}

impl UserContext {
    pub fn new(user_id: UserId, roles: Vec<Role>) -> Self {
        Self { user_id, roles }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }
}
