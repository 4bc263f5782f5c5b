use std::collections::HashSet;

use thiserror::Error;

use stocktake_core::UserId;

use crate::{Permission, Role};

/// A fully resolved principal for authorization decisions.
///
/// Construction is intentionally decoupled from storage and transport: the
/// API derives the effective permission set from token roles and a policy
/// source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub roles: Vec<Role>,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),
}

/// Authorize a principal against a required permission.
///
/// - No IO
/// - No panics
/// - No business logic (pure policy check)
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    let perms: HashSet<&str> = principal.permissions.iter().map(|p| p.as_str()).collect();

    if perms.contains("*") || perms.contains(required.as_str()) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(perms: &[&'static str]) -> Principal {
        Principal {
            user_id: UserId::new(),
            roles: vec![],
            permissions: perms.iter().map(|p| Permission::new(*p)).collect(),
        }
    }

    #[test]
    fn wildcard_grants_everything() {
        let p = principal(&["*"]);
        assert!(authorize(&p, &Permission::new("audits.complete")).is_ok());
    }

    #[test]
    fn exact_permission_grants() {
        let p = principal(&["audits.count"]);
        assert!(authorize(&p, &Permission::new("audits.count")).is_ok());
    }

    #[test]
    fn missing_permission_is_forbidden() {
        let p = principal(&["audits.count"]);
        let err = authorize(&p, &Permission::new("audits.complete")).unwrap_err();
        assert_eq!(err, AuthzError::Forbidden("audits.complete".to_string()));
    }
}
