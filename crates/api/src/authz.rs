//! API-side authorization guard for commands.
//!
//! Enforced at the command boundary (before dispatch), keeping domain
//! aggregates and infra auth-agnostic.

use stocktake_auth::{authorize, AuthzError, Permission, Principal, Role};

use crate::context::UserContext;

/// Check that the current user holds every required permission.
///
/// Intended to be called **before** dispatching a command.
pub fn require_permissions(user: &UserContext, required: &[Permission]) -> Result<(), AuthzError> {
    let principal = Principal {
        user_id: user.user_id(),
        roles: user.roles().to_vec(),
        permissions: permissions_from_roles(user.roles()),
    };

    for perm in required {
        authorize(&principal, perm)?;
    }

    Ok(())
}

/// Role→permission mapping.
///
/// Intentionally static until a real policy source exists.
fn permissions_from_roles(roles: &[Role]) -> Vec<Permission> {
    let mut perms = Vec::new();
    for role in roles {
        match role.as_str() {
            // Convention: "admin" grants all permissions.
            "admin" => return vec![Permission::new("*")],
            "supervisor" => perms.extend(
                [
                    "audits.create",
                    "audits.start",
                    "audits.assign",
                    "audits.read",
                    "audits.count",
                    "audits.reconcile",
                    "audits.items.reopen",
                    "audits.complete",
                    "audits.cancel",
                    "inventory.read",
                    "inventory.items.create",
                    "inventory.items.adjust",
                ]
                .map(Permission::new),
            ),
            "counter" => perms.extend(
                ["audits.read", "audits.count", "audits.reconcile", "inventory.read"]
                    .map(Permission::new),
            ),
            _ => {}
        }
    }
    perms
}
