//! `stocktake-auth` — authentication/authorization boundary.
//!
//! Identity provisioning lives outside this system; this crate only models
//! the claims a verified token carries and the pure policy checks applied to
//! them. It is intentionally decoupled from HTTP and storage.

pub mod authorize;
pub mod claims;
pub mod jwt;
pub mod permissions;
pub mod roles;

pub use authorize::{authorize, AuthzError, Principal};
pub use claims::{validate_claims, JwtClaims, TokenValidationError};
pub use jwt::{Hs256JwtValidator, JwtError, JwtValidator};
pub use permissions::Permission;
pub use roles::Role;
