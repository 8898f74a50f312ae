//! Resolution of the authenticated user behind an HTTP request

use crate::model::UserId;
use axum::http::{Extensions, HeaderMap};

/// Resolves the user identity of an HTTP request, if any
///
/// Authentication itself happens upstream (session cookie, JWT); the
/// resolver only reads what the authentication layer left behind.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap, extensions: &Extensions) -> Option<UserId>;
}

/// Request extension inserted by the authentication middleware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserId);

/// Reads [`AuthenticatedUser`] from the request extensions
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionIdentity;

impl IdentityResolver for ExtensionIdentity {
    fn resolve(&self, _headers: &HeaderMap, extensions: &Extensions) -> Option<UserId> {
        extensions.get::<AuthenticatedUser>().map(|user| user.0)
    }
}
