//! Request authentication via the `x-api-key` header.
//!
//! With `auth.require_api_key = false`, callers without a key are served as
//! anonymous. Catalog and key administration still need a key whenever an
//! admin key is configured.

use crate::api::error::ApiResult;
use crate::services::api_keys::{AuthError, ClientIdentity, Permission};
use crate::state::AppState;
use axum::http::HeaderMap;

pub const API_KEY_HEADER: &str = "x-api-key";

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
}

fn is_administrative(permission: Permission) -> bool {
    matches!(
        permission,
        Permission::ModelPublish | Permission::ModelRetire | Permission::Admin
    )
}

/// Establish who is calling and check they hold `permission`.
pub fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    permission: Permission,
) -> ApiResult<ClientIdentity> {
    if let Some(key) = presented_key(headers) {
        return Ok(state.api_keys.authenticate(Some(key), permission)?);
    }

    let auth = &state.config.auth;
    if auth.require_api_key || (is_administrative(permission) && auth.admin_api_key.is_some()) {
        return Err(AuthError::MissingKey.into());
    }

    Ok(ClientIdentity::anonymous())
}
