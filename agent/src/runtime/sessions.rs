use async_trait::async_trait;
use infermesh_common::wire::SessionGrant;
use infermesh_common::ErrorBody;

/// Checks a presented credential with the session authority.
///
/// Errors carry the authority's classification unchanged; transport
/// failures surface as `Unavailable`.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, credential: &str, worker_id: &str) -> Result<SessionGrant, ErrorBody>;
}
