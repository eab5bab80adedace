//! Persistence gateway: the only place where progress crosses the network.
//!
//! A gateway talks to the remote store on behalf of an identity. Identity itself is an
//! external collaborator supplying the current user and a bearer token; having no token is
//! a normal state in which the engine keeps working local-only.

/// Gateway failures.
pub mod error;
/// HTTP gateway.
pub mod http;
/// Static identity provider.
pub mod identity;
/// Gateway over an in-process store.
pub mod in_process;
/// Recording gateway for tests.
#[cfg(test)]
pub mod testing;

use std::{future::Future, time::Duration};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::dto::progress::{SaveProgressRequest, Snapshot};

pub use error::{GatewayError, GatewayResult};
pub use http::HttpGateway;
pub use identity::StaticIdentity;
pub use in_process::InProcessGateway;

/// User the progress belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    /// Contact email, when known.
    pub email: Option<String>,
}

impl Identity {
    /// Identity of `user_id` without an email.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
        }
    }

    /// Attach a contact email.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Identity plus the bearer token authorising a remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User the token belongs to.
    pub identity: Identity,
    /// Bearer token sent with every request.
    pub token: String,
}

/// External identity collaborator.
pub trait IdentityProvider: Send + Sync {
    /// Currently signed-in user, if any.
    fn current_user(&self) -> Option<Identity>;
    /// Obtain a bearer token; `None` means local-only mode.
    fn bearer_token(&self) -> BoxFuture<'static, Option<String>>;
    /// Forced sign-out side channel used by the session timeout.
    fn sign_out(&self) -> BoxFuture<'static, ()>;
}

/// Remote load/save of activity snapshots.
pub trait PersistenceGateway: Send + Sync {
    /// Latest snapshot for `activity_type`; `Ok(None)` signals a first run.
    fn load(
        &self,
        credentials: &Credentials,
        activity_type: &str,
    ) -> BoxFuture<'static, GatewayResult<Option<Snapshot>>>;
    /// Upsert a save and return the snapshot computed by the remote store.
    fn save(
        &self,
        credentials: &Credentials,
        request: SaveProgressRequest,
    ) -> BoxFuture<'static, GatewayResult<Snapshot>>;
    /// Past snapshots for display, newest first.
    fn history(
        &self,
        credentials: &Credentials,
        activity_type: &str,
    ) -> BoxFuture<'static, GatewayResult<Vec<Snapshot>>>;
}

/// Resolve the current user and a non-blank token, or `None` for local-only mode.
pub async fn credentials(identity: &dyn IdentityProvider) -> Option<Credentials> {
    let user = identity.current_user()?;
    let token = identity.bearer_token().await?;
    if token.trim().is_empty() {
        return None;
    }
    Some(Credentials {
        identity: user,
        token,
    })
}

/// Run a gateway call under a cancellation token and a deadline.
pub async fn guarded<T, F>(cancel: &CancellationToken, limit: Duration, work: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        outcome = tokio::time::timeout(limit, work) => {
            outcome.unwrap_or(Err(GatewayError::Timeout(limit)))
        }
    }
}
