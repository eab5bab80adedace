use std::{
    future::ready,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use futures::future::BoxFuture;
use tracing::info;

use super::{Identity, IdentityProvider};

/// Identity collaborator holding a fixed user and token, e.g. read from the environment.
///
/// Signing out forgets the token, which switches every later save to local-only mode.
#[derive(Clone, Default)]
pub struct StaticIdentity {
    inner: Arc<StaticIdentityInner>,
}

#[derive(Default)]
struct StaticIdentityInner {
    user: Mutex<Option<Identity>>,
    token: Mutex<Option<String>>,
    sign_outs: AtomicUsize,
}

impl StaticIdentity {
    /// Signed-in `user` holding `token`.
    pub fn new(user: Identity, token: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StaticIdentityInner {
                user: Mutex::new(Some(user)),
                token: Mutex::new(Some(token.into())),
                sign_outs: AtomicUsize::new(0),
            }),
        }
    }

    /// Signed-in user without a token: saves stay local.
    pub fn without_token(user: Identity) -> Self {
        Self {
            inner: Arc::new(StaticIdentityInner {
                user: Mutex::new(Some(user)),
                token: Mutex::new(None),
                sign_outs: AtomicUsize::new(0),
            }),
        }
    }

    /// Nobody signed in.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Replace (or drop) the bearer token, e.g. after a refresh.
    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut slot) = self.inner.token.lock() {
            *slot = token;
        }
    }

    /// How many times the sign-out side channel was invoked.
    pub fn sign_out_count(&self) -> usize {
        self.inner.sign_outs.load(Ordering::SeqCst)
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<Identity> {
        self.inner.user.lock().ok().and_then(|user| user.clone())
    }

    fn bearer_token(&self) -> BoxFuture<'static, Option<String>> {
        let token = self.inner.token.lock().ok().and_then(|token| token.clone());
        Box::pin(ready(token))
    }

    fn sign_out(&self) -> BoxFuture<'static, ()> {
        self.inner.sign_outs.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut token) = self.inner.token.lock() {
            token.take();
        }
        let user = self.inner.user.lock().ok().and_then(|mut user| user.take());
        if let Some(user) = user {
            info!(user_id = %user.user_id, "signed out");
        }
        Box::pin(ready(()))
    }
}
