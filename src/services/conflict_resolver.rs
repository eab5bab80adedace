//! Last-write-wins reconciliation between the local cache record and the remote snapshot.
//!
//! Runs on demand only. The comparison is whole-snapshot: the cache's `cachedAt` against the
//! remote `savedAt`. A strictly newer cache is pushed; anything else pulls the remote copy
//! into the cache.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    dao::{
        local_cache::{CacheError, LocalCache},
        models::LocalCacheRecord,
    },
    dto::progress::{SaveProgressRequest, Snapshot},
    gateway::{
        Credentials, GatewayResult, IdentityProvider, PersistenceGateway, credentials, guarded,
    },
};

/// What the resolver did.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Neither copy exists.
    NothingToDo,
    /// The remote copy won and was written to the cache.
    Pulled(Snapshot),
    /// The cached copy won and was saved remotely; carries the resulting snapshot.
    Pushed(Snapshot),
    /// No token; nothing was compared.
    LocalOnly,
}

impl Resolution {
    /// Snapshot the live state should be replaced with, if any.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            Resolution::Pulled(snapshot) | Resolution::Pushed(snapshot) => Some(snapshot),
            Resolution::NothingToDo | Resolution::LocalOnly => None,
        }
    }
}

/// Reconciles one activity's cache record with its remote snapshot.
#[derive(Clone)]
pub struct ConflictResolver {
    activity_type: String,
    gateway: Arc<dyn PersistenceGateway>,
    identity: Arc<dyn IdentityProvider>,
    cache: LocalCache,
    request_timeout: Duration,
}

impl ConflictResolver {
    /// Resolver for `activity_type` between `cache` and `gateway`.
    pub fn new(
        activity_type: impl Into<String>,
        gateway: Arc<dyn PersistenceGateway>,
        identity: Arc<dyn IdentityProvider>,
        cache: LocalCache,
        request_timeout: Duration,
    ) -> Self {
        Self {
            activity_type: activity_type.into(),
            gateway,
            identity,
            cache,
            request_timeout,
        }
    }

    /// Compare both copies and copy the newer one over the older one.
    pub async fn resolve(&self, cancel: &CancellationToken) -> GatewayResult<Resolution> {
        let Some(credentials) = credentials(self.identity.as_ref()).await else {
            info!(activity_type = %self.activity_type, "no bearer token; skipping conflict resolution");
            return Ok(Resolution::LocalOnly);
        };

        let local = read_cache(&self.cache).await;
        let remote = guarded(
            cancel,
            self.request_timeout,
            self.gateway.load(&credentials, &self.activity_type),
        )
        .await?;

        let resolution = match (local, remote) {
            (None, None) => Resolution::NothingToDo,
            (None, Some(remote)) => self.pull(remote).await,
            (Some(local), Some(remote)) if local.cached_at <= remote.saved_at => {
                self.pull(remote).await
            }
            (Some(local), _) => self.push(&credentials, local, cancel).await?,
        };

        match &resolution {
            Resolution::Pulled(snapshot) => info!(
                activity_type = %self.activity_type,
                version = snapshot.version,
                "conflict resolved: remote copy wins"
            ),
            Resolution::Pushed(snapshot) => info!(
                activity_type = %self.activity_type,
                version = snapshot.version,
                "conflict resolved: local copy wins"
            ),
            Resolution::NothingToDo | Resolution::LocalOnly => {}
        }
        Ok(resolution)
    }

    async fn pull(&self, remote: Snapshot) -> Resolution {
        self.mirror(&remote).await;
        Resolution::Pulled(remote)
    }

    async fn push(
        &self,
        credentials: &Credentials,
        local: LocalCacheRecord,
        cancel: &CancellationToken,
    ) -> GatewayResult<Resolution> {
        // The cached session seconds were credited by whichever process wrote them.
        let request = SaveProgressRequest::new(self.activity_type.clone(), local.state, 0);
        let saved = guarded(
            cancel,
            self.request_timeout,
            self.gateway.save(credentials, request),
        )
        .await?;
        self.mirror(&saved).await;
        Ok(Resolution::Pushed(saved))
    }

    async fn mirror(&self, snapshot: &Snapshot) {
        if let Err(err) = self.cache.write(&LocalCacheRecord::mirror(snapshot)).await {
            warn!(storage_key = %self.cache.storage_key(), error = %err, "failed to mirror snapshot into local cache");
        }
    }
}

/// Read the cache record; unreadable or corrupt records count as absent.
pub async fn read_cache(cache: &LocalCache) -> Option<LocalCacheRecord> {
    match cache.read().await {
        Ok(record) => record,
        Err(err @ CacheError::Corrupt { .. }) => {
            warn!(storage_key = %cache.storage_key(), error = %err, "local cache record is corrupt; ignoring it");
            None
        }
        Err(err) => {
            warn!(storage_key = %cache.storage_key(), error = %err, "failed to read local cache");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::OffsetDateTime;

    use super::*;
    use crate::gateway::{Identity, StaticIdentity, testing::RecordingGateway};

    struct Fixture {
        resolver: ConflictResolver,
        gateway: RecordingGateway,
        cache: LocalCache,
        credentials: Credentials,
        _dir: tempfile::TempDir,
    }

    fn fixture(identity: StaticIdentity) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), "progress::quiz");
        let gateway = RecordingGateway::new();
        let resolver = ConflictResolver::new(
            "quiz",
            Arc::new(gateway.clone()),
            Arc::new(identity),
            cache.clone(),
            Duration::from_secs(5),
        );
        Fixture {
            resolver,
            gateway,
            cache,
            credentials: Credentials {
                identity: Identity::new("ada"),
                token: "token".into(),
            },
            _dir: dir,
        }
    }

    fn signed_in() -> StaticIdentity {
        StaticIdentity::new(Identity::new("ada"), "token")
    }

    #[tokio::test]
    async fn newer_cache_is_pushed_to_remote() {
        let f = fixture(signed_in());
        let remote = f
            .gateway
            .backend()
            .save(&f.credentials, SaveProgressRequest::new("quiz", json!({"score": 1}), 30))
            .await
            .unwrap();
        f.cache
            .write(&LocalCacheRecord {
                state: json!({"score": 9}),
                cached_at: remote.saved_at + time::Duration::seconds(10),
                total_elapsed_time: 30,
                session_elapsed_time: 0,
            })
            .await
            .unwrap();

        let resolution = f.resolver.resolve(&CancellationToken::new()).await.unwrap();

        let Resolution::Pushed(pushed) = resolution else {
            panic!("expected the local copy to win, got {resolution:?}");
        };
        assert_eq!(pushed.state, json!({"score": 9}));
        assert_eq!(pushed.total_elapsed_time, 30);
        let stored = f.gateway.backend().load(&f.credentials, "quiz").await.unwrap().unwrap();
        assert_eq!(stored.state, json!({"score": 9}));
        assert_eq!(f.gateway.saves().last().unwrap().session_elapsed_time, 0);

        let mirrored = f.cache.read().await.unwrap().unwrap();
        assert_eq!(mirrored.cached_at, pushed.saved_at);
    }

    #[tokio::test]
    async fn older_or_equal_cache_pulls_remote() {
        let f = fixture(signed_in());
        let remote = f
            .gateway
            .backend()
            .save(&f.credentials, SaveProgressRequest::new("quiz", json!({"score": 5}), 10))
            .await
            .unwrap();
        f.cache
            .write(&LocalCacheRecord {
                state: json!({"score": 2}),
                cached_at: remote.saved_at,
                total_elapsed_time: 0,
                session_elapsed_time: 0,
            })
            .await
            .unwrap();

        let resolution = f.resolver.resolve(&CancellationToken::new()).await.unwrap();

        assert_eq!(resolution, Resolution::Pulled(remote.clone()));
        assert_eq!(f.cache.read().await.unwrap().unwrap().state, json!({"score": 5}));
        assert_eq!(f.gateway.save_count(), 0);
    }

    #[tokio::test]
    async fn cache_without_remote_is_pushed() {
        let f = fixture(signed_in());
        f.cache
            .write(&LocalCacheRecord {
                state: json!({"score": 3}),
                cached_at: OffsetDateTime::now_utc(),
                total_elapsed_time: 0,
                session_elapsed_time: 0,
            })
            .await
            .unwrap();

        let resolution = f.resolver.resolve(&CancellationToken::new()).await.unwrap();
        assert!(matches!(resolution, Resolution::Pushed(ref s) if s.version == 1));
    }

    #[tokio::test]
    async fn nothing_on_either_side() {
        let f = fixture(signed_in());
        let resolution = f.resolver.resolve(&CancellationToken::new()).await.unwrap();
        assert_eq!(resolution, Resolution::NothingToDo);
        assert!(resolution.snapshot().is_none());
    }

    #[tokio::test]
    async fn corrupt_cache_counts_as_absent() {
        let f = fixture(signed_in());
        tokio::fs::write(f.cache.path(), b"{ definitely not json").await.unwrap();
        let remote = f
            .gateway
            .backend()
            .save(&f.credentials, SaveProgressRequest::new("quiz", json!({"score": 4}), 10))
            .await
            .unwrap();

        let resolution = f.resolver.resolve(&CancellationToken::new()).await.unwrap();
        assert_eq!(resolution, Resolution::Pulled(remote));
        assert_eq!(f.cache.read().await.unwrap().unwrap().state, json!({"score": 4}));
    }

    #[tokio::test]
    async fn without_token_nothing_is_compared() {
        let f = fixture(StaticIdentity::without_token(Identity::new("ada")));
        let resolution = f.resolver.resolve(&CancellationToken::new()).await.unwrap();
        assert_eq!(resolution, Resolution::LocalOnly);
        assert_eq!(f.gateway.load_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_remote_surfaces_error() {
        let f = fixture(signed_in());
        f.gateway.set_failing(true);
        assert!(f.resolver.resolve(&CancellationToken::new()).await.is_err());
    }
}
