//! Client-side progress engine: wires the session clock, autosave scheduler, local cache,
//! conflict resolver and session timeout around one activity.

use std::sync::Arc;

use serde_json::Value;
use time::OffsetDateTime;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::EngineConfig,
    dao::{
        local_cache::{CacheResult, LocalCache},
        models::LocalCacheRecord,
    },
    dto::progress::Snapshot,
    gateway::{
        GatewayError, GatewayResult, IdentityProvider, PersistenceGateway, credentials, guarded,
    },
    services::{
        active_tasks::{self, ActiveTaskRecord},
        conflict_resolver::{ConflictResolver, Resolution, read_cache},
    },
    state::{
        events::{SyncEvent, SyncEventHub},
        scheduler::{self, FlushOutcome, SchedulerError, SchedulerHandle, SchedulerParams},
        session_clock::SessionClock,
        session_timeout::{self, ActivityKind, SessionTimeoutError, SessionTimeoutHandle},
    },
};

/// Where the live snapshot came from at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationSource {
    /// Latest remote snapshot.
    Remote,
    /// Local cache record (remote unreachable, empty or no token).
    Cache,
    /// First run: the caller's default state.
    Default,
}

/// Progress engine bound to one activity.
pub struct ProgressEngine {
    activity_type: String,
    gateway: Arc<dyn PersistenceGateway>,
    identity: Arc<dyn IdentityProvider>,
    cache: LocalCache,
    resolver: ConflictResolver,
    clock: SessionClock,
    scheduler: SchedulerHandle,
    session: SessionTimeoutHandle,
    events: SyncEventHub,
    hydrated_from: HydrationSource,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    config: EngineConfig,
}

impl ProgressEngine {
    /// Hydrate `activity_type` and start every timer.
    ///
    /// The live snapshot is the remote one when it exists, else the cached record, else
    /// `default_state`. Hydration failures are logged and never prevent the engine from
    /// starting.
    pub async fn start(
        activity_type: impl Into<String>,
        default_state: Value,
        config: EngineConfig,
        gateway: Arc<dyn PersistenceGateway>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let activity_type = activity_type.into();
        let cancel = CancellationToken::new();
        let cache = LocalCache::new(&config.cache_dir, config.storage_key(&activity_type));

        let (initial, hydrated_from) = hydrate(
            &activity_type,
            default_state,
            gateway.as_ref(),
            identity.as_ref(),
            &cache,
            &config,
            &cancel,
        )
        .await;
        info!(
            activity_type = %activity_type,
            source = ?hydrated_from,
            version = initial.version,
            total_elapsed_time = initial.total_elapsed_time,
            "progress hydrated"
        );

        let events = SyncEventHub::default();
        let clock = SessionClock::start(config.clock_tick, cancel.child_token());
        let (scheduler, scheduler_task) = scheduler::spawn(SchedulerParams {
            activity_type: activity_type.clone(),
            initial,
            config: config.scheduler(),
            gateway: gateway.clone(),
            identity: identity.clone(),
            clock: clock.clone(),
            cache: Some(cache.clone()),
            events: events.clone(),
            cancel: cancel.child_token(),
        });
        let (session, session_task) = session_timeout::spawn(
            config.session_timeout(),
            identity.clone(),
            cancel.child_token(),
        );
        let resolver = ConflictResolver::new(
            activity_type.clone(),
            gateway.clone(),
            identity.clone(),
            cache.clone(),
            config.request_timeout,
        );

        Self {
            activity_type,
            gateway,
            identity,
            cache,
            resolver,
            clock,
            scheduler,
            session,
            events,
            hydrated_from,
            cancel,
            tasks: vec![scheduler_task, session_task],
            config,
        }
    }

    /// Activity this engine persists.
    pub fn activity_type(&self) -> &str {
        &self.activity_type
    }

    /// Source of the startup snapshot.
    pub fn hydrated_from(&self) -> HydrationSource {
        self.hydrated_from
    }

    /// Live snapshot, including unsaved mutations.
    pub fn snapshot(&self) -> Snapshot {
        self.scheduler.snapshot()
    }

    /// Replace the whole activity state.
    pub fn mark_changed(&self, state: Value) -> Result<(), SchedulerError> {
        self.scheduler.mark_changed(state)
    }

    /// Derive the next activity state from the latest one.
    pub fn dispatch<F>(&self, reducer: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(&Value) -> Value + Send + 'static,
    {
        self.scheduler.dispatch(reducer)
    }

    /// Manual save through the serialized flush path.
    pub async fn save_now(&self) -> Result<FlushOutcome, SchedulerError> {
        self.scheduler.flush().await
    }

    /// Manual "save locally": write the live snapshot to the local cache.
    pub async fn save_locally(&self) -> CacheResult<LocalCacheRecord> {
        let record = LocalCacheRecord::capture(
            &self.snapshot(),
            self.clock.elapsed_secs(),
            OffsetDateTime::now_utc(),
        );
        self.cache.write(&record).await?;
        info!(activity_type = %self.activity_type, "progress saved locally");
        Ok(record)
    }

    /// Reconcile the local cache with the remote store, then adopt the winning copy.
    pub async fn resolve_conflicts(&self) -> GatewayResult<Resolution> {
        let resolution = self.resolver.resolve(&self.cancel).await?;
        if let Some(snapshot) = resolution.snapshot() {
            self.scheduler
                .hydrate(snapshot.clone())
                .map_err(|_| GatewayError::Cancelled)?;
        }
        Ok(resolution)
    }

    /// Unfinished tasks of the live snapshot, at most one per task type.
    pub fn active_tasks(&self) -> Vec<ActiveTaskRecord> {
        active_tasks::dedupe_by_type(active_tasks::extract(&self.snapshot()))
    }

    /// Past remote snapshots of this activity, newest first.
    pub async fn history(&self) -> GatewayResult<Vec<Snapshot>> {
        let Some(credentials) = credentials(self.identity.as_ref()).await else {
            return Err(GatewayError::AuthMissing);
        };
        guarded(
            &self.cancel,
            self.config.request_timeout,
            self.gateway.history(&credentials, &self.activity_type),
        )
        .await
    }

    /// Report user activity to the session timeout.
    pub fn record_activity(&self, kind: ActivityKind) -> Result<(), SessionTimeoutError> {
        self.session.record_activity(kind)
    }

    /// Autosave scheduler handle.
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Session timeout handle.
    pub fn session(&self) -> &SessionTimeoutHandle {
        &self.session
    }

    /// Session clock.
    pub fn clock(&self) -> &SessionClock {
        &self.clock
    }

    /// Receive save notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Flush dirty state once, then stop every timer and in-flight call.
    pub async fn shutdown(self) {
        if let Err(err) = self.scheduler.shutdown().await {
            warn!(activity_type = %self.activity_type, error = %err, "scheduler already stopped");
        }
        self.session.dispose();
        self.clock.stop();
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "engine task ended abnormally");
            }
        }
        info!(activity_type = %self.activity_type, "progress engine stopped");
    }
}

async fn hydrate(
    activity_type: &str,
    default_state: Value,
    gateway: &dyn PersistenceGateway,
    identity: &dyn IdentityProvider,
    cache: &LocalCache,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> (Snapshot, HydrationSource) {
    if let Some(credentials) = credentials(identity).await {
        match guarded(
            cancel,
            config.request_timeout,
            gateway.load(&credentials, activity_type),
        )
        .await
        {
            Ok(Some(snapshot)) => return (snapshot, HydrationSource::Remote),
            Ok(None) => info!(activity_type, "no remote progress yet"),
            Err(err) => warn!(activity_type, error = %err, "failed to load remote progress"),
        }
    }

    match read_cache(cache).await {
        Some(record) => (record.into_snapshot(activity_type), HydrationSource::Cache),
        None => (
            Snapshot::initial(activity_type, default_state),
            HydrationSource::Default,
        ),
    }
}
