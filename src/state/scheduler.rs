//! Autosave scheduler.
//!
//! The scheduler is a single task owning the live snapshot. Every mutation, from whichever
//! call site, goes through its command queue, so a reducer always sees the latest state and
//! no caller can overwrite another one from a stale copy.
//!
//! Flush policy:
//! - a mutation arriving less than `min_flush_interval` after the last successful flush
//!   (re)arms a debounce timer for `autosave_interval`; bursts collapse into one write;
//! - otherwise the pending snapshot is flushed right away;
//! - at most one flush is in flight. A request arriving meanwhile is replayed with the newest
//!   pending state once the in-flight flush resolves;
//! - a missing token leaves the snapshot dirty without recording an error (local-only);
//! - a failed flush records the error and leaves the snapshot dirty, but the in-memory state
//!   is never rolled back.

use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, sleep_until, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    dao::{local_cache::LocalCache, models::LocalCacheRecord},
    dto::progress::{SaveProgressRequest, Snapshot},
    gateway::{
        GatewayError, GatewayResult, IdentityProvider, PersistenceGateway, credentials, guarded,
    },
    state::{
        events::{SyncEvent, SyncEventHub},
        session_clock::SessionClock,
    },
};

/// Timing knobs of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Mutations closer than this to the last flush are debounced.
    pub min_flush_interval: Duration,
    /// Debounce delay applied to write-hot mutations.
    pub autosave_interval: Duration,
    /// Upper bound of a single remote save.
    pub request_timeout: Duration,
    /// Upper bound of the teardown flush.
    pub shutdown_flush_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_flush_interval: Duration::from_secs(5),
            autosave_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            shutdown_flush_timeout: Duration::from_secs(5),
        }
    }
}

/// Observable scheduler state.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerState {
    /// Live snapshot shown to the UI, including unsaved mutations.
    pub current: Snapshot,
    /// Snapshot waiting to be flushed; `Some` exactly when the state is dirty.
    pub pending: Option<Snapshot>,
    /// Whether a flush is in flight.
    pub saving: bool,
    /// Instant of the last successful flush (scheduler start before the first one).
    pub last_flush_at: Instant,
    /// Last flush failure, cleared by the next success.
    pub last_error: Option<String>,
    /// Whether the last flush attempt found no token.
    pub local_only: bool,
}

impl SchedulerState {
    /// Whether unsaved mutations exist.
    pub fn dirty(&self) -> bool {
        self.pending.is_some()
    }
}

/// Result of an explicit flush request.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// The remote store acknowledged the snapshot.
    Saved(Snapshot),
    /// Nothing was pending.
    Clean,
    /// No token; the snapshot stays in memory.
    LocalOnly,
    /// The save failed; the snapshot stays pending.
    Failed(String),
    /// The scheduler was disposed before the save resolved.
    Cancelled,
}

/// Errors returned by [`SchedulerHandle`] once the scheduler task is gone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The scheduler task has stopped.
    #[error("autosave scheduler has shut down")]
    Closed,
}

type Reducer = Box<dyn FnOnce(&Value) -> Value + Send>;

enum Command {
    Replace(Value),
    Dispatch(Reducer),
    Hydrate(Snapshot),
    Flush(oneshot::Sender<FlushOutcome>),
    Shutdown(oneshot::Sender<()>),
}

/// Collaborators and settings needed to start a scheduler.
pub struct SchedulerParams {
    /// Activity being persisted.
    pub activity_type: String,
    /// Hydrated snapshot to start from.
    pub initial: Snapshot,
    /// Timing knobs.
    pub config: SchedulerConfig,
    /// Remote store.
    pub gateway: Arc<dyn PersistenceGateway>,
    /// Token source.
    pub identity: Arc<dyn IdentityProvider>,
    /// Session clock whose seconds are credited on save.
    pub clock: SessionClock,
    /// Cache refreshed after each successful flush.
    pub cache: Option<LocalCache>,
    /// Where save notifications go.
    pub events: SyncEventHub,
    /// Disposes the scheduler when cancelled.
    pub cancel: CancellationToken,
}

/// Cloneable handle used by every call site to reach the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SchedulerState>,
    events: SyncEventHub,
}

impl SchedulerHandle {
    /// Replace the whole state and mark it dirty. Callers pass a fully-formed next state.
    pub fn mark_changed(&self, state: Value) -> Result<(), SchedulerError> {
        self.send(Command::Replace(state))
    }

    /// Derive the next state from the latest one inside the scheduler and mark it dirty.
    pub fn dispatch<F>(&self, reducer: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(&Value) -> Value + Send + 'static,
    {
        self.send(Command::Dispatch(Box::new(reducer)))
    }

    /// Replace the live snapshot with an authoritative copy, discarding pending mutations.
    pub fn hydrate(&self, snapshot: Snapshot) -> Result<(), SchedulerError> {
        self.send(Command::Hydrate(snapshot))
    }

    /// Flush now (manual save), through the same serialized path as autosaves.
    pub async fn flush(&self) -> Result<FlushOutcome, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush(tx))?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }

    /// Attempt a final flush of dirty state, then stop every timer.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }

    /// Copy of the current scheduler state.
    pub fn state(&self) -> SchedulerState {
        self.state.borrow().clone()
    }

    /// Live snapshot as seen by the UI.
    pub fn snapshot(&self) -> Snapshot {
        self.state.borrow().current.clone()
    }

    /// Observe scheduler state changes.
    pub fn watch(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    /// Receive save notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.commands
            .send(command)
            .map_err(|_| SchedulerError::Closed)
    }
}

/// Spawn the scheduler task.
pub fn spawn(params: SchedulerParams) -> (SchedulerHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let mut current = params.initial;
    current.session_elapsed_time = params.clock.elapsed_secs();
    let state = SchedulerState {
        current,
        pending: None,
        saving: false,
        last_flush_at: Instant::now(),
        last_error: None,
        local_only: false,
    };
    let (state_tx, state_rx) = watch::channel(state.clone());

    let task = SchedulerTask {
        activity_type: params.activity_type,
        config: params.config,
        gateway: params.gateway,
        identity: params.identity,
        clock: params.clock,
        cache: params.cache,
        events: params.events.clone(),
        cancel: params.cancel,
        commands: commands_rx,
        state,
        state_tx,
        revision: 0,
        credited_secs: 0,
        timers: FlushTimers::default(),
        in_flight: None,
        replay_requested: false,
        waiters: Vec::new(),
    };

    let join = tokio::spawn(task.run());
    let handle = SchedulerHandle {
        commands: commands_tx,
        state: state_rx,
        events: params.events,
    };
    (handle, join)
}

/// Timer table of the scheduler. Cleared wholesale on teardown.
#[derive(Debug, Default)]
struct FlushTimers {
    debounce: Option<Instant>,
}

impl FlushTimers {
    fn arm_debounce(&mut self, at: Instant) {
        self.debounce = Some(at);
    }

    fn cancel_debounce(&mut self) {
        self.debounce = None;
    }

    fn clear(&mut self) {
        self.debounce = None;
    }
}

struct InFlight {
    revision: u64,
    session_secs: u64,
    cancel: CancellationToken,
    future: BoxFuture<'static, GatewayResult<Snapshot>>,
    waiters: Vec<oneshot::Sender<FlushOutcome>>,
}

struct Completed {
    revision: u64,
    session_secs: u64,
    result: GatewayResult<Snapshot>,
}

struct SchedulerTask {
    activity_type: String,
    config: SchedulerConfig,
    gateway: Arc<dyn PersistenceGateway>,
    identity: Arc<dyn IdentityProvider>,
    clock: SessionClock,
    cache: Option<LocalCache>,
    events: SyncEventHub,
    cancel: CancellationToken,
    commands: mpsc::UnboundedReceiver<Command>,
    state: SchedulerState,
    state_tx: watch::Sender<SchedulerState>,
    /// Bumped by every mutation; a flush only clears `pending` if no newer one arrived.
    revision: u64,
    /// Session seconds already added to the remote total by this process.
    credited_secs: u64,
    timers: FlushTimers,
    in_flight: Option<InFlight>,
    replay_requested: bool,
    /// Callers waiting for the next flush to resolve.
    waiters: Vec<oneshot::Sender<FlushOutcome>>,
}

impl SchedulerTask {
    async fn run(mut self) {
        let mut shutdown_ack = None;
        loop {
            let debounce_at = self.timers.debounce;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.teardown().await;
                        break;
                    };
                    if let Some(ack) = self.handle(command) {
                        self.teardown().await;
                        shutdown_ack = Some(ack);
                        break;
                    }
                }
                completed = wait_in_flight(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.complete(completed).await;
                }
                _ = sleep_until(debounce_at.unwrap_or_else(Instant::now)), if debounce_at.is_some() => {
                    self.timers.cancel_debounce();
                    debug!(activity_type = %self.activity_type, "debounce window elapsed");
                    self.request_flush();
                }
            }
        }

        self.dispose();
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    /// Apply one command; returns the acknowledgement channel when the command asks to stop.
    fn handle(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Replace(next) => self.apply_mutation(next),
            Command::Dispatch(reducer) => {
                let next = reducer(&self.state.current.state);
                self.apply_mutation(next);
            }
            Command::Hydrate(mut snapshot) => {
                snapshot.session_elapsed_time = self.clock.elapsed_secs();
                self.revision += 1;
                self.timers.cancel_debounce();
                if self.abandon_in_flight(FlushOutcome::Cancelled) {
                    debug!(activity_type = %self.activity_type, "in-flight flush superseded by hydration");
                }
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(FlushOutcome::Clean);
                }
                self.state.current = snapshot.clone();
                self.state.pending = None;
                self.publish();
                self.events.broadcast(SyncEvent::Hydrated(snapshot));
            }
            Command::Flush(waiter) => {
                self.timers.cancel_debounce();
                self.waiters.push(waiter);
                self.request_flush();
            }
            Command::Shutdown(ack) => return Some(ack),
        }
        None
    }

    fn apply_mutation(&mut self, next: Value) {
        self.revision += 1;
        self.state.current.state = next;
        self.state.pending = Some(self.state.current.clone());
        self.publish();

        let now = Instant::now();
        let since_last_flush = now.saturating_duration_since(self.state.last_flush_at);
        if since_last_flush < self.config.min_flush_interval {
            let at = now + self.config.autosave_interval;
            self.timers.arm_debounce(at);
            debug!(
                activity_type = %self.activity_type,
                delay_ms = self.config.autosave_interval.as_millis() as u64,
                "write-hot mutation; debounce armed"
            );
        } else {
            self.timers.cancel_debounce();
            self.request_flush();
        }
    }

    /// Start a flush, or queue a replay if one is already in flight.
    fn request_flush(&mut self) {
        if self.in_flight.is_some() {
            self.replay_requested = true;
            return;
        }

        let Some(pending) = self.state.pending.clone() else {
            for waiter in self.waiters.drain(..) {
                let _ = waiter.send(FlushOutcome::Clean);
            }
            return;
        };

        let session_secs = self
            .clock
            .elapsed_secs()
            .saturating_sub(self.credited_secs);
        let request = SaveProgressRequest::new(self.activity_type.clone(), pending.state, session_secs);
        let cancel = self.cancel.child_token();
        let future = save_with_credentials(
            self.gateway.clone(),
            self.identity.clone(),
            request,
            cancel.clone(),
            self.config.request_timeout,
        );

        debug!(
            activity_type = %self.activity_type,
            revision = self.revision,
            session_secs,
            "flush issued"
        );
        self.in_flight = Some(InFlight {
            revision: self.revision,
            session_secs,
            cancel,
            future,
            waiters: std::mem::take(&mut self.waiters),
        });
        self.state.saving = true;
        self.publish();
    }

    async fn complete(&mut self, completed: Completed) {
        let waiters = self
            .in_flight
            .take()
            .map(|flight| flight.waiters)
            .unwrap_or_default();
        self.state.saving = false;

        let outcome = match completed.result {
            Ok(snapshot) => {
                self.state.last_flush_at = Instant::now();
                self.state.last_error = None;
                self.state.local_only = false;
                self.credited_secs = self.credited_secs.saturating_add(completed.session_secs);
                if completed.revision == self.revision {
                    self.state.pending = None;
                }
                self.state.current.total_elapsed_time = snapshot.total_elapsed_time;
                self.state.current.session_elapsed_time = self.clock.elapsed_secs();
                self.state.current.saved_at = snapshot.saved_at;
                self.state.current.version = snapshot.version;

                info!(
                    activity_type = %self.activity_type,
                    version = snapshot.version,
                    total_elapsed_time = snapshot.total_elapsed_time,
                    "progress saved"
                );
                let record = LocalCacheRecord::capture(
                    &snapshot,
                    self.state.current.session_elapsed_time,
                    snapshot.saved_at,
                );
                refresh_cache(self.cache.clone(), record).await;
                self.events.broadcast(SyncEvent::Saved(snapshot.clone()));
                FlushOutcome::Saved(snapshot)
            }
            Err(GatewayError::AuthMissing) => {
                self.state.local_only = true;
                debug!(activity_type = %self.activity_type, "no bearer token; keeping progress local");
                self.events.broadcast(SyncEvent::LocalOnly {
                    activity_type: self.activity_type.clone(),
                });
                FlushOutcome::LocalOnly
            }
            Err(GatewayError::Cancelled) => FlushOutcome::Cancelled,
            Err(err) => {
                let message = err.to_string();
                warn!(activity_type = %self.activity_type, error = %err, "progress save failed; will retry");
                self.state.last_error = Some(message.clone());
                self.events.broadcast(SyncEvent::SaveFailed {
                    activity_type: self.activity_type.clone(),
                    message: message.clone(),
                });
                FlushOutcome::Failed(message)
            }
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        self.publish();

        let replay = std::mem::take(&mut self.replay_requested);
        if replay && self.state.pending.is_some() {
            self.request_flush();
        } else {
            for waiter in self.waiters.drain(..) {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    /// Let an in-flight flush finish, then make one attempt for anything still dirty, all
    /// bounded by `shutdown_flush_timeout`.
    async fn teardown(&mut self) {
        self.timers.clear();
        let deadline = Instant::now() + self.config.shutdown_flush_timeout;

        let drained = timeout_at(deadline, async {
            if self.in_flight.is_some() {
                let completed = wait_in_flight(&mut self.in_flight).await;
                self.complete(completed).await;
            }
            if self.state.dirty() && self.in_flight.is_none() {
                self.replay_requested = false;
                self.request_flush();
            }
            if self.in_flight.is_some() {
                let completed = wait_in_flight(&mut self.in_flight).await;
                self.complete(completed).await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(activity_type = %self.activity_type, "teardown flush did not finish in time");
        }
    }

    /// Cancel everything still pending; no callback fires after this.
    fn dispose(&mut self) {
        self.timers.clear();
        self.abandon_in_flight(FlushOutcome::Cancelled);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(FlushOutcome::Cancelled);
        }
        self.publish();
    }

    /// Cancel and drop the in-flight flush so its result is never applied. Returns whether
    /// one was in flight.
    fn abandon_in_flight(&mut self, outcome: FlushOutcome) -> bool {
        self.replay_requested = false;
        let Some(flight) = self.in_flight.take() else {
            return false;
        };
        flight.cancel.cancel();
        for waiter in flight.waiters {
            let _ = waiter.send(outcome.clone());
        }
        self.state.saving = false;
        true
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }
}

/// Write the record of a saved snapshot to the local cache.
async fn refresh_cache(cache: Option<LocalCache>, record: LocalCacheRecord) {
    let Some(cache) = cache else {
        return;
    };
    if let Err(err) = cache.write(&record).await {
        warn!(storage_key = %cache.storage_key(), error = %err, "failed to refresh local cache after save");
    }
}

async fn wait_in_flight(slot: &mut Option<InFlight>) -> Completed {
    match slot.as_mut() {
        Some(flight) => {
            let result = (&mut flight.future).await;
            Completed {
                revision: flight.revision,
                session_secs: flight.session_secs,
                result,
            }
        }
        None => std::future::pending().await,
    }
}

fn save_with_credentials(
    gateway: Arc<dyn PersistenceGateway>,
    identity: Arc<dyn IdentityProvider>,
    request: SaveProgressRequest,
    cancel: CancellationToken,
    limit: Duration,
) -> BoxFuture<'static, GatewayResult<Snapshot>> {
    Box::pin(async move {
        guarded(&cancel, limit, async move {
            let Some(credentials) = credentials(identity.as_ref()).await else {
                return Err(GatewayError::AuthMissing);
            };
            gateway.save(&credentials, request).await
        })
        .await
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::gateway::{Credentials, Identity, StaticIdentity, testing::RecordingGateway};

    const MIN_FLUSH: Duration = Duration::from_secs(5);
    const AUTOSAVE: Duration = Duration::from_secs(30);

    struct Harness {
        handle: SchedulerHandle,
        gateway: RecordingGateway,
        identity: StaticIdentity,
        cancel: CancellationToken,
        join: JoinHandle<()>,
    }

    fn start_with(identity: StaticIdentity, cache: Option<LocalCache>) -> Harness {
        let gateway = RecordingGateway::new();
        let cancel = CancellationToken::new();
        let clock = SessionClock::start(Duration::from_secs(1), cancel.child_token());
        let (handle, join) = spawn(SchedulerParams {
            activity_type: "quiz".into(),
            initial: Snapshot::initial("quiz", json!({"score": 0})),
            config: SchedulerConfig {
                min_flush_interval: MIN_FLUSH,
                autosave_interval: AUTOSAVE,
                request_timeout: Duration::from_secs(10),
                shutdown_flush_timeout: Duration::from_secs(5),
            },
            gateway: Arc::new(gateway.clone()),
            identity: Arc::new(identity.clone()),
            clock,
            cache,
            events: SyncEventHub::default(),
            cancel: cancel.clone(),
        });
        Harness {
            handle,
            gateway,
            identity,
            cancel,
            join,
        }
    }

    fn start() -> Harness {
        start_with(StaticIdentity::new(Identity::new("ada"), "token"), None)
    }

    /// Let every ready task run; paused time only advances once the runtime is idle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_mutations_coalesces_into_one_flush() {
        let h = start();

        for score in 1..=5 {
            h.handle.mark_changed(json!({ "score": score })).unwrap();
            tokio::time::sleep(Duration::from_millis(800)).await;
        }
        settle().await;
        assert_eq!(h.gateway.save_count(), 0);
        assert!(h.handle.state().dirty());

        tokio::time::sleep(AUTOSAVE).await;
        settle().await;

        let saves = h.gateway.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].state, json!({"score": 5}));
        let state = h.handle.state();
        assert!(!state.dirty());
        assert!(state.pending.is_none());
        assert_eq!(state.current.version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_after_quiet_period_flushes_immediately() {
        let h = start();
        tokio::time::sleep(MIN_FLUSH + Duration::from_secs(1)).await;

        h.handle.mark_changed(json!({"score": 7})).unwrap();
        settle().await;

        assert_eq!(h.gateway.save_count(), 1);
        assert_eq!(h.gateway.saves()[0].state, json!({"score": 7}));
        assert!(!h.handle.state().dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn reducer_sees_latest_state() {
        let h = start();
        for _ in 0..3 {
            h.handle
                .dispatch(|state| {
                    let score = state["score"].as_u64().unwrap_or(0);
                    json!({ "score": score + 1 })
                })
                .unwrap();
        }
        settle().await;
        assert_eq!(h.handle.snapshot().state, json!({"score": 3}));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_gateway_never_rolls_back_state() {
        let h = start();
        h.gateway.set_failing(true);
        let mut events = h.handle.subscribe();
        tokio::time::sleep(MIN_FLUSH).await;

        h.handle.mark_changed(json!({"score": 42})).unwrap();
        settle().await;

        let state = h.handle.state();
        assert_eq!(state.current.state, json!({"score": 42}));
        assert!(state.dirty());
        assert!(state.last_error.is_some());
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::SaveFailed { .. }
        ));

        h.gateway.set_failing(false);
        let outcome = h.handle.flush().await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Saved(_)));
        let state = h.handle.state();
        assert!(!state.dirty());
        assert!(state.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_token_keeps_state_dirty_without_error() {
        let h = start_with(StaticIdentity::without_token(Identity::new("ada")), None);
        tokio::time::sleep(MIN_FLUSH).await;

        h.handle.mark_changed(json!({"score": 1})).unwrap();
        let outcome = h.handle.flush().await.unwrap();

        assert_eq!(outcome, FlushOutcome::LocalOnly);
        let state = h.handle.state();
        assert!(state.dirty());
        assert!(state.local_only);
        assert!(state.last_error.is_none());
        assert_eq!(h.gateway.save_count(), 0);

        h.identity.set_token(Some("token".into()));
        assert!(matches!(
            h.handle.flush().await.unwrap(),
            FlushOutcome::Saved(_)
        ));
        assert!(!h.handle.state().local_only);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_flushes_are_serialized_and_last_wins() {
        let h = start();
        h.gateway.set_save_delay(Duration::from_secs(8));
        tokio::time::sleep(MIN_FLUSH).await;

        h.handle.mark_changed(json!({"score": 1})).unwrap();
        settle().await;
        assert!(h.handle.state().saving);

        h.handle.mark_changed(json!({"score": 2})).unwrap();
        let second = h.handle.flush();
        h.handle.mark_changed(json!({"score": 3})).unwrap();
        let outcome = second.await.unwrap();

        let saves = h.gateway.saves();
        assert_eq!(saves.len(), 2);
        assert_eq!(saves[0].state, json!({"score": 1}));
        assert_eq!(saves[1].state, json!({"score": 3}));
        assert_eq!(h.gateway.max_concurrent_saves(), 1);
        match outcome {
            FlushOutcome::Saved(snapshot) => assert_eq!(snapshot.state, json!({"score": 3})),
            other => panic!("expected saved outcome, got {other:?}"),
        }
        assert!(!h.handle.state().dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_during_flush_survives_its_success() {
        let h = start();
        h.gateway.set_save_delay(Duration::from_secs(2));
        tokio::time::sleep(MIN_FLUSH).await;

        h.handle.mark_changed(json!({"score": 1})).unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.handle.mark_changed(json!({"score": 2})).unwrap();

        // First flush resolves at ~7s; the newer mutation is replayed, not cleared.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let saves = h.gateway.saves();
        assert_eq!(saves.len(), 2);
        assert_eq!(saves[0].state, json!({"score": 1}));
        assert_eq!(saves[1].state, json!({"score": 2}));
        let state = h.handle.state();
        assert!(state.dirty());
        assert!(state.saving);
        assert_eq!(state.current.version, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let state = h.handle.state();
        assert!(!state.dirty());
        assert_eq!(state.current.version, 2);
        assert_eq!(state.current.state, json!({"score": 2}));
    }

    #[tokio::test(start_paused = true)]
    async fn session_seconds_are_credited_once() {
        let h = start();
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        h.handle.mark_changed(json!({"score": 1})).unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        h.handle.mark_changed(json!({"score": 2})).unwrap();
        settle().await;

        let saves = h.gateway.saves();
        assert_eq!(saves.len(), 2);
        assert_eq!(saves[0].session_elapsed_time, 10);
        assert_eq!(saves[1].session_elapsed_time, 10);
        let state = h.handle.state();
        assert_eq!(state.current.total_elapsed_time, 20);
        assert!(state.current.total_elapsed_time >= saves[0].session_elapsed_time);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_dirty_state() {
        let h = start();
        h.handle.mark_changed(json!({"score": 9})).unwrap();
        settle().await;
        assert_eq!(h.gateway.save_count(), 0);

        h.handle.shutdown().await.unwrap();
        h.join.await.unwrap();

        let saves = h.gateway.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].state, json!({"score": 9}));
        assert_eq!(
            h.handle.mark_changed(json!({})),
            Err(SchedulerError::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disposal_cancels_pending_timer_and_in_flight_save() {
        let h = start();
        let mut events = h.handle.subscribe();
        h.handle.mark_changed(json!({"score": 1})).unwrap();
        settle().await;

        h.cancel.cancel();
        h.join.await.unwrap();
        tokio::time::sleep(AUTOSAVE * 2).await;

        assert_eq!(h.gateway.save_count(), 0);
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hydrate_discards_pending_mutation() {
        let h = start();
        h.handle.mark_changed(json!({"score": 1})).unwrap();
        let remote = Snapshot {
            version: 3,
            total_elapsed_time: 500,
            ..Snapshot::initial("quiz", json!({"score": 99}))
        };
        h.handle.hydrate(remote.clone()).unwrap();
        settle().await;

        tokio::time::sleep(AUTOSAVE * 2).await;
        assert_eq!(h.gateway.save_count(), 0);
        let state = h.handle.state();
        assert!(!state.dirty());
        assert_eq!(state.current, remote);
    }

    #[tokio::test(start_paused = true)]
    async fn live_session_time_never_decreases_across_saves() {
        let h = start();
        tokio::time::sleep(Duration::from_millis(20_500)).await;
        h.handle.mark_changed(json!({"score": 1})).unwrap();
        settle().await;
        let first = h.handle.snapshot().session_elapsed_time;
        assert_eq!(first, 20);

        tokio::time::sleep(Duration::from_secs(6)).await;
        h.handle.mark_changed(json!({"score": 2})).unwrap();
        settle().await;

        let saves = h.gateway.saves();
        assert_eq!(saves.len(), 2);
        assert_eq!(saves[1].session_elapsed_time, 6);
        let second = h.handle.snapshot().session_elapsed_time;
        assert!(second >= first);
        assert_eq!(second, 26);
        assert_eq!(h.handle.snapshot().total_elapsed_time, 26);
    }

    #[tokio::test(start_paused = true)]
    async fn hydrate_supersedes_in_flight_flush() {
        let h = start();
        let ada = Credentials {
            identity: Identity::new("ada"),
            token: "token".into(),
        };
        let remote = h
            .gateway
            .backend()
            .save(&ada, SaveProgressRequest::new("quiz", json!({"score": 50}), 30))
            .await
            .unwrap();
        h.gateway.set_save_delay(Duration::from_secs(3));
        tokio::time::sleep(MIN_FLUSH).await;

        h.handle.mark_changed(json!({"score": 1})).unwrap();
        settle().await;
        assert!(h.handle.state().saving);
        let handle = h.handle.clone();
        let manual = tokio::spawn(async move { handle.flush().await });
        settle().await;

        h.handle.hydrate(remote.clone()).unwrap();
        assert_eq!(manual.await.unwrap().unwrap(), FlushOutcome::Clean);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let stored = h.gateway.backend().load(&ada, "quiz").await.unwrap().unwrap();
        assert_eq!(stored, remote);
        let state = h.handle.state();
        assert_eq!(state.current.state, json!({"score": 50}));
        assert_eq!(state.current.version, remote.version);
        assert_eq!(state.current.saved_at, remote.saved_at);
        assert!(!state.dirty());
        assert!(!state.saving);
        assert_eq!(h.gateway.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_flush_refreshes_local_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), "progress::quiz");
        let h = start_with(
            StaticIdentity::new(Identity::new("ada"), "token"),
            Some(cache.clone()),
        );

        h.handle.mark_changed(json!({"score": 4})).unwrap();
        let outcome = h.handle.flush().await.unwrap();
        let FlushOutcome::Saved(saved) = outcome else {
            panic!("expected a saved outcome");
        };

        let record = cache.read().await.unwrap().unwrap();
        assert_eq!(record.state, json!({"score": 4}));
        assert_eq!(record.cached_at, saved.saved_at);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_with_nothing_pending_is_clean() {
        let h = start();
        assert_eq!(h.handle.flush().await.unwrap(), FlushOutcome::Clean);
        assert_eq!(h.gateway.save_count(), 0);
    }
}
