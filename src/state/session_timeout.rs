//! Inactivity-driven session timeout.
//!
//! [`SessionTimeoutMachine`] is the pure transition table; it only ever sees instants handed
//! to it. [`spawn`] wraps it in a task owning the timer table (inactivity deadline, countdown
//! interval), which is cleared on every transition and on disposal so that no stale timer can
//! fire after the session ended.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::IdentityProvider;

/// Timing knobs of the session timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeoutConfig {
    /// Inactivity after which the warning starts.
    pub session_timeout: Duration,
    /// Length of the warning countdown.
    pub auto_logout_timeout: Duration,
    /// Minimum spacing between two honored activity resets.
    pub min_activity_interval: Duration,
    /// Refresh period of the countdown.
    pub countdown_tick: Duration,
}

impl Default for SessionTimeoutConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(10 * 60),
            auto_logout_timeout: Duration::from_secs(60),
            min_activity_interval: Duration::from_secs(60),
            countdown_tick: Duration::from_secs(1),
        }
    }
}

/// Observable state of the session timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTimerState {
    /// User considered present.
    Active,
    /// Countdown running; the session expires when `remaining` reaches zero.
    Warning {
        /// Time left before the forced sign-out.
        remaining: Duration,
    },
    /// Signed out; terminal.
    Expired,
}

/// User activity that may reset the inactivity deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    /// `mousedown`
    MouseDown,
    /// `mousemove`
    MouseMove,
    /// `keypress` or `keydown`
    KeyPress,
    /// `scroll`
    Scroll,
    /// `touchstart`
    TouchStart,
    /// `click`
    Click,
}

impl ActivityKind {
    /// Every activity kind that is listened to.
    pub const ALL: [ActivityKind; 6] = [
        ActivityKind::MouseDown,
        ActivityKind::MouseMove,
        ActivityKind::KeyPress,
        ActivityKind::Scroll,
        ActivityKind::TouchStart,
        ActivityKind::Click,
    ];

    /// Event name as emitted by the UI layer.
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityKind::MouseDown => "mousedown",
            ActivityKind::MouseMove => "mousemove",
            ActivityKind::KeyPress => "keypress",
            ActivityKind::Scroll => "scroll",
            ActivityKind::TouchStart => "touchstart",
            ActivityKind::Click => "click",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when parsing an event name that is not tracked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown activity event `{0}`")]
pub struct UnknownActivity(pub String);

impl FromStr for ActivityKind {
    type Err = UnknownActivity;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "mousedown" => Ok(ActivityKind::MouseDown),
            "mousemove" => Ok(ActivityKind::MouseMove),
            "keypress" | "keydown" => Ok(ActivityKind::KeyPress),
            "scroll" => Ok(ActivityKind::Scroll),
            "touchstart" => Ok(ActivityKind::TouchStart),
            "click" => Ok(ActivityKind::Click),
            other => Err(UnknownActivity(other.to_owned())),
        }
    }
}

/// Events that can be applied to the session timeout machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The user did something.
    Activity(ActivityKind),
    /// The inactivity deadline elapsed.
    InactivityElapsed,
    /// The countdown interval ticked.
    CountdownTick,
    /// The user chose to stay connected from the warning.
    StayConnected,
    /// The user chose to sign out.
    SignOut,
}

/// Error returned when an event cannot be applied in the current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The state the machine was in when the event was received.
    pub from: SessionTimerState,
    /// The rejected event.
    pub event: SessionEvent,
}

/// Effect of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing changed (throttled activity, stale timer).
    Ignored,
    /// Still active, with a new inactivity deadline.
    Rearmed,
    /// Still warning, with less time left.
    Countdown(Duration),
    /// Moved to another state.
    Transitioned(SessionTimerState),
}

/// Pure session timeout state machine.
#[derive(Debug, Clone)]
pub struct SessionTimeoutMachine {
    config: SessionTimeoutConfig,
    state: SessionTimerState,
    last_reset: Instant,
    deadline: Instant,
    warning_ends_at: Option<Instant>,
}

impl SessionTimeoutMachine {
    /// Start in `Active`; arming the deadline counts as a reset.
    pub fn new(config: SessionTimeoutConfig, now: Instant) -> Self {
        Self {
            config,
            state: SessionTimerState::Active,
            last_reset: now,
            deadline: now + config.session_timeout,
            warning_ends_at: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionTimerState {
        self.state
    }

    /// Inactivity deadline of the current `Active` period.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// End of the countdown while in `Warning`.
    pub fn warning_ends_at(&self) -> Option<Instant> {
        self.warning_ends_at
    }

    /// Apply `event` observed at `now`.
    pub fn apply(&mut self, event: SessionEvent, now: Instant) -> Result<Step, InvalidTransition> {
        let step = match (self.state, event) {
            (SessionTimerState::Active, SessionEvent::Activity(_)) => {
                if now.saturating_duration_since(self.last_reset) < self.config.min_activity_interval {
                    Step::Ignored
                } else {
                    self.rearm(now);
                    Step::Rearmed
                }
            }
            (SessionTimerState::Warning { .. } | SessionTimerState::Expired, SessionEvent::Activity(_)) => {
                Step::Ignored
            }
            (SessionTimerState::Active, SessionEvent::InactivityElapsed) => {
                if now < self.deadline {
                    Step::Ignored
                } else {
                    let remaining = self.config.auto_logout_timeout;
                    self.warning_ends_at = Some(now + remaining);
                    self.enter(SessionTimerState::Warning { remaining })
                }
            }
            (SessionTimerState::Warning { .. }, SessionEvent::CountdownTick) => {
                let ends_at = self.warning_ends_at.unwrap_or(now);
                let remaining = ends_at.saturating_duration_since(now);
                if remaining.is_zero() {
                    self.warning_ends_at = None;
                    self.enter(SessionTimerState::Expired)
                } else {
                    self.state = SessionTimerState::Warning { remaining };
                    Step::Countdown(remaining)
                }
            }
            (SessionTimerState::Warning { .. }, SessionEvent::StayConnected) => {
                self.warning_ends_at = None;
                self.rearm(now);
                self.enter(SessionTimerState::Active)
            }
            (SessionTimerState::Active | SessionTimerState::Warning { .. }, SessionEvent::SignOut) => {
                self.warning_ends_at = None;
                self.enter(SessionTimerState::Expired)
            }
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(step)
    }

    fn rearm(&mut self, now: Instant) {
        self.last_reset = now;
        self.deadline = now + self.config.session_timeout;
    }

    fn enter(&mut self, next: SessionTimerState) -> Step {
        self.state = next;
        Step::Transitioned(next)
    }
}

/// Errors returned by [`SessionTimeoutHandle`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionTimeoutError {
    /// The event is not valid in the current state.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    /// The session task has stopped.
    #[error("session timeout has been disposed")]
    Closed,
}

type Reply = oneshot::Sender<Result<SessionTimerState, InvalidTransition>>;

enum Command {
    Activity(ActivityKind),
    StayConnected(Reply),
    SignOut(Reply),
    Dispose,
}

/// Handle to the session timeout task.
#[derive(Clone)]
pub struct SessionTimeoutHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionTimerState>,
}

impl SessionTimeoutHandle {
    /// Report user activity; throttled inside the machine.
    pub fn record_activity(&self, kind: ActivityKind) -> Result<(), SessionTimeoutError> {
        self.commands
            .send(Command::Activity(kind))
            .map_err(|_| SessionTimeoutError::Closed)
    }

    /// "Stay connected" from the warning prompt.
    pub async fn stay_connected(&self) -> Result<SessionTimerState, SessionTimeoutError> {
        self.request(Command::StayConnected).await
    }

    /// Explicit sign-out; expires the session and invokes the sign-out side channel.
    pub async fn sign_out(&self) -> Result<SessionTimerState, SessionTimeoutError> {
        self.request(Command::SignOut).await
    }

    /// Latest published timer state.
    pub fn state(&self) -> SessionTimerState {
        *self.state.borrow()
    }

    /// Observe state changes, including every countdown refresh.
    pub fn subscribe(&self) -> watch::Receiver<SessionTimerState> {
        self.state.clone()
    }

    /// Clear every timer and stop without signing out.
    pub fn dispose(&self) {
        let _ = self.commands.send(Command::Dispose);
    }

    async fn request(
        &self,
        command: impl FnOnce(Reply) -> Command,
    ) -> Result<SessionTimerState, SessionTimeoutError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| SessionTimeoutError::Closed)?;
        let state = rx.await.map_err(|_| SessionTimeoutError::Closed)??;
        Ok(state)
    }
}

/// Timers owned by the session timeout task.
#[derive(Debug, Default)]
struct TimerTable {
    deadline: Option<Instant>,
    countdown: Option<Interval>,
}

impl TimerTable {
    fn clear(&mut self) {
        self.deadline = None;
        self.countdown = None;
    }
}

/// Spawn the session timeout task.
pub fn spawn(
    config: SessionTimeoutConfig,
    identity: Arc<dyn IdentityProvider>,
    cancel: CancellationToken,
) -> (SessionTimeoutHandle, JoinHandle<()>) {
    let machine = SessionTimeoutMachine::new(config, Instant::now());
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(machine.state());

    let mut task = SessionTimeoutTask {
        config,
        machine,
        identity,
        cancel,
        commands: commands_rx,
        state_tx,
        timers: TimerTable::default(),
    };
    task.arm();

    let join = tokio::spawn(task.run());
    (
        SessionTimeoutHandle {
            commands: commands_tx,
            state: state_rx,
        },
        join,
    )
}

struct SessionTimeoutTask {
    config: SessionTimeoutConfig,
    machine: SessionTimeoutMachine,
    identity: Arc<dyn IdentityProvider>,
    cancel: CancellationToken,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<SessionTimerState>,
    timers: TimerTable,
}

impl SessionTimeoutTask {
    async fn run(mut self) {
        while self.machine.state() != SessionTimerState::Expired {
            let deadline = self.timers.deadline;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Activity(kind)) => {
                        let _ = self.step(SessionEvent::Activity(kind)).await;
                    }
                    Some(Command::StayConnected(reply)) => {
                        let outcome = self.step(SessionEvent::StayConnected).await;
                        let _ = reply.send(outcome);
                    }
                    Some(Command::SignOut(reply)) => {
                        let outcome = self.step(SessionEvent::SignOut).await;
                        let _ = reply.send(outcome);
                    }
                    Some(Command::Dispose) | None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let _ = self.step(SessionEvent::InactivityElapsed).await;
                }
                _ = tick(&mut self.timers.countdown), if self.timers.countdown.is_some() => {
                    let _ = self.step(SessionEvent::CountdownTick).await;
                }
            }
        }

        self.timers.clear();
        debug!("session timeout stopped");
    }

    async fn step(&mut self, event: SessionEvent) -> Result<SessionTimerState, InvalidTransition> {
        let step = self
            .machine
            .apply(event, Instant::now())
            .inspect_err(|err| warn!(error = %err, "rejected session event"))?;

        match step {
            Step::Ignored => {}
            Step::Rearmed => {
                self.arm();
                debug!(event = ?event, "inactivity deadline re-armed");
            }
            Step::Countdown(remaining) => {
                self.state_tx
                    .send_replace(SessionTimerState::Warning { remaining });
            }
            Step::Transitioned(next) => {
                self.arm();
                self.state_tx.send_replace(next);
                match next {
                    SessionTimerState::Active => info!("session resumed"),
                    SessionTimerState::Warning { remaining } => info!(
                        remaining_secs = remaining.as_secs(),
                        "session inactive; sign-out countdown started"
                    ),
                    SessionTimerState::Expired => {
                        info!(event = ?event, "session expired; signing out");
                        self.identity.sign_out().await;
                    }
                }
            }
        }

        Ok(self.machine.state())
    }

    /// Reset the timer table to match the machine state.
    fn arm(&mut self) {
        self.timers.clear();
        match self.machine.state() {
            SessionTimerState::Active => self.timers.deadline = Some(self.machine.deadline()),
            SessionTimerState::Warning { .. } => {
                let period = self.config.countdown_tick;
                let mut countdown = interval_at(Instant::now() + period, period);
                countdown.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.timers.countdown = Some(countdown);
            }
            SessionTimerState::Expired => {}
        }
    }
}

async fn tick(countdown: &mut Option<Interval>) {
    match countdown.as_mut() {
        Some(countdown) => {
            countdown.tick().await;
        }
        None => std::future::pending().await,
    }
}
