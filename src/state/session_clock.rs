//! Session clock: elapsed play time of the current process, refreshed once per tick.

use std::time::Duration;

use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

/// Default tick period.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Observational clock; it never triggers a save on its own.
#[derive(Clone)]
pub struct SessionClock {
    started_at: Instant,
    elapsed: watch::Receiver<u64>,
    cancel: CancellationToken,
}

impl SessionClock {
    /// Start ticking every `tick` until `cancel` fires. Elapsed time starts at zero.
    pub fn start(tick: Duration, cancel: CancellationToken) -> Self {
        let started_at = Instant::now();
        let (tx, rx) = watch::channel(0_u64);
        let stop = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let seconds = started_at.elapsed().as_secs();
                        tx.send_if_modified(|current| {
                            if *current == seconds {
                                false
                            } else {
                                *current = seconds;
                                true
                            }
                        });
                    }
                }
            }
        });

        Self {
            started_at,
            elapsed: rx,
            cancel,
        }
    }

    /// Whole seconds elapsed since the session started, as of the last tick.
    pub fn elapsed_secs(&self) -> u64 {
        *self.elapsed.borrow()
    }

    /// Instant the session started.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Observe every change of the elapsed seconds.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.elapsed.clone()
    }

    /// Stop ticking. The last published value stays readable.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn elapsed_follows_ticks() {
        let clock = SessionClock::start(DEFAULT_TICK, CancellationToken::new());
        assert_eq!(clock.elapsed_secs(), 0);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(clock.elapsed_secs(), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(clock.elapsed_secs(), 63);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_clock_freezes() {
        let clock = SessionClock::start(DEFAULT_TICK, CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        clock.stop();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(clock.elapsed_secs(), 2);
    }
}
