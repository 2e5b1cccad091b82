// ── Polling watcher ──
//
// Repeatedly asks a check function whether some asynchronous piece of work
// (a trace upload, a firmware job) is done, while counting elapsed ticks for
// display. One spawned task per watch owns both timers; cancelling the
// token or dropping the watcher stops them together.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::OptionFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreError;

// ── State ────────────────────────────────────────────────────────

/// Lifecycle of one watch. `Stopped` is reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    Succeeded,
    Failed,
    Stopped,
}

impl PollState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        })
    }
}

/// What a single check reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// Not done yet; check again on the next interval.
    Pending,
    Success(T),
    /// The work failed for good. Ends the watch.
    Failure(String),
}

/// Record of the most recent completed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollAttempt {
    /// 1-based check number.
    pub number: u32,
    /// Elapsed ticks when the check completed.
    pub elapsed: u64,
    /// Set when the check itself errored (treated as pending).
    pub error: Option<String>,
}

/// Point-in-time view of a watch.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSnapshot<T> {
    pub state: PollState,
    /// Ticks counted while polling. Frozen once the watch ends.
    pub elapsed: u64,
    /// Checks started so far.
    pub checks: u32,
    pub last_attempt: Option<PollAttempt>,
    /// Present once `state` is `Succeeded`; kept if later stopped.
    pub data: Option<T>,
    /// Present once `state` is `Failed`.
    pub failure: Option<String>,
}

impl<T> Default for PollSnapshot<T> {
    fn default() -> Self {
        Self {
            state: PollState::Idle,
            elapsed: 0,
            checks: 0,
            last_attempt: None,
            data: None,
            failure: None,
        }
    }
}

// ── Options ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOptions {
    /// Time between checks. Default: 5s.
    pub interval: Duration,
    /// Time between elapsed-counter increments. Default: 1s.
    pub tick: Duration,
    /// Consecutive check errors tolerated before the watch fails.
    /// `None` retries forever. Default: `None`.
    pub max_consecutive_errors: Option<u32>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            tick: Duration::from_secs(1),
            max_consecutive_errors: None,
        }
    }
}

// ── PollingWatcher ───────────────────────────────────────────────

/// A single watch: `Idle → Polling → (Succeeded | Failed)`, with
/// [`cancel`](Self::cancel) forcing `Stopped` from anywhere.
///
/// ```rust,ignore
/// let watcher = PollingWatcher::new(PollOptions::default());
/// watcher.start(move || {
///     let client = client.clone();
///     async move { client.command_status(&uuid).await.map(trace_outcome) }
/// })?;
/// let done = watcher.finished().await;
/// ```
pub struct PollingWatcher<T> {
    options: PollOptions,
    snapshot: Arc<watch::Sender<PollSnapshot<T>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T> PollingWatcher<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(options: PollOptions) -> Self {
        let (snapshot, _) = watch::channel(PollSnapshot::default());
        Self {
            options,
            snapshot: Arc::new(snapshot),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &PollOptions {
        &self.options
    }

    /// Begin polling with `check`. Only valid from `Idle`; a watcher is
    /// single-use. Must be called within a Tokio runtime.
    ///
    /// Errors returned by `check` count as `Pending` unless
    /// `max_consecutive_errors` is reached.
    pub fn start<F, Fut, E>(&self, check: F) -> Result<(), CoreError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<PollOutcome<T>, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        if self.options.interval.is_zero() || self.options.tick.is_zero() {
            return Err(CoreError::Config {
                message: "poll interval and tick must be non-zero".into(),
            });
        }

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);

        let mut refused = None;
        self.snapshot.send_if_modified(|snap| {
            if snap.state == PollState::Idle {
                snap.state = PollState::Polling;
                true
            } else {
                refused = Some(snap.state);
                false
            }
        });
        if let Some(state) = refused {
            return Err(CoreError::InvalidState {
                operation: "start",
                state: state.to_string(),
            });
        }

        debug!(
            interval_ms = u64::try_from(self.options.interval.as_millis()).unwrap_or(u64::MAX),
            tick_ms = u64::try_from(self.options.tick.as_millis()).unwrap_or(u64::MAX),
            "polling started"
        );
        *task = Some(tokio::spawn(drive(
            Arc::clone(&self.snapshot),
            self.options.clone(),
            self.cancel.clone(),
            check,
        )));
        Ok(())
    }

    /// Stop the watch and both of its timers. Valid in any state; a
    /// finished watch moves to `Stopped` with its result kept.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        self.snapshot.send_if_modified(|snap| {
            if snap.state == PollState::Stopped {
                return false;
            }
            debug!(from = %snap.state, elapsed = snap.elapsed, "polling stopped");
            snap.state = PollState::Stopped;
            true
        });
    }

    pub fn state(&self) -> PollState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> PollSnapshot<T> {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to every change of the snapshot (each tick, each check).
    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot<T>> {
        self.snapshot.subscribe()
    }

    /// Resolve with the snapshot of the first terminal state.
    pub async fn finished(&self) -> PollSnapshot<T> {
        let mut rx = self.snapshot.subscribe();
        match rx.wait_for(|snap| snap.state.is_terminal()).await {
            Ok(snap) => snap.clone(),
            Err(_) => self.snapshot(),
        }
    }
}

impl<T> Drop for PollingWatcher<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.snapshot.send_if_modified(|snap| {
            let changed = snap.state != PollState::Stopped;
            snap.state = PollState::Stopped;
            changed
        });
    }
}

impl<T> fmt::Debug for PollingWatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snap = self.snapshot.borrow();
        f.debug_struct("PollingWatcher")
            .field("state", &snap.state)
            .field("elapsed", &snap.elapsed)
            .field("checks", &snap.checks)
            .finish_non_exhaustive()
    }
}

// ── Watch task ───────────────────────────────────────────────────

async fn drive<T, F, Fut, E>(
    snapshot: Arc<watch::Sender<PollSnapshot<T>>>,
    options: PollOptions,
    cancel: CancellationToken,
    mut check: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollOutcome<T>, E>>,
    E: fmt::Display,
{
    let start = Instant::now();
    let mut ticker = interval_at(start + options.tick, options.tick);
    let mut checker = interval_at(start + options.interval, options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    checker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // At most one check in flight; a slow check delays the next one.
    let mut in_flight: Option<Pin<Box<Fut>>> = None;
    let mut consecutive_errors: u32 = 0;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,

            // Ticks first, so a check finishing on the same instant sees
            // an up-to-date elapsed count.
            _ = ticker.tick() => {
                let polling = snapshot.send_if_modified(|snap| {
                    if snap.state != PollState::Polling {
                        return false;
                    }
                    snap.elapsed += 1;
                    true
                });
                if !polling {
                    break;
                }
            }

            Some(result) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                in_flight = None;
                // Next check is a full interval after this one finished.
                checker.reset();
                let (outcome, error) = match result {
                    Ok(outcome) => {
                        consecutive_errors = 0;
                        (outcome, None)
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        let reason = e.to_string();
                        if options
                            .max_consecutive_errors
                            .is_some_and(|max| consecutive_errors >= max)
                        {
                            warn!(error = %reason, consecutive_errors, "check kept failing, giving up");
                            (PollOutcome::Failure(reason.clone()), Some(reason))
                        } else {
                            debug!(error = %reason, consecutive_errors, "check failed, will retry");
                            (PollOutcome::Pending, Some(reason))
                        }
                    }
                };

                if record(&snapshot, outcome, error) {
                    break;
                }
            }

            _ = checker.tick(), if in_flight.is_none() => {
                if cancel.is_cancelled() {
                    break;
                }
                let polling = snapshot.send_if_modified(|snap| {
                    if snap.state != PollState::Polling {
                        return false;
                    }
                    snap.checks += 1;
                    true
                });
                if !polling {
                    break;
                }
                in_flight = Some(Box::pin(check()));
            }
        }
    }
}

/// Apply a completed check to the snapshot. Returns `true` if the watch
/// reached a terminal state.
fn record<T>(
    snapshot: &watch::Sender<PollSnapshot<T>>,
    outcome: PollOutcome<T>,
    error: Option<String>,
) -> bool {
    let mut finished = false;
    snapshot.send_if_modified(|snap| {
        if snap.state != PollState::Polling {
            finished = true;
            return false;
        }
        snap.last_attempt = Some(PollAttempt {
            number: snap.checks,
            elapsed: snap.elapsed,
            error,
        });
        match outcome {
            PollOutcome::Pending => {}
            PollOutcome::Success(data) => {
                info!(checks = snap.checks, elapsed = snap.elapsed, "watch succeeded");
                snap.state = PollState::Succeeded;
                snap.data = Some(data);
                finished = true;
            }
            PollOutcome::Failure(reason) => {
                info!(checks = snap.checks, elapsed = snap.elapsed, %reason, "watch failed");
                snap.state = PollState::Failed;
                snap.failure = Some(reason);
                finished = true;
            }
        }
        true
    });
    finished
}

// ── Tests ────────────────────────────────────────────────────────
