//! Pagination state machine.
//!
//! Every paginated list screen owns one [`FeedController`]. The controller
//! drives a [`FeedSource`] (which fetches and reconciles one page), keeps the
//! continuation token, and pushes resulting ids into a [`FeedSink`]
//! (normally the record projector). State legality lives in a single
//! [`transition_allowed`] table; an attempted transition outside the table
//! is a logged no-op, never a panic.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::feed::error::FetchError;

/// Lifecycle state of one paginated feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// Created, nothing requested yet.
    Initial,
    /// Token and list reset; immediately enters `Loading`.
    Reloading,
    /// Exactly one page fetch in flight.
    Loading,
    /// A page landed and a continuation token is held.
    Idle,
    /// A fetch failed; a delayed retry is scheduled.
    Fail,
    /// The feed is exhausted; only a reload restarts it.
    NoMore,
    /// Terminal until the owning screen is torn down.
    PermissionDenied,
}

impl FeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Reloading => "reloading",
            Self::Loading => "loading",
            Self::Idle => "idle",
            Self::Fail => "fail",
            Self::NoMore => "no_more",
            Self::PermissionDenied => "permission_denied",
        }
    }
}

/// The feed state legality table.
///
/// `Loading -> Reloading` and `Fail -> Reloading` are allowed so a
/// user-initiated reload can preempt an in-flight or failed fetch; the
/// controller's generation counter discards the preempted fetch's result
/// when it eventually lands.
pub fn transition_allowed(from: FeedState, to: FeedState) -> bool {
    use FeedState::*;
    matches!(
        (from, to),
        (Initial, Reloading)
            | (Reloading, Loading)
            | (Loading, Idle | NoMore | Fail | PermissionDenied | Reloading)
            | (Idle, Reloading | Loading)
            | (Fail, Loading | Reloading)
            | (NoMore, Reloading)
    )
}

/// Opaque continuation token carried between pages (a `max_id` cursor for
/// both supported backends).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageToken(pub String);

/// One fetched-and-reconciled page, in fetch order.
#[derive(Debug, Clone)]
pub struct LoadedPage {
    pub ids: Vec<String>,
    /// Token for the next page; `None` means the feed is exhausted.
    pub next_token: Option<PageToken>,
}

/// Fetches and reconciles one page of a feed.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// `token` is `None` for the first page after a reload.
    async fn load_page(
        &self,
        token: Option<&PageToken>,
        page_size: u32,
    ) -> Result<LoadedPage, FetchError>;
}

/// Where loaded ids go. Implemented by the record projector; tests plug in
/// a recording sink instead.
pub trait FeedSink: Send + Sync {
    fn append(&self, ids: Vec<String>);
    fn clear(&self);
}

struct Machine {
    state: FeedState,
    token: Option<PageToken>,
    /// Bumped on every reload. A fetch result whose generation no longer
    /// matches is stale and dropped.
    generation: u64,
}

struct ControllerShared {
    source: Arc<dyn FeedSource>,
    sink: Arc<dyn FeedSink>,
    config: SyncConfig,
    machine: Mutex<Machine>,
    state_tx: watch::Sender<FeedState>,
    cancel: CancellationToken,
}

impl ControllerShared {
    fn machine(&self) -> Option<MutexGuard<'_, Machine>> {
        match self.machine.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!("Feed state lock poisoned, dropping operation");
                None
            }
        }
    }

    fn transition(&self, machine: &mut Machine, to: FeedState) -> bool {
        if !transition_allowed(machine.state, to) {
            warn!(
                from = machine.state.as_str(),
                to = to.as_str(),
                "Ignoring illegal feed state transition"
            );
            return false;
        }
        debug!(
            from = machine.state.as_str(),
            to = to.as_str(),
            "Feed state transition"
        );
        machine.state = to;
        // send_replace updates the value even with no receivers, so
        // state() stays fresh for callers that never subscribe.
        self.state_tx.send_replace(to);
        true
    }
}

/// Control-plane driver for one paginated list.
pub struct FeedController {
    shared: Arc<ControllerShared>,
}

impl FeedController {
    pub fn new(source: Arc<dyn FeedSource>, sink: Arc<dyn FeedSink>, config: SyncConfig) -> Self {
        let (state_tx, _) = watch::channel(FeedState::Initial);
        Self {
            shared: Arc::new(ControllerShared {
                source,
                sink,
                config,
                machine: Mutex::new(Machine {
                    state: FeedState::Initial,
                    token: None,
                    generation: 0,
                }),
                state_tx,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Restart the feed from the top: reset the token, clear the sink, and
    /// fetch the first page. Preempts an in-flight fetch; its result will be
    /// dropped as stale when it lands.
    pub fn reload(&self) {
        let generation = {
            let Some(mut machine) = self.shared.machine() else {
                return;
            };
            if !self.shared.transition(&mut machine, FeedState::Reloading) {
                return;
            }
            machine.token = None;
            machine.generation += 1;
            self.shared.transition(&mut machine, FeedState::Loading);
            machine.generation
        };

        self.shared.sink.clear();
        spawn_fetch(self.shared.clone(), generation, None);
    }

    /// Fetch the next page using the stored continuation token. A no-op
    /// unless the feed is `Idle`.
    pub fn load_more(&self) {
        let job = {
            let Some(mut machine) = self.shared.machine() else {
                return;
            };
            if machine.state != FeedState::Idle {
                debug!(
                    state = machine.state.as_str(),
                    "load_more outside Idle is a no-op"
                );
                return;
            }
            self.shared.transition(&mut machine, FeedState::Loading);
            (machine.generation, machine.token.clone())
        };

        spawn_fetch(self.shared.clone(), job.0, job.1);
    }

    pub fn state(&self) -> FeedState {
        *self.shared.state_tx.borrow()
    }

    /// Watch channel for spinner / "load more" affordances.
    pub fn subscribe_state(&self) -> watch::Receiver<FeedState> {
        self.shared.state_tx.subscribe()
    }

    /// Cancel in-flight fetches and pending retries. Called on screen
    /// teardown; the controller is unusable afterwards.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }
}

fn spawn_fetch(shared: Arc<ControllerShared>, generation: u64, token: Option<PageToken>) {
    tokio::spawn(run_fetch(shared, generation, token));
}

async fn run_fetch(shared: Arc<ControllerShared>, generation: u64, mut token: Option<PageToken>) {
    // Retries loop here rather than respawning, so a sustained outage costs
    // one task and no growing chain of suspended frames.
    loop {
        let page_size = shared.config.page_size;
        let result = tokio::select! {
            _ = shared.cancel.cancelled() => {
                debug!("Feed controller shut down, dropping in-flight fetch");
                return;
            }
            result = shared.source.load_page(token.as_ref(), page_size) => result,
        };

        let schedule_retry = {
            let Some(mut machine) = shared.machine() else {
                return;
            };
            if machine.generation != generation || machine.state != FeedState::Loading {
                debug!(generation, "Dropping stale fetch result");
                return;
            }
            // Sink mutations stay under the machine lock: a concurrent
            // reload either sees them before it bumps the generation (and
            // clears them), or has already bumped it (and this result is
            // dropped above). Nothing stale can land after the clear.
            match result {
                Ok(page) => {
                    machine.token = page.next_token.clone();
                    let to = if page.next_token.is_some() {
                        FeedState::Idle
                    } else {
                        FeedState::NoMore
                    };
                    shared.transition(&mut machine, to);
                    shared.sink.append(page.ids);
                    false
                }
                Err(FetchError::PermissionDenied) => {
                    warn!("Feed access denied, clearing list");
                    shared.transition(&mut machine, FeedState::PermissionDenied);
                    shared.sink.clear();
                    false
                }
                Err(FetchError::Transient(error)) => {
                    warn!(
                        %error,
                        delay_secs = shared.config.fail_retry_delay.as_secs_f64(),
                        "Page fetch failed, retrying after delay"
                    );
                    shared.transition(&mut machine, FeedState::Fail);
                    true
                }
            }
        };

        if !schedule_retry {
            return;
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(shared.config.fail_retry_delay) => {}
        }

        token = {
            let Some(mut machine) = shared.machine() else {
                return;
            };
            // A reload in the meantime owns the feed now.
            if machine.generation != generation || machine.state != FeedState::Fail {
                return;
            }
            shared.transition(&mut machine, FeedState::Loading);
            machine.token.clone()
        };
    }
}
