//! Per-navigation settlement watcher.
//!
//! One watcher covers exactly one navigation attempt: it captures the target
//! frame's loader id at construction, subscribes to the frame manager for the
//! duration, and resolves once the navigation has committed and every
//! expected lifecycle name is present in the target frame and all of its
//! descendants.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::listeners::Listener;

use super::frame::{Frame, FrameManager};

/// Named settlement points of a page load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    /// The `load` event fired.
    Load,
    /// The `DOMContentLoaded` event fired.
    DomContentLoaded,
    /// No more than 0 network connections for at least 500 ms.
    NetworkIdle0,
    /// No more than 2 network connections for at least 500 ms.
    NetworkIdle2,
}

impl WaitUntil {
    /// The protocol lifecycle name this wait maps to.
    pub fn lifecycle_name(&self) -> &'static str {
        match self {
            WaitUntil::Load => "load",
            WaitUntil::DomContentLoaded => "DOMContentLoaded",
            WaitUntil::NetworkIdle0 => "networkIdle",
            WaitUntil::NetworkIdle2 => "networkAlmostIdle",
        }
    }
}

/// Options controlling when a navigation is considered settled.
#[derive(Debug, Clone)]
pub struct NavigateOptions {
    /// Lifecycle events that must all be reached. Defaults to `load`.
    pub wait_until: Vec<WaitUntil>,
    /// Navigation budget in milliseconds; `0` waits forever.
    pub timeout_ms: u32,
}

impl Default for NavigateOptions {
    fn default() -> Self {
        Self {
            wait_until: vec![WaitUntil::Load],
            timeout_ms: 30_000,
        }
    }
}

impl NavigateOptions {
    pub fn wait_until(mut self, wait_until: Vec<WaitUntil>) -> Self {
        self.wait_until = wait_until;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

#[derive(Clone, Copy, PartialEq)]
enum WatchState {
    Watching,
    Completed,
    Detached,
}

struct WatcherShared {
    frames: FrameManager,
    frame: Arc<Frame>,
    expected: Vec<&'static str>,
    initial_loader_id: String,
    same_document: AtomicBool,
    state: watch::Sender<WatchState>,
}

impl WatcherShared {
    fn finish(&self, state: WatchState) {
        self.state.send_if_modified(|current| {
            if *current == WatchState::Watching {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    fn check(&self) {
        if self.frame.is_detached() {
            self.finish(WatchState::Detached);
            return;
        }
        let committed = self.frame.loader_id() != self.initial_loader_id
            || self.same_document.load(Ordering::SeqCst);
        if !committed {
            return;
        }
        if !lifecycle_satisfied(&self.frames, &self.frame, &self.expected) {
            return;
        }
        self.finish(WatchState::Completed);
    }
}

/// Expected names must be present in `frame` and, recursively, in every
/// descendant still attached to the tree.
fn lifecycle_satisfied(frames: &FrameManager, frame: &Arc<Frame>, expected: &[&str]) -> bool {
    let reached = frame.lifecycle();
    if expected.iter().any(|name| !reached.contains(*name)) {
        return false;
    }
    for child_id in frame.child_ids() {
        if let Some(child) = frames.frame(&child_id) {
            if !lifecycle_satisfied(frames, &child, expected) {
                return false;
            }
        }
    }
    true
}

type FrameListener = Listener<Arc<Frame>>;

/// Short-lived: armed at construction, disarmed by `wait`, `cancel`, or drop.
pub(crate) struct NavigationWatcher {
    shared: Arc<WatcherShared>,
    timeout_ms: u32,
    subscriptions: Mutex<Option<[FrameListener; 3]>>,
}

impl NavigationWatcher {
    pub(crate) fn new(frames: FrameManager, frame: Arc<Frame>, options: &NavigateOptions) -> Self {
        let expected: Vec<&'static str> = options
            .wait_until
            .iter()
            .map(WaitUntil::lifecycle_name)
            .collect();
        let (state, _) = watch::channel(WatchState::Watching);
        let shared = Arc::new(WatcherShared {
            frames: frames.clone(),
            frame: frame.clone(),
            expected,
            initial_loader_id: frame.loader_id(),
            same_document: AtomicBool::new(false),
            state,
        });

        let on_lifecycle = {
            let shared = shared.clone();
            frames
                .on_lifecycle_event()
                .on(move |_frame: &Arc<Frame>| shared.check())
        };
        let on_same_document = {
            let shared = shared.clone();
            frames
                .on_frame_navigated_within_document()
                .on(move |frame: &Arc<Frame>| {
                    if Arc::ptr_eq(frame, &shared.frame) {
                        shared.same_document.store(true, Ordering::SeqCst);
                        shared.check();
                    }
                })
        };
        let on_detached = {
            let shared = shared.clone();
            frames.on_frame_detached().on(move |frame: &Arc<Frame>| {
                if Arc::ptr_eq(frame, &shared.frame) {
                    shared.finish(WatchState::Detached);
                }
            })
        };

        Self {
            shared,
            timeout_ms: options.timeout_ms,
            subscriptions: Mutex::new(Some([on_lifecycle, on_same_document, on_detached])),
        }
    }

    /// Wait until the navigation settles, times out, or the frame goes away.
    /// Subscriptions are disarmed on every exit path.
    pub(crate) async fn wait(&self) -> Result<()> {
        let outcome = if self.timeout_ms == 0 {
            self.wait_settled().await
        } else {
            let budget = Duration::from_millis(u64::from(self.timeout_ms));
            match tokio::time::timeout(budget, self.wait_settled()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.cancel();
                    return Err(Error::NavigationTimeout(self.timeout_ms));
                }
            }
        };
        self.cancel();
        match outcome {
            WatchState::Detached => Err(Error::DetachedFrame),
            _ => Ok(()),
        }
    }

    async fn wait_settled(&self) -> WatchState {
        let mut rx = self.shared.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state != WatchState::Watching {
                return state;
            }
            if rx.changed().await.is_err() {
                return WatchState::Detached;
            }
        }
    }

    /// Disarm the subscriptions. Does not resolve the outer navigation; the
    /// caller owns that.
    pub(crate) fn cancel(&self) {
        let Some([on_lifecycle, on_same_document, on_detached]) =
            self.subscriptions.lock().take()
        else {
            return;
        };
        self.shared.frames.on_lifecycle_event().remove(&on_lifecycle);
        self.shared
            .frames
            .on_frame_navigated_within_document()
            .remove(&on_same_document);
        self.shared.frames.on_frame_detached().remove(&on_detached);
    }
}

impl Drop for NavigationWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
#[path = "watcher_tests.rs"]
mod tests;
