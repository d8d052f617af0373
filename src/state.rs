//! Shared power / art-mode state and the predicate wait both schedulers use.
//!
//! The two booleans live in a single `watch` channel. Every setter goes
//! through `send_modify`, which updates the value under the channel's lock
//! and then notifies every receiver, so a waiter suspended in
//! [`StateBus::wait_until`] can never miss the transition that satisfies its
//! predicate: `wait_for` evaluates the predicate against the current value
//! before suspending and again after every notification.

#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameState {
    /// Whether the display device is currently powered.
    pub powered_on: bool,
    /// Whether the hub currently wants art mode shown.
    pub art_mode_active: bool,
}

impl FrameState {
    pub const fn new(powered_on: bool, art_mode_active: bool) -> Self {
        Self {
            powered_on,
            art_mode_active,
        }
    }

    /// Admission predicate of the snapshot loop.
    pub fn wants_snapshot(&self) -> bool {
        self.powered_on && !self.art_mode_active
    }

    /// Admission predicate of the art rotation loop.
    pub fn wants_art(&self) -> bool {
        self.powered_on && self.art_mode_active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Satisfied,
    TimedOut,
}

#[derive(Debug)]
pub struct StateBus {
    tx: watch::Sender<FrameState>,
    #[cfg(test)]
    updates: AtomicUsize,
}

impl Default for StateBus {
    fn default() -> Self {
        Self::new(FrameState::default())
    }
}

impl StateBus {
    pub fn new(initial: FrameState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx,
            #[cfg(test)]
            updates: AtomicUsize::new(0),
        }
    }

    /// Number of notifications sent so far.
    #[cfg(test)]
    pub(crate) fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    fn modify(&self, change: impl FnOnce(&mut FrameState)) {
        self.tx.send_modify(change);
        #[cfg(test)]
        self.updates.fetch_add(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> FrameState {
        *self.tx.borrow()
    }

    pub fn set_powered_on(&self, powered_on: bool) {
        self.modify(|state| state.powered_on = powered_on);
        trace!(powered_on, "state bus updated");
    }

    pub fn set_art_mode_active(&self, art_mode_active: bool) {
        self.modify(|state| state.art_mode_active = art_mode_active);
        trace!(art_mode_active, "state bus updated");
    }

    /// Replace both fields in one update (one wake for the pair).
    pub fn apply(&self, next: FrameState) {
        self.modify(|state| *state = next);
        trace!(?next, "state bus replaced");
    }

    /// Suspend until `predicate` holds or `timeout` elapses.
    ///
    /// `None` waits indefinitely. The predicate is checked against the
    /// current value first, so an already-satisfied predicate returns
    /// immediately without suspending.
    pub async fn wait_until<F>(&self, mut predicate: F, timeout: Option<Duration>) -> WaitOutcome
    where
        F: FnMut(&FrameState) -> bool,
    {
        let mut rx = self.tx.subscribe();
        let wait = async move {
            // The sender lives in `self`, which outlives this borrow, so the
            // channel cannot close while we wait.
            if rx.wait_for(|state| predicate(state)).await.is_err() {
                debug!("state bus closed while waiting");
                std::future::pending::<()>().await;
            }
        };

        match timeout {
            None => {
                wait.await;
                WaitOutcome::Satisfied
            }
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(()) => WaitOutcome::Satisfied,
                Err(_) => WaitOutcome::TimedOut,
            },
        }
    }
}
