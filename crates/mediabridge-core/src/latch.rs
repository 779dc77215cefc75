//! Blocking-Operation Latch.
//!
//! A one-shot outcome fed by the event bridge. The latch attaches a transient
//! listener when it is created and detaches it as soon as it resolves.
//! Releasing the owning registration resolves any unresolved latch as
//! [`LatchOutcome::Released`]; a wait that times out resolves it as
//! [`LatchOutcome::TimedOut`], so events arriving afterwards are dropped.

use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{BridgeError, Result};
use crate::event::{EventKind, TypedEvent};
use crate::registration::{EventRegistration, ListenerId};

/// How a latch resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchOutcome {
    /// A success event was observed
    Success,
    /// A failure event was observed
    Failure,
    /// The owning object was released first
    Released,
    /// A wait hit its deadline first
    TimedOut,
}

impl LatchOutcome {
    pub fn is_success(self) -> bool {
        self == LatchOutcome::Success
    }
}

/// Shared completion state.
pub(crate) struct LatchCore {
    outcome: Mutex<Option<LatchOutcome>>,
    resolved: Condvar,
}

impl LatchCore {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            resolved: Condvar::new(),
        }
    }

    /// Sets the outcome if none is set yet. Returns true for the call that
    /// resolved the latch.
    pub(crate) fn resolve(&self, outcome: LatchOutcome) -> bool {
        let mut guard = self.outcome.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(outcome);
        self.resolved.notify_all();
        true
    }

    fn outcome(&self) -> Option<LatchOutcome> {
        *self.outcome.lock()
    }
}

/// Blocks an application thread until a success or failure event arrives.
pub struct BlockingLatch<E: TypedEvent> {
    core: Arc<LatchCore>,
    registration: Weak<EventRegistration<E>>,
    listener: Arc<OnceLock<ListenerId>>,
}

impl<E: TypedEvent> BlockingLatch<E> {
    /// Attaches a latch to `registration`.
    ///
    /// Kinds present in both sets count as success.
    pub fn attach(
        registration: &Arc<EventRegistration<E>>,
        success: &[EventKind],
        failure: &[EventKind],
    ) -> Result<Self> {
        let core = Arc::new(LatchCore::new());
        let listener_id: Arc<OnceLock<ListenerId>> = Arc::new(OnceLock::new());
        let weak_registration = Arc::downgrade(registration);

        let success = success.to_vec();
        let failure = failure.to_vec();
        let listener = {
            let core = core.clone();
            let listener_id = listener_id.clone();
            let weak_registration = weak_registration.clone();
            E::listener_fn(move |event: &E| {
                let kind = event.kind();
                let outcome = if success.contains(&kind) {
                    LatchOutcome::Success
                } else if failure.contains(&kind) {
                    LatchOutcome::Failure
                } else {
                    return;
                };
                if core.resolve(outcome) {
                    tracing::debug!("latch resolved by {} ({outcome:?})", kind.name());
                    // Not set yet if the event raced attach; attach detaches then.
                    if let (Some(registration), Some(id)) =
                        (weak_registration.upgrade(), listener_id.get())
                    {
                        registration.detach_id(*id);
                    }
                }
            })
        };

        registration.track_latch(Arc::downgrade(&core))?;
        let id = registration.attach(listener)?;
        let _ = listener_id.set(id);
        if core.outcome().is_some() {
            registration.detach_id(id);
        }

        Ok(Self {
            core,
            registration: weak_registration,
            listener: listener_id,
        })
    }

    /// Outcome so far, without blocking.
    pub fn outcome(&self) -> Option<LatchOutcome> {
        self.core.outcome()
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome().is_some()
    }

    /// Blocks until resolution or `timeout`.
    ///
    /// Returns `Ok(true)` for success, `Ok(false)` for a failure event or a
    /// release before any event, and [`BridgeError::LatchTimeout`] when the
    /// deadline passes. A timeout is terminal: the latch detaches and
    /// every later `wait` reports the timeout again.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        Ok(self.wait_outcome(timeout)?.is_success())
    }

    /// Like [`wait`](Self::wait) but reports the exact outcome.
    ///
    /// Never returns [`LatchOutcome::TimedOut`]; a timeout is reported as
    /// [`BridgeError::LatchTimeout`].
    pub fn wait_outcome(&self, timeout: Duration) -> Result<LatchOutcome> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.core.outcome.lock();
        loop {
            match *guard {
                Some(LatchOutcome::TimedOut) => return Err(BridgeError::LatchTimeout(timeout)),
                Some(outcome) => return Ok(outcome),
                None => {}
            }
            if self
                .core
                .resolved
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                if let Some(outcome) = *guard {
                    if outcome != LatchOutcome::TimedOut {
                        return Ok(outcome);
                    }
                } else {
                    *guard = Some(LatchOutcome::TimedOut);
                    self.core.resolved.notify_all();
                }
                drop(guard);
                self.detach();
                tracing::debug!("latch timed out after {timeout:?}");
                return Err(BridgeError::LatchTimeout(timeout));
            }
        }
    }

    fn detach(&self) {
        if let (Some(registration), Some(id)) = (self.registration.upgrade(), self.listener.get()) {
            registration.detach_id(*id);
        }
    }
}

impl<E: TypedEvent> Drop for BlockingLatch<E> {
    fn drop(&mut self) {
        if self.core.outcome().is_none() {
            self.detach();
        }
    }
}

impl<E: TypedEvent> std::fmt::Debug for BlockingLatch<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingLatch")
            .field("outcome", &self.outcome())
            .finish()
    }
}
