//! Event Registration Table.
//!
//! One [`EventRegistration`] per composite object. It is subscribed with the
//! engine exactly once, for every kind in [`TypedEvent::WATCHED`], when it is
//! created, and unsubscribed exactly once on release. Listener attach and
//! detach after that only touch the bridge side.
//!
//! Listeners live in a copy-on-write `Arc<Vec<_>>`. Dispatch clones the `Arc`
//! under a read lock and iterates the snapshot with no lock held, so
//! listeners may attach or detach (themselves included) from inside a
//! callback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

#[cfg(debug_assertions)]
use crate::diagnostics;
use crate::error::{check_status, BridgeError, Result};
use crate::event::{EventKind, TypedEvent};
use crate::latch::{BlockingLatch, LatchCore, LatchOutcome};
use crate::lifecycle::{Lifecycle, SubService};
use crate::native::{NativeEngine, RawEvent, RawHandle};
use crate::safety::contain_listener;
use crate::trampoline::{self, event_trampoline, Dispatch};

/// Identifies one attachment of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct ListenerEntry<E: TypedEvent> {
    id: ListenerId,
    listener: Arc<E::Listener>,
}

impl<E: TypedEvent> Clone for ListenerEntry<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            listener: self.listener.clone(),
        }
    }
}

/// Listener table for one native event manager.
pub struct EventRegistration<E: TypedEvent> {
    token: u64,
    manager: RawHandle,
    /// Address of the owning native object, for logs
    owner: usize,
    engine: Arc<dyn NativeEngine>,
    listeners: RwLock<Arc<Vec<ListenerEntry<E>>>>,
    next_id: AtomicU64,
    released: AtomicBool,
    dispatch_failures: AtomicU64,
    latches: Mutex<Vec<Weak<LatchCore>>>,
    trace_events: bool,
}

impl<E: TypedEvent> EventRegistration<E> {
    /// Subscribes the trampoline with `manager` for every watched kind.
    ///
    /// If any native attach fails the kinds already attached are detached
    /// again and the error is returned.
    pub fn register(
        engine: Arc<dyn NativeEngine>,
        manager: RawHandle,
        owner: usize,
        trace_events: bool,
    ) -> Result<Arc<Self>> {
        let token = trampoline::next_token();
        let registration = Arc::new(Self {
            token,
            manager,
            owner,
            engine,
            listeners: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
            released: AtomicBool::new(false),
            dispatch_failures: AtomicU64::new(0),
            latches: Mutex::new(Vec::new()),
            trace_events,
        });

        // Installed before the native attach so the first event finds it.
        trampoline::install(token, registration.clone());

        let user_data = trampoline::token_to_user_data(token);
        for (index, kind) in E::WATCHED.iter().enumerate() {
            let status = registration.engine.event_attach(
                manager,
                kind.as_raw(),
                event_trampoline,
                user_data,
            );
            if let Err(err) = check_status("event_attach", status) {
                tracing::error!(
                    "{} {owner:#x}: attaching {} failed: {err}",
                    E::SOURCE,
                    kind.name()
                );
                registration.released.store(true, Ordering::Release);
                trampoline::remove(token);
                for attached in &E::WATCHED[..index] {
                    registration.engine.event_detach(
                        manager,
                        attached.as_raw(),
                        event_trampoline,
                        user_data,
                    );
                }
                return Err(err);
            }
        }

        tracing::debug!(
            "{} {owner:#x}: event registration {token} attached ({} kinds)",
            E::SOURCE,
            E::WATCHED.len()
        );
        Ok(registration)
    }

    /// Correlation token handed to the engine.
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Number of listener invocations that panicked.
    pub fn dispatch_failures(&self) -> u64 {
        self.dispatch_failures.load(Ordering::Relaxed)
    }

    /// Appends a listener. The same listener may be attached more than once
    /// and is then notified once per attachment.
    pub fn attach(&self, listener: Arc<E::Listener>) -> Result<ListenerId> {
        let mut guard = self.listeners.write();
        if self.is_released() {
            return Err(BridgeError::AlreadyReleased { object: E::SOURCE });
        }
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(ListenerEntry { id, listener });
        *guard = Arc::new(next);
        Ok(id)
    }

    /// Removes the first attachment of `listener`. Returns false if absent.
    pub fn detach(&self, listener: &Arc<E::Listener>) -> bool {
        self.remove_where(|entry| {
            std::ptr::addr_eq(Arc::as_ptr(&entry.listener), Arc::as_ptr(listener))
        })
    }

    /// Removes the attachment `id`. Returns false if absent.
    pub fn detach_id(&self, id: ListenerId) -> bool {
        self.remove_where(|entry| entry.id == id)
    }

    fn remove_where(&self, matches: impl Fn(&ListenerEntry<E>) -> bool) -> bool {
        let mut guard = self.listeners.write();
        let Some(position) = guard.iter().position(matches) else {
            return false;
        };
        let mut next: Vec<_> = guard.iter().cloned().collect();
        next.remove(position);
        *guard = Arc::new(next);
        true
    }

    /// Tracks a latch so release can resolve it.
    pub(crate) fn track_latch(&self, latch: Weak<LatchCore>) -> Result<()> {
        let mut latches = self.latches.lock();
        if self.is_released() {
            return Err(BridgeError::AlreadyReleased { object: E::SOURCE });
        }
        latches.retain(|entry| entry.strong_count() > 0);
        latches.push(latch);
        Ok(())
    }

    /// Delivers `event` to a snapshot of the listeners, in attach order.
    pub(crate) fn deliver(&self, event: &E) {
        let snapshot = self.listeners.read().clone();
        #[cfg(debug_assertions)]
        diagnostics::record_event_dispatched();

        for entry in snapshot.iter() {
            if let Err(message) = contain_listener(|| event.notify(entry.listener.as_ref())) {
                self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                #[cfg(debug_assertions)]
                diagnostics::record_listener_failure();
                let err = BridgeError::ListenerDispatchFailure {
                    event: event.kind().name(),
                    message,
                };
                tracing::error!(
                    "{} {:#x}: listener {:?}: {err}",
                    E::SOURCE,
                    self.owner,
                    entry.id
                );
            }
        }
    }

    /// Stops delivery and unsubscribes from the engine.
    ///
    /// Returns false if already released. Outstanding latches resolve as
    /// [`LatchOutcome::Released`].
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        trampoline::remove(self.token);
        let user_data = trampoline::token_to_user_data(self.token);
        for kind in E::WATCHED {
            self.engine
                .event_detach(self.manager, kind.as_raw(), event_trampoline, user_data);
        }
        *self.listeners.write() = Arc::new(Vec::new());

        let latches = std::mem::take(&mut *self.latches.lock());
        for latch in latches.iter().filter_map(Weak::upgrade) {
            latch.resolve(LatchOutcome::Released);
        }

        tracing::debug!(
            "{} {:#x}: event registration {} released",
            E::SOURCE,
            self.owner,
            self.token
        );
        true
    }
}

impl<E: TypedEvent> Dispatch for EventRegistration<E> {
    unsafe fn dispatch(&self, raw: &RawEvent) {
        if self.is_released() {
            #[cfg(debug_assertions)]
            diagnostics::record_event_dropped();
            return;
        }
        let Some(event) = E::from_raw(raw, self.engine.as_ref()) else {
            tracing::trace!(
                "{} {:#x}: ignoring event type {:#x}",
                E::SOURCE,
                self.owner,
                raw.event_type
            );
            return;
        };
        if self.trace_events {
            tracing::trace!("{} {:#x}: {event:?}", E::SOURCE, self.owner);
        }
        self.deliver(&event);
    }
}

// =========================================================================
// Event sub-service
// =========================================================================

/// Listener management exposed on a composite object.
pub struct EventService<E: TypedEvent> {
    lifecycle: Arc<Lifecycle>,
    registration: Arc<EventRegistration<E>>,
}

impl<E: TypedEvent> EventService<E> {
    pub(crate) fn new(lifecycle: Arc<Lifecycle>, registration: Arc<EventRegistration<E>>) -> Self {
        Self {
            lifecycle,
            registration,
        }
    }

    pub fn attach(&self, listener: Arc<E::Listener>) -> Result<ListenerId> {
        self.lifecycle.ensure_active()?;
        self.registration.attach(listener)
    }

    /// Attaches a closure as a listener.
    pub fn attach_fn<F>(&self, f: F) -> Result<ListenerId>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.attach(E::listener_fn(f))
    }

    pub fn detach(&self, listener: &Arc<E::Listener>) -> Result<bool> {
        self.lifecycle.ensure_active()?;
        Ok(self.registration.detach(listener))
    }

    pub fn detach_id(&self, id: ListenerId) -> Result<bool> {
        self.lifecycle.ensure_active()?;
        Ok(self.registration.detach_id(id))
    }

    /// Creates a latch resolving on the first `success` or `failure` event.
    pub fn latch(&self, success: &[EventKind], failure: &[EventKind]) -> Result<BlockingLatch<E>> {
        self.lifecycle.ensure_active()?;
        BlockingLatch::attach(&self.registration, success, failure)
    }

    pub fn listener_count(&self) -> usize {
        self.registration.listener_count()
    }

    pub fn dispatch_failures(&self) -> u64 {
        self.registration.dispatch_failures()
    }

    /// Correlation token the engine calls back with.
    pub fn token(&self) -> u64 {
        self.registration.token()
    }

    pub(crate) fn registration(&self) -> &Arc<EventRegistration<E>> {
        &self.registration
    }
}

impl<E: TypedEvent> SubService for EventService<E> {
    fn name(&self) -> &'static str {
        "events"
    }

    fn release(&self) {
        self.registration.release();
    }
}
