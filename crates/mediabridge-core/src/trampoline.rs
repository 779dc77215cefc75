//! The Callback Trampoline.
//!
//! The engine is given one fixed entry point, [`event_trampoline`], plus a
//! correlation token as its user data. Tokens index a process-wide side table
//! of live registrations. A registration is removed from the table before its
//! native detach runs, so a callback that races with release finds nothing
//! and drops the event.
//!
//! The trampoline runs on engine-owned threads. It never blocks on anything
//! but short table locks and never calls back into the engine.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;

#[cfg(debug_assertions)]
use crate::diagnostics;
use crate::native::RawEvent;
use crate::safety::callback_boundary_or;

/// Something the trampoline can hand a raw event to.
pub(crate) trait Dispatch: Send + Sync {
    /// Builds the typed event and delivers it to a listener snapshot.
    ///
    /// # Safety
    /// `raw` must be the event the engine passed to the current callback.
    unsafe fn dispatch(&self, raw: &RawEvent);
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

static DISPATCH_TABLE: LazyLock<RwLock<HashMap<u64, Arc<dyn Dispatch>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Allocates a correlation token. Tokens are never reused.
pub(crate) fn next_token() -> u64 {
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn install(token: u64, target: Arc<dyn Dispatch>) {
    DISPATCH_TABLE.write().insert(token, target);
}

/// Removes a token. Returns false if it was not installed.
pub(crate) fn remove(token: u64) -> bool {
    DISPATCH_TABLE.write().remove(&token).is_some()
}

/// True while a registration with this token can still receive events.
pub fn is_installed(token: u64) -> bool {
    DISPATCH_TABLE.read().contains_key(&token)
}

/// Encodes a token as callback user data.
pub(crate) fn token_to_user_data(token: u64) -> *mut c_void {
    token as usize as *mut c_void
}

pub(crate) fn user_data_to_token(user_data: *mut c_void) -> u64 {
    user_data as usize as u64
}

/// Entry point registered with every event manager.
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn event_trampoline(event: *const RawEvent, user_data: *mut c_void) {
    callback_boundary_or((), "event_trampoline", || {
        if event.is_null() {
            tracing::warn!("event trampoline called with NULL event");
            return;
        }
        // SAFETY: the engine passes a pointer valid for this call.
        let raw = unsafe { &*event };
        let token = user_data_to_token(user_data);

        // Clone out of the table so the lock is not held while listeners run.
        let target = DISPATCH_TABLE.read().get(&token).cloned();
        let Some(target) = target else {
            tracing::debug!(
                "dropping event {:#x} for unknown token {token} (released)",
                raw.event_type
            );
            #[cfg(debug_assertions)]
            diagnostics::record_event_dropped();
            return;
        };

        // SAFETY: `raw` is the event of the current callback.
        unsafe { target.dispatch(raw) };
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{event_type, RawEventPayload};
    use parking_lot::Mutex;

    struct Recorder(Mutex<Vec<i32>>);

    impl Dispatch for Recorder {
        unsafe fn dispatch(&self, raw: &RawEvent) {
            self.0.lock().push(raw.event_type);
        }
    }

    struct Exploding;

    impl Dispatch for Exploding {
        unsafe fn dispatch(&self, _raw: &RawEvent) {
            panic!("dispatch exploded");
        }
    }

    fn fire(token: u64, kind: i32) {
        let raw = RawEvent::new(kind, std::ptr::null_mut(), RawEventPayload::empty());
        event_trampoline(&raw, token_to_user_data(token));
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = next_token();
        let b = next_token();
        assert_ne!(a, b);
        assert_eq!(user_data_to_token(token_to_user_data(a)), a);
    }

    #[test]
    fn test_routes_by_token() {
        let token = next_token();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        install(token, recorder.clone());

        fire(token, event_type::PLAYER_PLAYING);
        fire(token, event_type::PLAYER_STOPPED);
        assert_eq!(
            *recorder.0.lock(),
            vec![event_type::PLAYER_PLAYING, event_type::PLAYER_STOPPED]
        );

        assert!(remove(token));
        fire(token, event_type::PLAYER_PAUSED);
        assert_eq!(recorder.0.lock().len(), 2);
        assert!(!remove(token));
    }

    #[test]
    fn test_null_event_ignored() {
        event_trampoline(std::ptr::null(), token_to_user_data(next_token()));
    }

    #[test]
    fn test_panic_contained_at_boundary() {
        let token = next_token();
        install(token, Arc::new(Exploding));
        fire(token, event_type::PLAYER_PLAYING);
        assert!(is_installed(token));
        remove(token);
    }
}
