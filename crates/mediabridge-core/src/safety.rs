//! Native callback boundary utilities.
//!
//! Every `extern "C"` function the native engine calls back into wraps its
//! body in [`callback_boundary_or`], and every listener invocation goes
//! through [`contain_listener`]:
//! 1. Panics are caught with `std::panic::catch_unwind()`
//! 2. Nothing unwinds into the native call stack

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Runs a callback body, returning `default` if it panics.
///
/// # Safety rationale for `AssertUnwindSafe`
///
/// Shared state reachable from callbacks is guarded by `parking_lot` locks
/// (poison-free) or atomics. On unwind the guards drop and leave their data
/// unlocked and consistent. Closures holding other non-unwind-safe state
/// should not be passed here.
pub fn callback_boundary_or<T, F>(default: T, label: &'static str, f: F) -> T
where
    F: FnOnce() -> T,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(val) => val,
        Err(panic) => {
            tracing::error!(
                "native callback {label}: caught Rust panic at boundary: {}",
                panic_message(panic.as_ref())
            );
            default
        }
    }
}

/// Runs one listener invocation. Returns the panic message on failure.
pub fn contain_listener<F>(f: F) -> Result<(), String>
where
    F: FnOnce(),
{
    catch_unwind(AssertUnwindSafe(f)).map_err(|panic| panic_message(panic.as_ref()))
}

/// Extracts a printable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
