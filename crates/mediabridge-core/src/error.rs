//! Error types for the bridge.

use std::time::Duration;

use crate::handle::HandleKind;

/// Native status code for success. Negative values are failures.
pub const NATIVE_OK: i32 = 0;

/// Errors surfaced by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Operation on a composite object whose teardown has begun or completed.
    AlreadyReleased {
        /// Which object rejected the call
        object: &'static str,
    },
    /// `release()` called while another release of the same object is running.
    ReleaseInProgress {
        /// Which object is being released
        object: &'static str,
    },
    /// A native handle was released twice.
    HandleAlreadyReleased {
        /// Kind of the offending handle
        kind: HandleKind,
    },
    /// The native library returned a failure status (or no object).
    NativeCallFailure {
        /// Name of the native call
        call: &'static str,
        /// Raw status, `-1` when the call returned NULL
        status: i32,
    },
    /// The allocator could not provide `capacity + alignment` bytes.
    AlignmentAllocationFailure {
        /// Usable bytes requested
        capacity: usize,
        /// Requested alignment
        alignment: usize,
    },
    /// Alignment is zero or not a power of two.
    InvalidAlignment(usize),
    /// A listener panicked while handling an event. Logged, never returned
    /// across the native boundary.
    ListenerDispatchFailure {
        /// Event kind being delivered
        event: &'static str,
        /// Panic payload, if it was a string
        message: String,
    },
    /// A blocking wait exceeded its deadline.
    LatchTimeout(Duration),
    /// Caller supplied an unusable argument.
    InvalidArgument(String),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::AlreadyReleased { object } => {
                write!(f, "{object} has already been released")
            }
            BridgeError::ReleaseInProgress { object } => {
                write!(f, "{object} is being released on another thread")
            }
            BridgeError::HandleAlreadyReleased { kind } => {
                write!(f, "native {kind} handle released twice")
            }
            BridgeError::NativeCallFailure { call, status } => {
                write!(f, "native call {call} failed with status {status}")
            }
            BridgeError::AlignmentAllocationFailure {
                capacity,
                alignment,
            } => write!(
                f,
                "failed to allocate {capacity} bytes aligned to {alignment}"
            ),
            BridgeError::InvalidAlignment(alignment) => {
                write!(f, "alignment {alignment} is not a power of two")
            }
            BridgeError::ListenerDispatchFailure { event, message } => {
                write!(f, "listener failed handling {event}: {message}")
            }
            BridgeError::LatchTimeout(timeout) => {
                write!(f, "timed out after {timeout:?} waiting for outcome")
            }
            BridgeError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for BridgeError {}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Converts a native status code into a `Result`.
pub fn check_status(call: &'static str, status: i32) -> Result<()> {
    if status >= NATIVE_OK {
        Ok(())
    } else {
        Err(BridgeError::NativeCallFailure { call, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status() {
        assert!(check_status("play", 0).is_ok());
        assert!(check_status("play", 1).is_ok());
        assert_eq!(
            check_status("play", -1),
            Err(BridgeError::NativeCallFailure {
                call: "play",
                status: -1
            })
        );
    }

    #[test]
    fn test_display_names_object() {
        let err = BridgeError::AlreadyReleased { object: "media" };
        assert_eq!(err.to_string(), "media has already been released");
    }
}
