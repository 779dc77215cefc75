//! Bridge safety diagnostics: live handle registry + debug metrics.
//!
//! ## Always-on (release + debug)
//!
//! **Handle registry**: Tracks live native handle addresses in a `HashSet<usize>`.
//! - `register_handle(addr)`: adds the address, returns false if already present.
//! - `unregister_handle(addr)`: removes it, returns false if unknown (double release).
//!
//! Used by `NativeHandle::release` so that two wrappers accidentally built
//! around the same native object cannot both release it.
//!
//! ## Debug-only (`cfg(debug_assertions)`)
//!
//! **Metrics**: Atomic counters for created/released/peak/live handles, events
//! dispatched, events dropped for unknown tokens, listener failures and frames
//! rendered. Exposed via `snapshot()` → `BridgeMetricsSnapshot`.
//!
//! ## Limitations
//!
//! Address-only tracking cannot detect a stale handle after the native
//! allocator reuses the same address for a new object (ABA). The registry
//! catches the common case (the same address released twice without an
//! intervening creation).

use std::collections::HashSet;
use std::sync::LazyLock;

use parking_lot::Mutex;

// =========================================================================
// Handle registry (always-on)
// =========================================================================

static HANDLE_REGISTRY: LazyLock<Mutex<HashSet<usize>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Registers a native handle address. Returns `false` if already registered.
pub fn register_handle(address: usize) -> bool {
    HANDLE_REGISTRY.lock().insert(address)
}

/// Unregisters a native handle address. Returns `false` if unknown.
pub fn unregister_handle(address: usize) -> bool {
    HANDLE_REGISTRY.lock().remove(&address)
}

/// Returns true if the address is currently registered. `NativeHandle::with`
/// asserts this in debug builds.
pub fn is_live(address: usize) -> bool {
    HANDLE_REGISTRY.lock().contains(&address)
}

// =========================================================================
// Metrics (debug-only)
// =========================================================================

#[cfg(debug_assertions)]
mod metrics {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::LazyLock;

    use parking_lot::Mutex;

    struct BridgeMetrics {
        handles_created: AtomicU64,
        handles_released: AtomicU64,
        handles_peak: AtomicU64,
        events_dispatched: AtomicU64,
        events_dropped: AtomicU64,
        listener_failures: AtomicU64,
        frames_rendered: AtomicU64,
        // Protected by lock for correct peak tracking
        handles_live: Mutex<u64>,
    }

    static METRICS: LazyLock<BridgeMetrics> = LazyLock::new(|| BridgeMetrics {
        handles_created: AtomicU64::new(0),
        handles_released: AtomicU64::new(0),
        handles_peak: AtomicU64::new(0),
        events_dispatched: AtomicU64::new(0),
        events_dropped: AtomicU64::new(0),
        listener_failures: AtomicU64::new(0),
        frames_rendered: AtomicU64::new(0),
        handles_live: Mutex::new(0),
    });

    pub fn record_handle_created() {
        METRICS.handles_created.fetch_add(1, Ordering::Relaxed);
        let mut live = METRICS.handles_live.lock();
        *live += 1;
        let current = *live;
        let peak = METRICS.handles_peak.load(Ordering::Relaxed);
        if current > peak {
            METRICS.handles_peak.store(current, Ordering::Relaxed);
        }
    }

    pub fn record_handle_released() {
        METRICS.handles_released.fetch_add(1, Ordering::Relaxed);
        let mut live = METRICS.handles_live.lock();
        *live = live.saturating_sub(1);
    }

    pub fn record_event_dispatched() {
        METRICS.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_dropped() {
        METRICS.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listener_failure() {
        METRICS.listener_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_rendered() {
        METRICS.frames_rendered.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of all metrics.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct BridgeMetricsSnapshot {
        pub handles_created: u64,
        pub handles_released: u64,
        pub handles_peak: u64,
        pub handles_live: u64,
        pub events_dispatched: u64,
        pub events_dropped: u64,
        pub listener_failures: u64,
        pub frames_rendered: u64,
    }

    pub fn snapshot() -> BridgeMetricsSnapshot {
        BridgeMetricsSnapshot {
            handles_created: METRICS.handles_created.load(Ordering::Relaxed),
            handles_released: METRICS.handles_released.load(Ordering::Relaxed),
            handles_peak: METRICS.handles_peak.load(Ordering::Relaxed),
            handles_live: *METRICS.handles_live.lock(),
            events_dispatched: METRICS.events_dispatched.load(Ordering::Relaxed),
            events_dropped: METRICS.events_dropped.load(Ordering::Relaxed),
            listener_failures: METRICS.listener_failures.load(Ordering::Relaxed),
            frames_rendered: METRICS.frames_rendered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(debug_assertions)]
pub use metrics::{
    record_event_dispatched, record_event_dropped, record_frame_rendered,
    record_handle_created, record_handle_released, record_listener_failure, snapshot,
    BridgeMetricsSnapshot,
};
