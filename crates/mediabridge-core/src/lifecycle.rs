//! Resource Lifecycle Coordinator.
//!
//! Composite objects move through `Created → Active → Releasing → Released`.
//! Public operations call [`Lifecycle::ensure_active`] first. The first
//! `release()` wins the `Active → Releasing` transition and tears down the
//! sub-services in their registered order, then the native handle. A second
//! `release()` while that runs fails fast with
//! [`BridgeError::ReleaseInProgress`]; after it finishes it is a no-op.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::{BridgeError, Result};
use crate::handle::NativeHandle;
use crate::safety::contain_listener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Created = 0,
    Active = 1,
    Releasing = 2,
    Released = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Created,
            1 => LifecycleState::Active,
            2 => LifecycleState::Releasing,
            _ => LifecycleState::Released,
        }
    }
}

/// Atomic state shared by a composite object and its sub-services.
#[derive(Debug)]
pub struct Lifecycle {
    object: &'static str,
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new(object: &'static str) -> Self {
        Self {
            object,
            state: AtomicU8::new(LifecycleState::Created as u8),
        }
    }

    pub fn object(&self) -> &'static str {
        self.object
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Created → Active`, once construction has finished.
    pub fn activate(&self) {
        let _ = self.state.compare_exchange(
            LifecycleState::Created as u8,
            LifecycleState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Fails unless the object is `Active`.
    pub fn ensure_active(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Active => Ok(()),
            LifecycleState::Releasing | LifecycleState::Released => {
                Err(BridgeError::AlreadyReleased {
                    object: self.object,
                })
            }
            LifecycleState::Created => Err(BridgeError::InvalidArgument(format!(
                "{} used before construction finished",
                self.object
            ))),
        }
    }

    /// Claims the release. `Ok(true)` means the caller must tear down,
    /// `Ok(false)` means the object is already released.
    fn begin_release(&self) -> Result<bool> {
        let current = self.state.load(Ordering::Acquire);
        match LifecycleState::from_u8(current) {
            LifecycleState::Released => return Ok(false),
            LifecycleState::Releasing => {
                return Err(BridgeError::ReleaseInProgress {
                    object: self.object,
                })
            }
            _ => {}
        }
        match self.state.compare_exchange(
            current,
            LifecycleState::Releasing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(true),
            Err(actual) if LifecycleState::from_u8(actual) == LifecycleState::Released => Ok(false),
            Err(_) => Err(BridgeError::ReleaseInProgress {
                object: self.object,
            }),
        }
    }

    fn finish_release(&self) {
        self.state
            .store(LifecycleState::Released as u8, Ordering::Release);
    }
}

/// A part of a composite object with its own teardown.
pub trait SubService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called exactly once by the coordinator.
    fn release(&self);
}

/// Ordered teardown of a composite object.
pub struct Coordinator {
    lifecycle: Arc<Lifecycle>,
    services: Vec<Arc<dyn SubService>>,
    handle: Arc<NativeHandle>,
}

impl Coordinator {
    /// `services` are released in the given order, event services first.
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        services: Vec<Arc<dyn SubService>>,
        handle: Arc<NativeHandle>,
    ) -> Self {
        lifecycle.activate();
        Self {
            lifecycle,
            services,
            handle,
        }
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn handle(&self) -> &Arc<NativeHandle> {
        &self.handle
    }

    pub fn ensure_active(&self) -> Result<()> {
        self.lifecycle.ensure_active()
    }

    /// Releases every sub-service, then the native handle.
    pub fn release(&self) -> Result<()> {
        if !self.lifecycle.begin_release()? {
            return Ok(());
        }
        let object = self.lifecycle.object();
        tracing::debug!("releasing {object} {:#x}", self.handle.address());

        for service in &self.services {
            tracing::trace!("releasing {object} {} service", service.name());
            // A panicking sub-service must not leave the handle unreleased.
            if let Err(message) = contain_listener(|| service.release()) {
                tracing::error!(
                    "{object} {} service panicked during release: {message}",
                    service.name()
                );
            }
        }

        let result = self.handle.release();
        self.lifecycle.finish_release();
        tracing::debug!("released {object} {:#x}", self.handle.address());
        result
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.services.iter().map(|s| s.name()).collect();
        f.debug_struct("Coordinator")
            .field("state", &self.lifecycle.state())
            .field("services", &names)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleKind;
    use crate::native::NativeEngine;
    use crate::simulated::SimulatedEngine;
    use parking_lot::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        handle: Arc<NativeHandle>,
    }

    impl SubService for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn release(&self) {
            // Every service still sees a live handle.
            let live = !self.handle.is_released();
            self.log.lock().push(format!("{}:{live}", self.name));
        }
    }

    fn coordinator(log: &Arc<Mutex<Vec<String>>>) -> (Arc<SimulatedEngine>, Coordinator) {
        let engine = SimulatedEngine::new();
        let raw = engine.player_new().unwrap();
        let handle = Arc::new(NativeHandle::adopt(HandleKind::Player, raw, engine.clone()).unwrap());
        let lifecycle = Arc::new(Lifecycle::new("media player"));
        let services: Vec<Arc<dyn SubService>> = ["events", "controls", "media"]
            .into_iter()
            .map(|name| {
                Arc::new(Recording {
                    name,
                    log: log.clone(),
                    handle: handle.clone(),
                }) as Arc<dyn SubService>
            })
            .collect();
        (engine, Coordinator::new(lifecycle, services, handle))
    }

    #[test]
    fn test_states() {
        let lifecycle = Lifecycle::new("media");
        assert_eq!(lifecycle.state(), LifecycleState::Created);
        assert!(lifecycle.ensure_active().is_err());
        lifecycle.activate();
        assert!(lifecycle.ensure_active().is_ok());
        assert_eq!(lifecycle.begin_release(), Ok(true));
        assert_eq!(
            lifecycle.ensure_active(),
            Err(BridgeError::AlreadyReleased { object: "media" })
        );
        assert_eq!(
            lifecycle.begin_release(),
            Err(BridgeError::ReleaseInProgress { object: "media" })
        );
        lifecycle.finish_release();
        assert_eq!(lifecycle.begin_release(), Ok(false));
        assert_eq!(lifecycle.state(), LifecycleState::Released);
    }

    #[test]
    fn test_release_order_handle_last() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (engine, coordinator) = coordinator(&log);
        let addr = coordinator.handle().address();

        coordinator.release().unwrap();
        assert_eq!(
            *log.lock(),
            vec!["events:true", "controls:true", "media:true"]
        );
        assert!(coordinator.handle().is_released());
        assert_eq!(engine.release_count(addr), 1);
    }

    #[test]
    fn test_second_release_is_noop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (engine, coordinator) = coordinator(&log);
        let addr = coordinator.handle().address();

        coordinator.release().unwrap();
        coordinator.release().unwrap();
        assert_eq!(log.lock().len(), 3);
        assert_eq!(engine.release_count(addr), 1);
        assert_eq!(
            coordinator.ensure_active(),
            Err(BridgeError::AlreadyReleased {
                object: "media player"
            })
        );
    }
}
