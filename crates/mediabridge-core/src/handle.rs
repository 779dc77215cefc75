//! Native handle ownership.
//!
//! [`NativeHandle`] owns exactly one native object and releases it exactly
//! once. Calls into the engine go through [`NativeHandle::with`], which holds
//! a shared lock for the duration of the call so that `release` can never
//! free the object underneath an in-flight call.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::diagnostics;
use crate::error::{BridgeError, Result};
use crate::native::{NativeEngine, RawHandle};

/// Which native object a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Media,
    Player,
    ThumbnailRequest,
}

impl HandleKind {
    pub fn name(self) -> &'static str {
        match self {
            HandleKind::Media => "media",
            HandleKind::Player => "media player",
            HandleKind::ThumbnailRequest => "thumbnail request",
        }
    }
}

impl std::fmt::Display for HandleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Exclusive owner of one native object.
pub struct NativeHandle {
    kind: HandleKind,
    address: usize,
    /// `None` once released
    raw: RwLock<Option<RawHandle>>,
    engine: Arc<dyn NativeEngine>,
}

impl NativeHandle {
    /// Takes ownership of a handle the engine just created.
    ///
    /// Fails if the address is already owned by another live wrapper.
    pub fn adopt(kind: HandleKind, raw: RawHandle, engine: Arc<dyn NativeEngine>) -> Result<Self> {
        if !diagnostics::register_handle(raw.addr()) {
            tracing::error!(
                "native {kind} handle {:#x} is already owned by another wrapper",
                raw.addr()
            );
            return Err(BridgeError::InvalidArgument(format!(
                "native {kind} handle {:#x} already owned",
                raw.addr()
            )));
        }
        #[cfg(debug_assertions)]
        diagnostics::record_handle_created();

        tracing::trace!("adopted native {kind} handle {:#x}", raw.addr());
        Ok(Self {
            kind,
            address: raw.addr(),
            raw: RwLock::new(Some(raw)),
            engine,
        })
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Address of the native object. Stays valid as an identifier after
    /// release but must not be passed back to the engine.
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn is_released(&self) -> bool {
        self.raw.read().is_none()
    }

    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.engine
    }

    /// Runs `f` with the live raw handle.
    ///
    /// Uses a recursive read lock so a call made from inside another call on
    /// the same thread cannot deadlock against a queued release.
    pub fn with<R>(&self, f: impl FnOnce(&dyn NativeEngine, RawHandle) -> R) -> Result<R> {
        let guard = self.raw.read_recursive();
        match *guard {
            Some(raw) => {
                debug_assert!(
                    diagnostics::is_live(self.address),
                    "native {} handle {:#x} used after leaving the registry",
                    self.kind,
                    self.address
                );
                Ok(f(self.engine.as_ref(), raw))
            }
            None => Err(BridgeError::AlreadyReleased {
                object: self.kind.name(),
            }),
        }
    }

    /// Releases the native object.
    ///
    /// A second call is a programming error: it is logged and reported as
    /// [`BridgeError::HandleAlreadyReleased`] without touching the engine.
    pub fn release(&self) -> Result<()> {
        let raw = {
            let mut guard = self.raw.write();
            match guard.take() {
                Some(raw) => raw,
                None => {
                    tracing::error!(
                        "native {} handle {:#x} released twice",
                        self.kind,
                        self.address
                    );
                    return Err(BridgeError::HandleAlreadyReleased { kind: self.kind });
                }
            }
        };

        if !diagnostics::unregister_handle(raw.addr()) {
            tracing::error!(
                "native {} handle {:#x} unknown to registry (possible double release)",
                self.kind,
                raw.addr()
            );
            return Err(BridgeError::HandleAlreadyReleased { kind: self.kind });
        }

        match self.kind {
            HandleKind::Media => self.engine.media_release(raw),
            HandleKind::Player => self.engine.player_release(raw),
            HandleKind::ThumbnailRequest => self.engine.media_thumbnail_request_destroy(raw),
        }

        #[cfg(debug_assertions)]
        diagnostics::record_handle_released();

        tracing::trace!("released native {} handle {:#x}", self.kind, raw.addr());
        Ok(())
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        if self.raw.get_mut().is_some() {
            tracing::warn!(
                "native {} handle {:#x} dropped without release; releasing now",
                self.kind,
                self.address
            );
            let _ = self.release();
        }
    }
}

impl std::fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHandle")
            .field("kind", &self.kind)
            .field("address", &format_args!("{:#x}", self.address))
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedEngine;

    fn adopt_media(engine: &Arc<SimulatedEngine>) -> NativeHandle {
        let raw = engine
            .media_new_location(c"file:///clip.mp4")
            .expect("simulated media");
        NativeHandle::adopt(HandleKind::Media, raw, engine.clone()).unwrap()
    }

    #[test]
    fn test_release_once() {
        let engine = SimulatedEngine::new();
        let handle = adopt_media(&engine);
        let addr = handle.address();

        assert!(!handle.is_released());
        assert!(handle.release().is_ok());
        assert!(handle.is_released());
        assert_eq!(engine.release_count(addr), 1);
    }

    #[test]
    fn test_double_release_is_caught() {
        let engine = SimulatedEngine::new();
        let handle = adopt_media(&engine);
        let addr = handle.address();

        handle.release().unwrap();
        assert_eq!(
            handle.release(),
            Err(BridgeError::HandleAlreadyReleased {
                kind: HandleKind::Media
            })
        );
        assert_eq!(engine.release_count(addr), 1);
    }

    #[test]
    fn test_registry_tracks_ownership() {
        let engine = SimulatedEngine::new();
        let handle = adopt_media(&engine);
        let addr = handle.address();

        assert!(diagnostics::is_live(addr));
        assert_eq!(handle.with(|_, raw| raw.addr()), Ok(addr));
        handle.release().unwrap();
        assert!(!diagnostics::is_live(addr));
    }

    #[test]
    fn test_with_after_release_fails() {
        let engine = SimulatedEngine::new();
        let handle = adopt_media(&engine);
        handle.release().unwrap();

        let result = handle.with(|_, raw| raw.addr());
        assert_eq!(result, Err(BridgeError::AlreadyReleased { object: "media" }));
    }

    #[test]
    fn test_second_owner_rejected() {
        let engine = SimulatedEngine::new();
        let handle = adopt_media(&engine);
        let raw = RawHandle::from_addr(handle.address()).unwrap();

        let dyn_engine: Arc<dyn NativeEngine> = engine.clone();
        assert!(NativeHandle::adopt(HandleKind::Media, raw, dyn_engine).is_err());
        handle.release().unwrap();
    }

    #[test]
    fn test_drop_releases() {
        let engine = SimulatedEngine::new();
        let addr = {
            let handle = adopt_media(&engine);
            handle.address()
        };
        assert_eq!(engine.release_count(addr), 1);
    }
}
