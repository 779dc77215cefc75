//! Media players.
//!
//! Sub-services are released in this order, then the native player:
//!
//! 1. events, so teardown noise never reaches listeners
//! 2. controls (stops playback; no video callback runs after this)
//! 3. direct video, when present
//! 4. media (detached from the player and released)

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::BridgeConfig;
use crate::direct::{BufferFormatCallback, DirectVideo, RenderCallback};
use crate::error::{check_status, BridgeError, Result};
use crate::event::{EventKind, PlayerEvent};
use crate::handle::{HandleKind, NativeHandle};
use crate::latch::LatchOutcome;
use crate::lifecycle::{Coordinator, Lifecycle, LifecycleState, SubService};
use crate::media::Media;
use crate::native::NativeEngine;
use crate::registration::{EventRegistration, EventService};

/// Renderer pair for a direct-rendering player.
pub(crate) struct DirectCallbacks {
    pub format: Arc<dyn BufferFormatCallback>,
    pub render: Arc<dyn RenderCallback>,
}

pub struct MediaPlayer {
    coordinator: Coordinator,
    events: Arc<EventService<PlayerEvent>>,
    controls: Arc<ControlsService>,
    media: Arc<MediaService>,
    video: Option<Arc<DirectVideo>>,
}

impl MediaPlayer {
    pub(crate) fn new(
        engine: &Arc<dyn NativeEngine>,
        config: &BridgeConfig,
        direct: Option<DirectCallbacks>,
    ) -> Result<Self> {
        let raw = engine.player_new().ok_or(BridgeError::NativeCallFailure {
            call: "player_new",
            status: -1,
        })?;
        let handle = Arc::new(NativeHandle::adopt(HandleKind::Player, raw, engine.clone())?);

        match Self::assemble(handle.clone(), config, direct) {
            Ok(player) => {
                tracing::debug!(
                    "created media player {:#x} (direct rendering: {})",
                    player.address(),
                    player.video.is_some()
                );
                Ok(player)
            }
            Err(err) => {
                let _ = handle.release();
                Err(err)
            }
        }
    }

    fn assemble(
        handle: Arc<NativeHandle>,
        config: &BridgeConfig,
        direct: Option<DirectCallbacks>,
    ) -> Result<Self> {
        let lifecycle = Arc::new(Lifecycle::new("media player"));
        let manager = handle
            .with(|engine, raw| engine.player_event_manager(raw))?
            .ok_or(BridgeError::NativeCallFailure {
                call: "player_event_manager",
                status: -1,
            })?;
        let registration = EventRegistration::register(
            handle.engine().clone(),
            manager,
            handle.address(),
            config.trace_events,
        )?;

        let events = Arc::new(EventService::new(lifecycle.clone(), registration));
        let controls = Arc::new(ControlsService {
            lifecycle: lifecycle.clone(),
            handle: handle.clone(),
            events: events.registration().clone(),
            start_timeout: config.start_timeout,
        });
        let video = match direct {
            Some(callbacks) => match DirectVideo::install(
                &handle,
                lifecycle.clone(),
                callbacks.format,
                callbacks.render,
                config.buffer_alignment,
            ) {
                Ok(video) => Some(Arc::new(video)),
                Err(err) => {
                    events.registration().release();
                    return Err(err);
                }
            },
            None => None,
        };
        let media = Arc::new(MediaService {
            lifecycle: lifecycle.clone(),
            handle: handle.clone(),
            current: Mutex::new(None),
        });

        let mut services: Vec<Arc<dyn SubService>> = vec![events.clone(), controls.clone()];
        if let Some(video) = &video {
            services.push(video.clone());
        }
        services.push(media.clone());

        Ok(Self {
            coordinator: Coordinator::new(lifecycle, services, handle),
            events,
            controls,
            media,
            video,
        })
    }

    pub fn address(&self) -> usize {
        self.coordinator.handle().address()
    }

    pub fn state(&self) -> LifecycleState {
        self.coordinator.lifecycle().state()
    }

    pub fn is_released(&self) -> bool {
        self.state() == LifecycleState::Released
    }

    pub fn events(&self) -> &EventService<PlayerEvent> {
        &self.events
    }

    pub fn controls(&self) -> &ControlsService {
        &self.controls
    }

    pub fn media(&self) -> &MediaService {
        &self.media
    }

    /// Direct-rendering service, for players created with renderers.
    pub fn video(&self) -> Option<&DirectVideo> {
        self.video.as_deref()
    }

    pub fn release(&self) -> Result<()> {
        self.coordinator.release()
    }
}

impl Drop for MediaPlayer {
    fn drop(&mut self) {
        if self.state() != LifecycleState::Released {
            if let Err(e) = self.release() {
                tracing::error!(
                    "media player {:#x}: release on drop failed: {e}",
                    self.address()
                );
            }
        }
    }
}

impl std::fmt::Debug for MediaPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPlayer")
            .field("coordinator", &self.coordinator)
            .field("direct", &self.video.is_some())
            .finish()
    }
}

// =========================================================================
// Controls
// =========================================================================

/// Playback commands.
pub struct ControlsService {
    lifecycle: Arc<Lifecycle>,
    handle: Arc<NativeHandle>,
    events: Arc<EventRegistration<PlayerEvent>>,
    start_timeout: Duration,
}

impl ControlsService {
    /// Starts playback asynchronously.
    pub fn play(&self) -> Result<()> {
        self.lifecycle.ensure_active()?;
        let status = self.handle.with(|engine, raw| engine.player_play(raw))?;
        check_status("player_play", status)
    }

    /// Starts playback and waits for it to begin, using the configured
    /// start timeout.
    pub fn start(&self) -> Result<bool> {
        self.start_with_timeout(self.start_timeout)
    }

    /// Starts playback and blocks until `Playing` (`Ok(true)`),
    /// `EncounteredError` or player release (`Ok(false)`), or the timeout
    /// ([`BridgeError::LatchTimeout`]).
    ///
    /// Must not be called from a listener: the event that resolves the wait
    /// is delivered on the thread that would be blocked.
    pub fn start_with_timeout(&self, timeout: Duration) -> Result<bool> {
        self.lifecycle.ensure_active()?;
        let latch = crate::latch::BlockingLatch::attach(
            &self.events,
            &[EventKind::Playing],
            &[EventKind::EncounteredError],
        )?;

        let status = self.handle.with(|engine, raw| engine.player_play(raw))?;
        if let Err(err) = check_status("player_play", status) {
            tracing::warn!("media player {:#x}: {err}", self.handle.address());
            return Ok(false);
        }

        let outcome = latch.wait_outcome(timeout)?;
        if outcome == LatchOutcome::Released {
            tracing::debug!(
                "media player {:#x}: released while starting",
                self.handle.address()
            );
        }
        Ok(outcome.is_success())
    }

    pub fn pause(&self) -> Result<()> {
        self.lifecycle.ensure_active()?;
        self.handle.with(|engine, raw| engine.player_pause(raw))
    }

    pub fn set_pause(&self, pause: bool) -> Result<()> {
        self.lifecycle.ensure_active()?;
        self.handle.with(|engine, raw| engine.player_set_pause(raw, pause))
    }

    pub fn stop(&self) -> Result<()> {
        self.lifecycle.ensure_active()?;
        let status = self.handle.with(|engine, raw| engine.player_stop(raw))?;
        check_status("player_stop", status)
    }
}

impl SubService for ControlsService {
    fn name(&self) -> &'static str {
        "controls"
    }

    fn release(&self) {
        match self.handle.with(|engine, raw| engine.player_stop(raw)) {
            Ok(status) => {
                if let Err(err) = check_status("player_stop", status) {
                    tracing::error!(
                        "media player {:#x}: {err} during release; video callbacks may still run",
                        self.handle.address()
                    );
                }
            }
            Err(err) => tracing::warn!(
                "media player {:#x}: stop skipped during release: {err}",
                self.handle.address()
            ),
        }
    }
}

// =========================================================================
// Media
// =========================================================================

/// The media set on the player. The player owns it from `set` onwards.
pub struct MediaService {
    lifecycle: Arc<Lifecycle>,
    handle: Arc<NativeHandle>,
    current: Mutex<Option<Media>>,
}

impl MediaService {
    /// Sets `media`, releasing the previously set item.
    pub fn set(&self, media: Media) -> Result<()> {
        self.lifecycle.ensure_active()?;
        media.ensure_active()?;
        self.handle.with(|engine, player| {
            media
                .handle()
                .with(|_, raw| engine.player_set_media(player, Some(raw)))
        })??;

        let previous = self.current.lock().replace(media);
        if let Some(previous) = previous {
            previous.release()?;
        }
        Ok(())
    }

    /// Unsets and releases the current media.
    pub fn clear(&self) -> Result<()> {
        self.lifecycle.ensure_active()?;
        self.handle
            .with(|engine, player| engine.player_set_media(player, None))?;
        let previous = self.current.lock().take();
        match previous {
            Some(previous) => previous.release(),
            None => Ok(()),
        }
    }

    pub fn is_set(&self) -> Result<bool> {
        self.lifecycle.ensure_active()?;
        Ok(self.current.lock().is_some())
    }

    /// Runs `f` with the current media, if any.
    pub fn with<R>(&self, f: impl FnOnce(&Media) -> R) -> Result<Option<R>> {
        self.lifecycle.ensure_active()?;
        Ok(self.current.lock().as_ref().map(f))
    }
}

impl SubService for MediaService {
    fn name(&self) -> &'static str {
        "media"
    }

    fn release(&self) {
        let Some(media) = self.current.lock().take() else {
            return;
        };
        let _ = self
            .handle
            .with(|engine, player| engine.player_set_media(player, None));
        if let Err(e) = media.release() {
            tracing::warn!("media {:#x}: {e}", media.address());
        }
    }
}
