//! Media items.
//!
//! A [`Media`] owns one native media handle and a fixed set of sub-services,
//! created in this order and released in the same order before the handle:
//!
//! 1. events
//! 2. parsing
//! 3. options
//! 4. thumbnails (outstanding requests are cancelled and destroyed)
//! 5. user data

use std::any::Any;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::BridgeConfig;
use crate::error::{check_status, BridgeError, Result};
use crate::event::{MediaEvent, PictureType};
use crate::handle::{HandleKind, NativeHandle};
use crate::lifecycle::{Coordinator, Lifecycle, LifecycleState, SubService};
use crate::native::NativeEngine;
use crate::registration::{EventRegistration, EventService};

fn c_string(what: &str, value: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| BridgeError::InvalidArgument(format!("{what} contains a NUL byte")))
}

/// A media item created from an MRL.
pub struct Media {
    mrl: String,
    coordinator: Coordinator,
    events: Arc<EventService<MediaEvent>>,
    parsing: Arc<ParseService>,
    options: Arc<OptionsService>,
    thumbnails: Arc<ThumbnailService>,
    user_data: Arc<UserDataService>,
}

impl Media {
    pub(crate) fn new(
        engine: &Arc<dyn NativeEngine>,
        config: &BridgeConfig,
        mrl: &str,
        options: &[&str],
    ) -> Result<Self> {
        let c_mrl = c_string("MRL", mrl)?;
        let raw = engine
            .media_new_location(&c_mrl)
            .ok_or(BridgeError::NativeCallFailure {
                call: "media_new_location",
                status: -1,
            })?;
        let handle = Arc::new(NativeHandle::adopt(HandleKind::Media, raw, engine.clone())?);

        match Self::assemble(mrl, handle.clone(), config) {
            Ok(media) => {
                media.options.add_all(options)?;
                tracing::debug!("created media {:#x} for {mrl}", media.address());
                Ok(media)
            }
            Err(err) => {
                let _ = handle.release();
                Err(err)
            }
        }
    }

    fn assemble(mrl: &str, handle: Arc<NativeHandle>, config: &BridgeConfig) -> Result<Self> {
        let lifecycle = Arc::new(Lifecycle::new("media"));
        let manager = handle
            .with(|engine, raw| engine.media_event_manager(raw))?
            .ok_or(BridgeError::NativeCallFailure {
                call: "media_event_manager",
                status: -1,
            })?;
        let registration = EventRegistration::register(
            handle.engine().clone(),
            manager,
            handle.address(),
            config.trace_events,
        )?;

        let events = Arc::new(EventService::new(lifecycle.clone(), registration));
        let parsing = Arc::new(ParseService {
            lifecycle: lifecycle.clone(),
            handle: handle.clone(),
            pending: AtomicBool::new(false),
        });
        let options = Arc::new(OptionsService {
            lifecycle: lifecycle.clone(),
            handle: handle.clone(),
        });
        let thumbnails = Arc::new(ThumbnailService {
            lifecycle: lifecycle.clone(),
            media: handle.clone(),
            outstanding: Mutex::new(Vec::new()),
        });
        let user_data = Arc::new(UserDataService {
            lifecycle: lifecycle.clone(),
            value: Mutex::new(None),
        });

        let services: Vec<Arc<dyn SubService>> = vec![
            events.clone(),
            parsing.clone(),
            options.clone(),
            thumbnails.clone(),
            user_data.clone(),
        ];
        Ok(Self {
            mrl: mrl.to_string(),
            coordinator: Coordinator::new(lifecycle, services, handle),
            events,
            parsing,
            options,
            thumbnails,
            user_data,
        })
    }

    pub fn mrl(&self) -> &str {
        &self.mrl
    }

    /// Native address, usable as an identifier only.
    pub fn address(&self) -> usize {
        self.coordinator.handle().address()
    }

    pub fn state(&self) -> LifecycleState {
        self.coordinator.lifecycle().state()
    }

    pub fn is_released(&self) -> bool {
        self.state() == LifecycleState::Released
    }

    pub fn events(&self) -> &EventService<MediaEvent> {
        &self.events
    }

    pub fn parsing(&self) -> &ParseService {
        &self.parsing
    }

    pub fn options(&self) -> &OptionsService {
        &self.options
    }

    pub fn thumbnails(&self) -> &ThumbnailService {
        &self.thumbnails
    }

    pub fn user_data(&self) -> &UserDataService {
        &self.user_data
    }

    /// Releases the sub-services, then the native media.
    pub fn release(&self) -> Result<()> {
        self.coordinator.release()
    }

    pub(crate) fn handle(&self) -> &Arc<NativeHandle> {
        self.coordinator.handle()
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        self.coordinator.ensure_active()
    }
}

impl Drop for Media {
    fn drop(&mut self) {
        if self.state() != LifecycleState::Released {
            if let Err(e) = self.release() {
                tracing::error!("media {:#x}: release on drop failed: {e}", self.address());
            }
        }
    }
}

impl std::fmt::Debug for Media {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Media")
            .field("mrl", &self.mrl)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

// =========================================================================
// Parsing
// =========================================================================

/// Parse request flags (bitwise combinable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParseFlags(pub i32);

impl ParseFlags {
    pub const LOCAL: ParseFlags = ParseFlags(0x00);
    pub const NETWORK: ParseFlags = ParseFlags(0x01);
    pub const FETCH_LOCAL: ParseFlags = ParseFlags(0x02);
    pub const FETCH_NETWORK: ParseFlags = ParseFlags(0x04);
    pub const DO_INTERACT: ParseFlags = ParseFlags(0x08);
}

impl std::ops::BitOr for ParseFlags {
    type Output = ParseFlags;

    fn bitor(self, rhs: Self) -> Self {
        ParseFlags(self.0 | rhs.0)
    }
}

/// Asynchronous metadata parsing. The outcome arrives as
/// [`MediaEvent::ParsedChanged`].
pub struct ParseService {
    lifecycle: Arc<Lifecycle>,
    handle: Arc<NativeHandle>,
    pending: AtomicBool,
}

impl ParseService {
    pub fn parse(&self, flags: ParseFlags, timeout_ms: i32) -> Result<()> {
        self.lifecycle.ensure_active()?;
        let status = self
            .handle
            .with(|engine, raw| engine.media_parse(raw, flags.0, timeout_ms))?;
        check_status("media_parse", status)?;
        self.pending.store(true, Ordering::Release);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.lifecycle.ensure_active()?;
        self.pending.store(false, Ordering::Release);
        self.handle.with(|engine, raw| engine.media_parse_stop(raw))
    }
}

impl SubService for ParseService {
    fn name(&self) -> &'static str {
        "parsing"
    }

    fn release(&self) {
        if self.pending.swap(false, Ordering::AcqRel) {
            let _ = self.handle.with(|engine, raw| engine.media_parse_stop(raw));
        }
    }
}

// =========================================================================
// Options
// =========================================================================

pub struct OptionsService {
    lifecycle: Arc<Lifecycle>,
    handle: Arc<NativeHandle>,
}

impl OptionsService {
    /// Adds one option, e.g. `:no-audio`.
    pub fn add(&self, option: &str) -> Result<()> {
        self.lifecycle.ensure_active()?;
        let option = c_string("option", option)?;
        let status = self
            .handle
            .with(|engine, raw| engine.media_add_option(raw, &option))?;
        check_status("media_add_option", status)
    }

    /// Adds options in order, stopping at the first failure.
    pub fn add_all(&self, options: &[&str]) -> Result<()> {
        options.iter().try_for_each(|option| self.add(option))
    }
}

impl SubService for OptionsService {
    fn name(&self) -> &'static str {
        "options"
    }

    fn release(&self) {}
}

// =========================================================================
// Thumbnails
// =========================================================================

/// Seek precision for thumbnail requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThumbnailSpeed {
    #[default]
    Precise,
    Fast,
}

impl ThumbnailSpeed {
    fn as_raw(self) -> i32 {
        match self {
            ThumbnailSpeed::Precise => 0,
            ThumbnailSpeed::Fast => 1,
        }
    }
}

/// A thumbnail request.
///
/// The picture arrives as [`MediaEvent::ThumbnailGenerated`]. Dropping the
/// last clone destroys the native request, abandoning it if the picture has
/// not arrived yet.
#[derive(Debug, Clone)]
pub struct ThumbnailRequest {
    handle: Arc<RequestHandle>,
}

impl ThumbnailRequest {
    pub fn address(&self) -> usize {
        self.handle.0.address()
    }

    pub fn is_released(&self) -> bool {
        self.handle.0.is_released()
    }
}

#[derive(Debug)]
struct RequestHandle(NativeHandle);

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if self.0.is_released() {
            return;
        }
        if let Err(e) = self.0.release() {
            tracing::warn!("thumbnail request {:#x}: {e}", self.0.address());
        }
    }
}

pub struct ThumbnailService {
    lifecycle: Arc<Lifecycle>,
    media: Arc<NativeHandle>,
    /// Requests the application still holds
    outstanding: Mutex<Vec<Weak<RequestHandle>>>,
}

impl ThumbnailService {
    pub fn request_by_time(
        &self,
        time_ms: i64,
        speed: ThumbnailSpeed,
        width: u32,
        height: u32,
        picture_type: PictureType,
        timeout_ms: i64,
    ) -> Result<ThumbnailRequest> {
        self.lifecycle.ensure_active()?;
        let raw = self.media.with(|engine, media| {
            engine.media_thumbnail_request_by_time(
                media,
                time_ms,
                speed.as_raw(),
                width,
                height,
                picture_type.as_raw(),
                timeout_ms,
            )
        })?;
        self.track("media_thumbnail_request_by_time", raw)
    }

    /// `position` is a fraction of the duration in `0.0..=1.0`.
    pub fn request_by_position(
        &self,
        position: f32,
        speed: ThumbnailSpeed,
        width: u32,
        height: u32,
        picture_type: PictureType,
        timeout_ms: i64,
    ) -> Result<ThumbnailRequest> {
        self.lifecycle.ensure_active()?;
        if !(0.0..=1.0).contains(&position) {
            return Err(BridgeError::InvalidArgument(format!(
                "thumbnail position {position} outside 0..=1"
            )));
        }
        let raw = self.media.with(|engine, media| {
            engine.media_thumbnail_request_by_pos(
                media,
                position,
                speed.as_raw(),
                width,
                height,
                picture_type.as_raw(),
                timeout_ms,
            )
        })?;
        self.track("media_thumbnail_request_by_pos", raw)
    }

    fn track(
        &self,
        call: &'static str,
        raw: Option<crate::native::RawHandle>,
    ) -> Result<ThumbnailRequest> {
        let raw = raw.ok_or(BridgeError::NativeCallFailure { call, status: -1 })?;
        let handle = Arc::new(RequestHandle(NativeHandle::adopt(
            HandleKind::ThumbnailRequest,
            raw,
            self.media.engine().clone(),
        )?));
        let mut outstanding = self.outstanding.lock();
        prune(&mut outstanding);
        outstanding.push(Arc::downgrade(&handle));
        Ok(ThumbnailRequest { handle })
    }

    /// Asks the engine to abandon `request`. The request stays owned by
    /// this service until [`release_request`](Self::release_request) or
    /// media release.
    pub fn cancel(&self, request: &ThumbnailRequest) -> Result<()> {
        self.lifecycle.ensure_active()?;
        request
            .handle
            .0
            .with(|engine, raw| engine.media_thumbnail_request_cancel(raw))
    }

    /// Destroys a finished or cancelled request now, without waiting for
    /// its clones to drop.
    pub fn release_request(&self, request: ThumbnailRequest) -> Result<()> {
        self.lifecycle.ensure_active()?;
        self.outstanding
            .lock()
            .retain(|handle| !std::ptr::eq(handle.as_ptr(), Arc::as_ptr(&request.handle)));
        request.handle.0.release()
    }

    /// Requests still held by the application and not yet destroyed.
    pub fn outstanding(&self) -> usize {
        let mut outstanding = self.outstanding.lock();
        prune(&mut outstanding);
        outstanding.len()
    }
}

fn prune(outstanding: &mut Vec<Weak<RequestHandle>>) {
    outstanding.retain(|handle| handle.upgrade().is_some_and(|h| !h.0.is_released()));
}

impl SubService for ThumbnailService {
    fn name(&self) -> &'static str {
        "thumbnails"
    }

    fn release(&self) {
        let outstanding = std::mem::take(&mut *self.outstanding.lock());
        for request in outstanding.iter().filter_map(Weak::upgrade) {
            let handle = &request.0;
            if handle.is_released() {
                continue;
            }
            let _ = handle.with(|engine, raw| engine.media_thumbnail_request_cancel(raw));
            if let Err(e) = handle.release() {
                tracing::warn!("thumbnail request {:#x}: {e}", handle.address());
            }
        }
    }
}

// =========================================================================
// User data
// =========================================================================

/// One application value attached to the media.
pub struct UserDataService {
    lifecycle: Arc<Lifecycle>,
    value: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl UserDataService {
    pub fn set<T: Any + Send + Sync>(&self, value: T) -> Result<()> {
        self.lifecycle.ensure_active()?;
        *self.value.lock() = Some(Box::new(value));
        Ok(())
    }

    /// A clone of the value, if one of type `T` is set.
    pub fn get<T: Any + Clone>(&self) -> Result<Option<T>> {
        self.lifecycle.ensure_active()?;
        Ok(self
            .value
            .lock()
            .as_ref()
            .and_then(|value| value.downcast_ref::<T>())
            .cloned())
    }

    pub fn clear(&self) -> Result<()> {
        self.lifecycle.ensure_active()?;
        self.value.lock().take();
        Ok(())
    }
}

impl SubService for UserDataService {
    fn name(&self) -> &'static str {
        "user data"
    }

    fn release(&self) {
        self.value.lock().take();
    }
}
