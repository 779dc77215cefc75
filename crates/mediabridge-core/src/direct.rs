//! Direct rendering: zero-copy frame handoff to application code.
//!
//! The engine negotiates a format once it knows the source geometry
//! ([`video_format_setup`]), then for every frame asks for plane pointers
//! ([`video_lock`]), writes the picture, hands it back ([`video_unlock`]) and
//! asks for it to be shown ([`video_display`]). Plane memory comes from two
//! [`BufferPool`]s sized from the negotiated [`BufferFormat`] and reused
//! until the format changes: the engine only ever writes the back pool, and
//! `video_display` swaps it to the front, which is the only pool
//! [`DirectVideo::with_frame`] reads.
//!
//! The engine serializes video callbacks per player, and once
//! `player_stop` returns it makes no further ones. [`DirectVideo`] is
//! therefore released after the player has been stopped. If a frame is
//! still locked at release, the back pool stays alive until the engine
//! unlocks it or cleans up the format.

use std::collections::HashMap;
use std::ffi::{c_char, c_void};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::{Mutex, RwLock};

use crate::buffer::BufferPool;
#[cfg(debug_assertions)]
use crate::diagnostics;
use crate::error::{BridgeError, Result};
use crate::handle::NativeHandle;
use crate::lifecycle::{Lifecycle, SubService};
use crate::native::MAX_PLANES;
use crate::safety::callback_boundary_or;
use crate::trampoline::{next_token, token_to_user_data, user_data_to_token};

/// Pixel layout chosen by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferFormat {
    /// FourCC, e.g. `RV32`
    pub chroma: [u8; 4],
    pub width: u32,
    pub height: u32,
    /// Bytes per row, per plane
    pub pitches: Vec<u32>,
    /// Rows, per plane
    pub lines: Vec<u32>,
}

impl BufferFormat {
    pub fn new(chroma: [u8; 4], width: u32, height: u32, pitches: Vec<u32>, lines: Vec<u32>) -> Self {
        Self {
            chroma,
            width,
            height,
            pitches,
            lines,
        }
    }

    /// Packed 32-bit RGB, one plane.
    pub fn rv32(width: u32, height: u32) -> Self {
        Self::new(*b"RV32", width, height, vec![width * 4], vec![height])
    }

    /// Planar YUV 4:2:0, three planes.
    pub fn i420(width: u32, height: u32) -> Self {
        let chroma_width = width.div_ceil(2);
        let chroma_height = height.div_ceil(2);
        Self::new(
            *b"I420",
            width,
            height,
            vec![width, chroma_width, chroma_width],
            vec![height, chroma_height, chroma_height],
        )
    }

    pub fn plane_count(&self) -> usize {
        self.pitches.len()
    }

    /// `pitch * lines` for each plane.
    pub fn plane_sizes(&self) -> Vec<usize> {
        self.pitches
            .iter()
            .zip(&self.lines)
            .map(|(&pitch, &lines)| pitch as usize * lines as usize)
            .collect()
    }

    pub fn chroma_str(&self) -> String {
        String::from_utf8_lossy(&self.chroma).into_owned()
    }

    pub fn validate(&self) -> Result<()> {
        if self.pitches.len() != self.lines.len() {
            return Err(BridgeError::InvalidArgument(format!(
                "{} pitches but {} line counts",
                self.pitches.len(),
                self.lines.len()
            )));
        }
        if self.pitches.is_empty() || self.pitches.len() > MAX_PLANES {
            return Err(BridgeError::InvalidArgument(format!(
                "{} planes (expected 1..={MAX_PLANES})",
                self.pitches.len()
            )));
        }
        Ok(())
    }
}

/// Chooses the pixel format once the source geometry is known.
pub trait BufferFormatCallback: Send + Sync {
    fn buffer_format(&self, source_width: u32, source_height: u32) -> BufferFormat;

    /// Plane buffers for `format` are ready.
    fn allocated(&self, _format: &BufferFormat) {}

    /// The engine is done with the current format.
    fn cleanup(&self) {}
}

/// Receives each decoded frame.
///
/// Runs on an engine thread with the plane buffers locked. It must return
/// promptly and must not call back into the player.
pub trait RenderCallback: Send + Sync {
    fn display(&self, planes: &[&[u8]], format: &BufferFormat);
}

impl<F> RenderCallback for F
where
    F: Fn(&[&[u8]], &BufferFormat) + Send + Sync,
{
    fn display(&self, planes: &[&[u8]], format: &BufferFormat) {
        self(planes, format)
    }
}

struct RenderState {
    format: Option<BufferFormat>,
    /// Written by the engine between `video_lock` and `video_unlock`
    back: BufferPool,
    /// Last displayed frame
    front: BufferPool,
    front_ready: bool,
    locked: bool,
    /// Released by the owning player; freed once no frame is locked
    retired: bool,
}

impl RenderState {
    fn free(&mut self) {
        self.back.clear();
        self.front.clear();
        self.front_ready = false;
        self.format = None;
    }
}

struct RenderContext {
    token: u64,
    player: usize,
    format_callback: Arc<dyn BufferFormatCallback>,
    render_callback: Arc<dyn RenderCallback>,
    state: Mutex<RenderState>,
    frames: AtomicU64,
}

impl RenderContext {
    /// Records the negotiated format, reallocating only if it changed.
    fn configure(&self, format: &BufferFormat) -> Result<bool> {
        let mut state = self.state.lock();
        if state.retired {
            return Err(BridgeError::AlreadyReleased {
                object: "media player",
            });
        }
        if state.format.as_ref() == Some(format) && state.back.is_allocated() {
            return Ok(false);
        }
        let sizes = format.plane_sizes();
        state.format = None;
        state.front_ready = false;
        state.back.allocate(&sizes)?;
        state.front.allocate(&sizes)?;
        state.format = Some(format.clone());
        Ok(true)
    }

    /// Frees a retired context's buffers and forgets its token.
    fn finish_retire(&self) {
        {
            let mut state = self.state.lock();
            if !state.retired || state.locked {
                return;
            }
            state.free();
        }
        RENDER_TABLE.write().remove(&self.token);
        tracing::debug!(
            "media player {:#x}: video buffers freed after unlock",
            self.player
        );
    }
}

static RENDER_TABLE: LazyLock<RwLock<HashMap<u64, Arc<RenderContext>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

fn lookup(opaque: *mut c_void) -> Option<Arc<RenderContext>> {
    RENDER_TABLE.read().get(&user_data_to_token(opaque)).cloned()
}

/// Direct-rendering sub-service of a player.
pub struct DirectVideo {
    token: u64,
    lifecycle: Arc<Lifecycle>,
    context: Arc<RenderContext>,
}

impl DirectVideo {
    /// Installs the video callbacks on `player`.
    pub(crate) fn install(
        player: &NativeHandle,
        lifecycle: Arc<Lifecycle>,
        format_callback: Arc<dyn BufferFormatCallback>,
        render_callback: Arc<dyn RenderCallback>,
        alignment: usize,
    ) -> Result<Self> {
        let token = next_token();
        let context = Arc::new(RenderContext {
            token,
            player: player.address(),
            format_callback,
            render_callback,
            state: Mutex::new(RenderState {
                format: None,
                back: BufferPool::new(alignment)?,
                front: BufferPool::new(alignment)?,
                front_ready: false,
                locked: false,
                retired: false,
            }),
            frames: AtomicU64::new(0),
        });
        RENDER_TABLE.write().insert(token, context.clone());

        let installed = player.with(|engine, raw| {
            engine.video_set_format_callbacks(raw, video_format_setup, Some(video_format_cleanup));
            engine.video_set_callbacks(
                raw,
                video_lock,
                Some(video_unlock),
                Some(video_display),
                token_to_user_data(token),
            );
        });
        if let Err(err) = installed {
            RENDER_TABLE.write().remove(&token);
            return Err(err);
        }

        tracing::debug!(
            "media player {:#x}: direct rendering installed (token {token}, alignment {alignment})",
            player.address()
        );
        Ok(Self {
            token,
            lifecycle,
            context,
        })
    }

    /// Currently negotiated format, if any.
    pub fn format(&self) -> Result<Option<BufferFormat>> {
        self.lifecycle.ensure_active()?;
        Ok(self.context.state.lock().format.clone())
    }

    pub fn frames_rendered(&self) -> u64 {
        self.context.frames.load(Ordering::Relaxed)
    }

    /// How many times plane buffers were allocated.
    pub fn allocations(&self) -> u64 {
        self.context.state.lock().back.allocations()
    }

    /// Runs `f` over the most recently displayed frame. `None` until a
    /// frame has been displayed in the current format.
    ///
    /// The engine never writes the displayed frame, and a new frame only
    /// replaces it once `f` has returned.
    pub fn with_frame<R>(&self, f: impl FnOnce(&[&[u8]], &BufferFormat) -> R) -> Result<Option<R>> {
        self.lifecycle.ensure_active()?;
        let state = self.context.state.lock();
        let Some(format) = state.format.as_ref() else {
            return Ok(None);
        };
        if !state.front_ready {
            return Ok(None);
        }
        let planes: Vec<&[u8]> = state.front.buffers().iter().map(|b| b.as_slice()).collect();
        Ok(Some(f(&planes, format)))
    }
}

impl SubService for DirectVideo {
    fn name(&self) -> &'static str {
        "video"
    }

    fn release(&self) {
        {
            let mut state = self.context.state.lock();
            state.retired = true;
            if state.locked {
                tracing::warn!(
                    "media player {:#x}: frame still locked at release; keeping buffers until unlock",
                    self.context.player
                );
                return;
            }
            state.free();
        }
        RENDER_TABLE.write().remove(&self.token);
    }
}

impl std::fmt::Debug for DirectVideo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectVideo")
            .field("token", &self.token)
            .field("frames", &self.frames_rendered())
            .finish()
    }
}

// =========================================================================
// Video trampolines
// =========================================================================

#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn video_format_setup(
    opaque: *mut *mut c_void,
    chroma: *mut c_char,
    width: *mut u32,
    height: *mut u32,
    pitches: *mut u32,
    lines: *mut u32,
) -> u32 {
    callback_boundary_or(0, "video_format_setup", || {
        if opaque.is_null()
            || chroma.is_null()
            || width.is_null()
            || height.is_null()
            || pitches.is_null()
            || lines.is_null()
        {
            tracing::error!("video_format_setup: NULL argument");
            return 0;
        }
        // SAFETY: non-NULL pointers owned by the engine for this call.
        let Some(context) = lookup(unsafe { *opaque }) else {
            tracing::warn!("video_format_setup: unknown render token");
            return 0;
        };
        let (source_width, source_height) = unsafe { (*width, *height) };

        let format = context
            .format_callback
            .buffer_format(source_width, source_height);
        if let Err(err) = format.validate().and_then(|_| context.configure(&format)) {
            tracing::error!(
                "media player {:#x}: format negotiation failed: {err}",
                context.player
            );
            return 0;
        }

        // SAFETY: `chroma` has 4 writable bytes, `pitches`/`lines` have
        // MAX_PLANES entries each, and `validate` bounded the plane count.
        unsafe {
            std::ptr::copy_nonoverlapping(format.chroma.as_ptr().cast::<c_char>(), chroma, 4);
            *width = format.width;
            *height = format.height;
            for plane in 0..format.plane_count() {
                *pitches.add(plane) = format.pitches[plane];
                *lines.add(plane) = format.lines[plane];
            }
        }

        tracing::debug!(
            "media player {:#x}: {source_width}x{source_height} source -> {} {}x{} {:?}",
            context.player,
            format.chroma_str(),
            format.width,
            format.height,
            format.pitches
        );
        context.format_callback.allocated(&format);
        1
    })
}

pub extern "C" fn video_format_cleanup(opaque: *mut c_void) {
    callback_boundary_or((), "video_format_cleanup", || {
        if let Some(context) = lookup(opaque) {
            context.format_callback.cleanup();
            context.state.lock().locked = false;
            context.finish_retire();
        }
    })
}

#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn video_lock(opaque: *mut c_void, planes: *mut *mut c_void) -> *mut c_void {
    callback_boundary_or(std::ptr::null_mut(), "video_lock", || {
        if planes.is_null() {
            return std::ptr::null_mut();
        }
        let Some(context) = lookup(opaque) else {
            return std::ptr::null_mut();
        };
        let mut state = context.state.lock();
        if state.retired {
            return std::ptr::null_mut();
        }
        if !state.back.is_allocated() {
            tracing::warn!(
                "media player {:#x}: lock before format negotiation",
                context.player
            );
            return std::ptr::null_mut();
        }
        state.locked = true;
        for (index, buffer) in state.back.buffers_mut().iter_mut().enumerate() {
            // SAFETY: `planes` has MAX_PLANES slots; the pool holds at most
            // that many buffers.
            unsafe { *planes.add(index) = buffer.as_mut_ptr().cast::<c_void>() };
        }
        std::ptr::null_mut()
    })
}

pub extern "C" fn video_unlock(
    opaque: *mut c_void,
    _picture: *mut c_void,
    _planes: *const *mut c_void,
) {
    callback_boundary_or((), "video_unlock", || {
        if let Some(context) = lookup(opaque) {
            context.state.lock().locked = false;
            context.finish_retire();
        }
    })
}

pub extern "C" fn video_display(opaque: *mut c_void, _picture: *mut c_void) {
    callback_boundary_or((), "video_display", || {
        let Some(context) = lookup(opaque) else {
            return;
        };
        let mut state = context.state.lock();
        if state.retired || state.locked {
            return;
        }
        let Some(format) = state.format.as_ref() else {
            return;
        };
        let planes: Vec<&[u8]> = state.back.buffers().iter().map(|b| b.as_slice()).collect();
        context.render_callback.display(&planes, format);
        let state = &mut *state;
        std::mem::swap(&mut state.back, &mut state.front);
        state.front_ready = true;
        context.frames.fetch_add(1, Ordering::Relaxed);
        #[cfg(debug_assertions)]
        diagnostics::record_frame_rendered();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleKind;
    use crate::native::NativeEngine;
    use crate::simulated::SimulatedEngine;

    struct Rv32;

    impl BufferFormatCallback for Rv32 {
        fn buffer_format(&self, width: u32, height: u32) -> BufferFormat {
            BufferFormat::rv32(width, height)
        }
    }

    struct Discard;

    impl RenderCallback for Discard {
        fn display(&self, _planes: &[&[u8]], _format: &BufferFormat) {}
    }

    fn installed() -> (NativeHandle, DirectVideo) {
        let engine = SimulatedEngine::new();
        let raw = engine.player_new().unwrap();
        let handle = NativeHandle::adopt(HandleKind::Player, raw, engine).unwrap();
        let lifecycle = Arc::new(Lifecycle::new("media player"));
        lifecycle.activate();
        let video =
            DirectVideo::install(&handle, lifecycle, Arc::new(Rv32), Arc::new(Discard), 32).unwrap();
        (handle, video)
    }

    fn negotiate(token: u64, width: u32, height: u32) -> u32 {
        let mut opaque = token_to_user_data(token);
        let mut chroma = [0 as c_char; 4];
        let (mut width, mut height) = (width, height);
        let mut pitches = [0u32; MAX_PLANES];
        let mut lines = [0u32; MAX_PLANES];
        video_format_setup(
            &mut opaque,
            chroma.as_mut_ptr(),
            &mut width,
            &mut height,
            pitches.as_mut_ptr(),
            lines.as_mut_ptr(),
        )
    }

    /// Locks a frame and fills plane 0 with `value`.
    fn write_locked(opaque: *mut c_void, value: u8, len: usize) -> [*mut c_void; MAX_PLANES] {
        let mut planes = [std::ptr::null_mut::<c_void>(); MAX_PLANES];
        video_lock(opaque, planes.as_mut_ptr());
        assert!(!planes[0].is_null());
        // SAFETY: plane 0 of an 8x4 RV32 frame has `len` writable bytes.
        unsafe { std::ptr::write_bytes(planes[0].cast::<u8>(), value, len) };
        planes
    }

    #[test]
    fn test_displayed_frame_is_never_the_one_being_written() {
        let (handle, video) = installed();
        let opaque = token_to_user_data(video.token);
        let len = 8 * 4 * 4;
        assert_eq!(negotiate(video.token, 8, 4), 1);
        assert_eq!(video.with_frame(|_, _| ()).unwrap(), None);

        let planes = write_locked(opaque, 0xaa, len);
        video_unlock(opaque, std::ptr::null_mut(), planes.as_ptr());
        assert_eq!(video.with_frame(|_, _| ()).unwrap(), None);
        video_display(opaque, std::ptr::null_mut());

        // The next frame goes into the other buffer while the first is read.
        let planes = write_locked(opaque, 0x55, len);
        let shown = video
            .with_frame(|planes, _| planes[0].iter().all(|b| *b == 0xaa))
            .unwrap();
        assert_eq!(shown, Some(true));
        video_unlock(opaque, std::ptr::null_mut(), planes.as_ptr());
        video_display(opaque, std::ptr::null_mut());

        let shown = video
            .with_frame(|planes, _| planes[0].iter().all(|b| *b == 0x55))
            .unwrap();
        assert_eq!(shown, Some(true));
        assert_eq!(video.frames_rendered(), 2);
        assert_eq!(video.allocations(), 1);

        video.release();
        handle.release().unwrap();
    }

    #[test]
    fn test_release_while_locked_keeps_buffers_until_unlock() {
        let (handle, video) = installed();
        let opaque = token_to_user_data(video.token);
        let len = 8 * 4 * 4;
        assert_eq!(negotiate(video.token, 8, 4), 1);

        let planes = write_locked(opaque, 0x11, len);
        video.release();
        assert!(lookup(opaque).is_some());
        assert!(video.context.state.lock().back.is_allocated());
        // SAFETY: the back pool is still allocated, so the engine may finish
        // the frame it started.
        unsafe { std::ptr::write_bytes(planes[0].cast::<u8>(), 0x22, len) };

        let mut refused = [std::ptr::null_mut::<c_void>(); MAX_PLANES];
        video_lock(opaque, refused.as_mut_ptr());
        assert!(refused[0].is_null());

        video_unlock(opaque, std::ptr::null_mut(), planes.as_ptr());
        video_display(opaque, std::ptr::null_mut());
        assert!(lookup(opaque).is_none());
        assert!(!video.context.state.lock().back.is_allocated());
        assert_eq!(video.frames_rendered(), 0);
        handle.release().unwrap();
    }

    #[test]
    fn test_release_unlocked_frees_immediately() {
        let (handle, video) = installed();
        let opaque = token_to_user_data(video.token);
        assert_eq!(negotiate(video.token, 8, 4), 1);

        video.release();
        assert!(lookup(opaque).is_none());
        assert!(!video.context.state.lock().front.is_allocated());
        assert_eq!(negotiate(video.token, 8, 4), 0);
        handle.release().unwrap();
    }

    #[test]
    fn test_cleanup_frees_retired_buffers() {
        let (handle, video) = installed();
        let opaque = token_to_user_data(video.token);
        assert_eq!(negotiate(video.token, 8, 4), 1);

        let _planes = write_locked(opaque, 0x33, 8 * 4 * 4);
        video.release();
        assert!(lookup(opaque).is_some());
        video_format_cleanup(opaque);
        assert!(lookup(opaque).is_none());
        handle.release().unwrap();
    }

    #[test]
    fn test_rv32_layout() {
        let format = BufferFormat::rv32(640, 360);
        assert_eq!(format.chroma_str(), "RV32");
        assert_eq!(format.plane_sizes(), vec![640 * 4 * 360]);
        assert!(format.validate().is_ok());
    }

    #[test]
    fn test_i420_layout_rounds_up() {
        let format = BufferFormat::i420(641, 361);
        assert_eq!(format.pitches, vec![641, 321, 321]);
        assert_eq!(format.lines, vec![361, 181, 181]);
        assert_eq!(format.plane_count(), 3);
    }

    #[test]
    fn test_validate_plane_counts() {
        let mismatched = BufferFormat::new(*b"RV32", 4, 4, vec![16], vec![]);
        assert!(mismatched.validate().is_err());
        let too_many = BufferFormat::new(*b"XXXX", 4, 4, vec![4; 6], vec![4; 6]);
        assert!(too_many.validate().is_err());
    }

    #[test]
    fn test_callbacks_ignore_unknown_token() {
        let mut planes = [std::ptr::null_mut::<c_void>(); MAX_PLANES];
        let opaque = token_to_user_data(next_token());
        assert!(video_lock(opaque, planes.as_mut_ptr()).is_null());
        assert!(planes[0].is_null());
        video_unlock(opaque, std::ptr::null_mut(), planes.as_ptr());
        video_display(opaque, std::ptr::null_mut());
        video_format_cleanup(opaque);
    }
}
