//! The call interface consumed from the native media engine.
//!
//! Everything here mirrors the C ABI of the engine: opaque object pointers,
//! `#[repr(C)]` event payloads that are only valid for the duration of a
//! callback, and `extern "C"` callback signatures. [`NativeEngine`] is the
//! seam: a production binding forwards each method to the engine's exported
//! symbols, tests use [`SimulatedEngine`](crate::simulated::SimulatedEngine).

use std::ffi::{c_char, c_void, CStr};
use std::ptr::NonNull;

/// Opaque pointer to a native-side object.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(NonNull<c_void>);

// SAFETY: RawHandle is an opaque token. It is never dereferenced on the Rust
// side; the engine documents its object pointers as usable from any thread.
unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

impl RawHandle {
    /// Wraps a pointer returned by the engine. Returns `None` for NULL.
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Builds a handle from an address (for engines that hand out ids).
    pub fn from_addr(addr: usize) -> Option<Self> {
        Self::from_ptr(addr as *mut c_void)
    }

    /// The raw pointer to pass back into the engine.
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// The address, used as a registry key.
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

/// Raw event type codes (libvlc numbering).
pub mod event_type {
    pub const MEDIA_META_CHANGED: i32 = 0;
    pub const MEDIA_SUB_ITEM_ADDED: i32 = 1;
    pub const MEDIA_DURATION_CHANGED: i32 = 2;
    pub const MEDIA_PARSED_CHANGED: i32 = 3;
    pub const MEDIA_FREED: i32 = 4;
    pub const MEDIA_STATE_CHANGED: i32 = 5;
    pub const MEDIA_SUB_ITEM_TREE_ADDED: i32 = 6;
    pub const MEDIA_THUMBNAIL_GENERATED: i32 = 7;

    pub const PLAYER_MEDIA_CHANGED: i32 = 0x100;
    pub const PLAYER_OPENING: i32 = 0x102;
    pub const PLAYER_BUFFERING: i32 = 0x103;
    pub const PLAYER_PLAYING: i32 = 0x104;
    pub const PLAYER_PAUSED: i32 = 0x105;
    pub const PLAYER_STOPPED: i32 = 0x106;
    pub const PLAYER_END_REACHED: i32 = 0x109;
    pub const PLAYER_ENCOUNTERED_ERROR: i32 = 0x10a;
    pub const PLAYER_TIME_CHANGED: i32 = 0x10b;
    pub const PLAYER_POSITION_CHANGED: i32 = 0x10c;
    pub const PLAYER_LENGTH_CHANGED: i32 = 0x111;
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MetaChangedPayload {
    pub meta_type: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SubItemPayload {
    pub item: *mut c_void,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DurationChangedPayload {
    pub new_duration: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ParsedChangedPayload {
    pub new_status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StateChangedPayload {
    pub new_state: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailGeneratedPayload {
    /// Native picture, valid only during the callback. NULL on failure.
    pub picture: *mut c_void,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MediaChangedPayload {
    pub new_media: *mut c_void,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BufferingPayload {
    pub new_cache: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TimeChangedPayload {
    pub new_time: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PositionChangedPayload {
    pub new_position: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LengthChangedPayload {
    pub new_length: i64,
}

/// Kind-specific event data. Which field is live is decided by
/// [`RawEvent::event_type`].
#[repr(C)]
#[derive(Clone, Copy)]
pub union RawEventPayload {
    pub meta_changed: MetaChangedPayload,
    pub sub_item: SubItemPayload,
    pub duration_changed: DurationChangedPayload,
    pub parsed_changed: ParsedChangedPayload,
    pub state_changed: StateChangedPayload,
    pub thumbnail_generated: ThumbnailGeneratedPayload,
    pub media_changed: MediaChangedPayload,
    pub buffering: BufferingPayload,
    pub time_changed: TimeChangedPayload,
    pub position_changed: PositionChangedPayload,
    pub length_changed: LengthChangedPayload,
}

impl RawEventPayload {
    /// Payload for events that carry no data.
    pub const fn empty() -> Self {
        Self {
            length_changed: LengthChangedPayload { new_length: 0 },
        }
    }
}

/// Event structure passed to [`RawEventCallback`]. Only valid for the
/// duration of the callback.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawEvent {
    pub event_type: i32,
    /// The object that raised the event
    pub object: *mut c_void,
    pub u: RawEventPayload,
}

impl RawEvent {
    pub fn new(event_type: i32, object: *mut c_void, u: RawEventPayload) -> Self {
        Self {
            event_type,
            object,
            u,
        }
    }
}

impl std::fmt::Debug for RawEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawEvent")
            .field("event_type", &format_args!("{:#x}", self.event_type))
            .field("object", &self.object)
            .finish_non_exhaustive()
    }
}

/// Event callback registered with an event manager.
pub type RawEventCallback = unsafe extern "C" fn(event: *const RawEvent, user_data: *mut c_void);

/// Maximum number of picture planes the engine negotiates.
pub const MAX_PLANES: usize = 5;

/// Format negotiation callback. `chroma` points at 4 writable bytes,
/// `pitches` and `lines` at [`MAX_PLANES`] entries each. Returns the number
/// of picture buffers allocated, 0 on failure.
pub type VideoFormatSetup = unsafe extern "C" fn(
    opaque: *mut *mut c_void,
    chroma: *mut c_char,
    width: *mut u32,
    height: *mut u32,
    pitches: *mut u32,
    lines: *mut u32,
) -> u32;

/// Releases whatever [`VideoFormatSetup`] allocated.
pub type VideoFormatCleanup = unsafe extern "C" fn(opaque: *mut c_void);

/// Fills `planes` with writable plane pointers; returns a picture id.
pub type VideoLock = unsafe extern "C" fn(opaque: *mut c_void, planes: *mut *mut c_void) -> *mut c_void;

/// Called once the engine has finished writing a frame.
pub type VideoUnlock =
    unsafe extern "C" fn(opaque: *mut c_void, picture: *mut c_void, planes: *const *mut c_void);

/// Called when a decoded frame is due for display.
pub type VideoDisplay = unsafe extern "C" fn(opaque: *mut c_void, picture: *mut c_void);

/// The engine's stable call interface.
///
/// Status-returning calls use 0 for success and a negative value for
/// failure. Handle-returning calls return `None` when the engine returned
/// NULL. Methods taking `*mut c_void` user data store it verbatim and hand
/// it back on every callback.
pub trait NativeEngine: Send + Sync + 'static {
    // Media
    fn media_new_location(&self, mrl: &CStr) -> Option<RawHandle>;
    fn media_release(&self, media: RawHandle);
    fn media_event_manager(&self, media: RawHandle) -> Option<RawHandle>;
    fn media_add_option(&self, media: RawHandle, option: &CStr) -> i32;
    fn media_parse(&self, media: RawHandle, flags: i32, timeout_ms: i32) -> i32;
    fn media_parse_stop(&self, media: RawHandle);

    // Thumbnails
    #[allow(clippy::too_many_arguments)]
    fn media_thumbnail_request_by_time(
        &self,
        media: RawHandle,
        time_ms: i64,
        speed: i32,
        width: u32,
        height: u32,
        picture_type: i32,
        timeout_ms: i64,
    ) -> Option<RawHandle>;
    #[allow(clippy::too_many_arguments)]
    fn media_thumbnail_request_by_pos(
        &self,
        media: RawHandle,
        position: f32,
        speed: i32,
        width: u32,
        height: u32,
        picture_type: i32,
        timeout_ms: i64,
    ) -> Option<RawHandle>;
    fn media_thumbnail_request_cancel(&self, request: RawHandle);
    fn media_thumbnail_request_destroy(&self, request: RawHandle);

    // Pictures (only valid inside the thumbnail callback)
    fn picture_width(&self, picture: RawHandle) -> u32;
    fn picture_height(&self, picture: RawHandle) -> u32;
    fn picture_stride(&self, picture: RawHandle) -> u32;
    fn picture_type(&self, picture: RawHandle) -> i32;
    fn picture_time(&self, picture: RawHandle) -> i64;
    /// Pointer and length of the encoded picture bytes.
    fn picture_buffer(&self, picture: RawHandle) -> (*const u8, usize);

    // Player
    fn player_new(&self) -> Option<RawHandle>;
    fn player_release(&self, player: RawHandle);
    fn player_event_manager(&self, player: RawHandle) -> Option<RawHandle>;
    fn player_set_media(&self, player: RawHandle, media: Option<RawHandle>);
    fn player_play(&self, player: RawHandle) -> i32;
    fn player_set_pause(&self, player: RawHandle, pause: bool);
    fn player_pause(&self, player: RawHandle);
    /// Stops playback. Once this returns no further video callbacks run.
    fn player_stop(&self, player: RawHandle) -> i32;

    // Direct rendering
    fn video_set_callbacks(
        &self,
        player: RawHandle,
        lock: VideoLock,
        unlock: Option<VideoUnlock>,
        display: Option<VideoDisplay>,
        opaque: *mut c_void,
    );
    fn video_set_format_callbacks(
        &self,
        player: RawHandle,
        setup: VideoFormatSetup,
        cleanup: Option<VideoFormatCleanup>,
    );

    // Events
    fn event_attach(
        &self,
        manager: RawHandle,
        event_type: i32,
        callback: RawEventCallback,
        user_data: *mut c_void,
    ) -> i32;
    fn event_detach(
        &self,
        manager: RawHandle,
        event_type: i32,
        callback: RawEventCallback,
        user_data: *mut c_void,
    );
}
