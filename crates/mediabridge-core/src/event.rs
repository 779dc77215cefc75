//! Typed events built from raw native payloads.
//!
//! A typed event is an immutable value that owns every byte it needs. It is
//! built inside the trampoline while the raw payload is still valid, then
//! handed to listeners.
//!
//! Listeners implement one trait per event source. Each trait has a single
//! dispatch entry point (`on_event`) whose default forwards to a no-op
//! method per event kind, so an implementation overrides only the kinds it
//! cares about.

use std::sync::Arc;

use crate::native::{event_type, NativeEngine, RawEvent, RawHandle};

/// Every event kind the bridge understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    // Media
    MetaChanged,
    SubItemAdded,
    DurationChanged,
    ParsedChanged,
    Freed,
    StateChanged,
    SubItemTreeAdded,
    ThumbnailGenerated,
    // Player
    MediaChanged,
    Opening,
    Buffering,
    Playing,
    Paused,
    Stopped,
    EndReached,
    EncounteredError,
    TimeChanged,
    PositionChanged,
    LengthChanged,
}

impl EventKind {
    pub fn from_raw(raw: i32) -> Option<Self> {
        use event_type::*;
        Some(match raw {
            MEDIA_META_CHANGED => EventKind::MetaChanged,
            MEDIA_SUB_ITEM_ADDED => EventKind::SubItemAdded,
            MEDIA_DURATION_CHANGED => EventKind::DurationChanged,
            MEDIA_PARSED_CHANGED => EventKind::ParsedChanged,
            MEDIA_FREED => EventKind::Freed,
            MEDIA_STATE_CHANGED => EventKind::StateChanged,
            MEDIA_SUB_ITEM_TREE_ADDED => EventKind::SubItemTreeAdded,
            MEDIA_THUMBNAIL_GENERATED => EventKind::ThumbnailGenerated,
            PLAYER_MEDIA_CHANGED => EventKind::MediaChanged,
            PLAYER_OPENING => EventKind::Opening,
            PLAYER_BUFFERING => EventKind::Buffering,
            PLAYER_PLAYING => EventKind::Playing,
            PLAYER_PAUSED => EventKind::Paused,
            PLAYER_STOPPED => EventKind::Stopped,
            PLAYER_END_REACHED => EventKind::EndReached,
            PLAYER_ENCOUNTERED_ERROR => EventKind::EncounteredError,
            PLAYER_TIME_CHANGED => EventKind::TimeChanged,
            PLAYER_POSITION_CHANGED => EventKind::PositionChanged,
            PLAYER_LENGTH_CHANGED => EventKind::LengthChanged,
            _ => return None,
        })
    }

    pub fn as_raw(self) -> i32 {
        use event_type::*;
        match self {
            EventKind::MetaChanged => MEDIA_META_CHANGED,
            EventKind::SubItemAdded => MEDIA_SUB_ITEM_ADDED,
            EventKind::DurationChanged => MEDIA_DURATION_CHANGED,
            EventKind::ParsedChanged => MEDIA_PARSED_CHANGED,
            EventKind::Freed => MEDIA_FREED,
            EventKind::StateChanged => MEDIA_STATE_CHANGED,
            EventKind::SubItemTreeAdded => MEDIA_SUB_ITEM_TREE_ADDED,
            EventKind::ThumbnailGenerated => MEDIA_THUMBNAIL_GENERATED,
            EventKind::MediaChanged => PLAYER_MEDIA_CHANGED,
            EventKind::Opening => PLAYER_OPENING,
            EventKind::Buffering => PLAYER_BUFFERING,
            EventKind::Playing => PLAYER_PLAYING,
            EventKind::Paused => PLAYER_PAUSED,
            EventKind::Stopped => PLAYER_STOPPED,
            EventKind::EndReached => PLAYER_END_REACHED,
            EventKind::EncounteredError => PLAYER_ENCOUNTERED_ERROR,
            EventKind::TimeChanged => PLAYER_TIME_CHANGED,
            EventKind::PositionChanged => PLAYER_POSITION_CHANGED,
            EventKind::LengthChanged => PLAYER_LENGTH_CHANGED,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::MetaChanged => "MetaChanged",
            EventKind::SubItemAdded => "SubItemAdded",
            EventKind::DurationChanged => "DurationChanged",
            EventKind::ParsedChanged => "ParsedChanged",
            EventKind::Freed => "Freed",
            EventKind::StateChanged => "StateChanged",
            EventKind::SubItemTreeAdded => "SubItemTreeAdded",
            EventKind::ThumbnailGenerated => "ThumbnailGenerated",
            EventKind::MediaChanged => "MediaChanged",
            EventKind::Opening => "Opening",
            EventKind::Buffering => "Buffering",
            EventKind::Playing => "Playing",
            EventKind::Paused => "Paused",
            EventKind::Stopped => "Stopped",
            EventKind::EndReached => "EndReached",
            EventKind::EncounteredError => "EncounteredError",
            EventKind::TimeChanged => "TimeChanged",
            EventKind::PositionChanged => "PositionChanged",
            EventKind::LengthChanged => "LengthChanged",
        }
    }
}

/// An event type the bridge can build from a raw payload and dispatch.
pub trait TypedEvent: Sized + Send + Sync + std::fmt::Debug + 'static {
    /// Listener trait object receiving this event type.
    type Listener: ?Sized + Send + Sync + 'static;

    /// Raw event kinds subscribed when a registration is created.
    const WATCHED: &'static [EventKind];

    /// Name of the object raising these events, for logs.
    const SOURCE: &'static str;

    /// Copies everything needed out of `raw`.
    ///
    /// Returns `None` for kinds this type does not represent.
    ///
    /// # Safety
    /// `raw` must be the event the engine passed to the current callback,
    /// with the payload field matching `raw.event_type` initialized.
    unsafe fn from_raw(raw: &RawEvent, engine: &dyn NativeEngine) -> Option<Self>;

    fn kind(&self) -> EventKind;

    /// Delivers this event to one listener.
    fn notify(&self, listener: &Self::Listener);

    /// Wraps a closure as a listener.
    fn listener_fn<F>(f: F) -> Arc<Self::Listener>
    where
        F: Fn(&Self) + Send + Sync + 'static;
}

/// Non-owning reference to a native object carried in an event payload.
///
/// Only an identifier: the bridge never dereferences or releases it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeRef(pub usize);

impl NativeRef {
    fn from_ptr(ptr: *mut std::ffi::c_void) -> Self {
        Self(ptr as usize)
    }
}

impl std::fmt::Debug for NativeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeRef({:#x})", self.0)
    }
}

/// Media state reported by `StateChanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    NothingSpecial,
    Opening,
    Buffering,
    Playing,
    Paused,
    Stopped,
    Ended,
    Error,
    Unknown(i32),
}

impl MediaState {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => MediaState::NothingSpecial,
            1 => MediaState::Opening,
            2 => MediaState::Buffering,
            3 => MediaState::Playing,
            4 => MediaState::Paused,
            5 => MediaState::Stopped,
            6 => MediaState::Ended,
            7 => MediaState::Error,
            other => MediaState::Unknown(other),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            MediaState::NothingSpecial => 0,
            MediaState::Opening => 1,
            MediaState::Buffering => 2,
            MediaState::Playing => 3,
            MediaState::Paused => 4,
            MediaState::Stopped => 5,
            MediaState::Ended => 6,
            MediaState::Error => 7,
            MediaState::Unknown(other) => other,
        }
    }
}

/// Parse outcome reported by `ParsedChanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedStatus {
    Skipped,
    Failed,
    Timeout,
    Done,
    Unknown(i32),
}

impl ParsedStatus {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => ParsedStatus::Skipped,
            2 => ParsedStatus::Failed,
            3 => ParsedStatus::Timeout,
            4 => ParsedStatus::Done,
            other => ParsedStatus::Unknown(other),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            ParsedStatus::Skipped => 1,
            ParsedStatus::Failed => 2,
            ParsedStatus::Timeout => 3,
            ParsedStatus::Done => 4,
            ParsedStatus::Unknown(other) => other,
        }
    }
}

/// Encoding of a generated thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureType {
    Argb,
    Png,
    Jpg,
    WebP,
    Unknown(i32),
}

impl PictureType {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => PictureType::Argb,
            1 => PictureType::Png,
            2 => PictureType::Jpg,
            3 => PictureType::WebP,
            other => PictureType::Unknown(other),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            PictureType::Argb => 0,
            PictureType::Png => 1,
            PictureType::Jpg => 2,
            PictureType::WebP => 3,
            PictureType::Unknown(other) => other,
        }
    }
}

/// A thumbnail copied out of a native picture.
#[derive(Clone, PartialEq, Eq)]
pub struct Picture {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub picture_type: PictureType,
    /// Media time the picture was taken at, in milliseconds
    pub time_ms: i64,
    pub buffer: Vec<u8>,
}

impl Picture {
    /// Copies a native picture.
    ///
    /// # Safety
    /// `picture` must be live for the duration of this call.
    pub unsafe fn copy_from(engine: &dyn NativeEngine, picture: RawHandle) -> Self {
        let (data, len) = engine.picture_buffer(picture);
        let buffer = if data.is_null() || len == 0 {
            Vec::new()
        } else {
            std::slice::from_raw_parts(data, len).to_vec()
        };
        Self {
            width: engine.picture_width(picture),
            height: engine.picture_height(picture),
            stride: engine.picture_stride(picture),
            picture_type: PictureType::from_raw(engine.picture_type(picture)),
            time_ms: engine.picture_time(picture),
            buffer,
        }
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }
}

impl std::fmt::Debug for Picture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Picture")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("type", &self.picture_type)
            .field("time_ms", &self.time_ms)
            .field("size", &self.buffer.len())
            .finish()
    }
}

// =========================================================================
// Media events
// =========================================================================

/// Events raised by a media item.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    MetaChanged { meta_type: i32 },
    SubItemAdded { item: NativeRef },
    DurationChanged { duration_ms: i64 },
    ParsedChanged { status: ParsedStatus },
    Freed,
    StateChanged { state: MediaState },
    SubItemTreeAdded { item: NativeRef },
    /// `None` when the engine reported a failed request
    ThumbnailGenerated(Option<Picture>),
}

/// Receives [`MediaEvent`]s. Override only what you need.
pub trait MediaEventListener: Send + Sync {
    fn on_event(&self, event: &MediaEvent) {
        match event {
            MediaEvent::MetaChanged { meta_type } => self.meta_changed(*meta_type),
            MediaEvent::SubItemAdded { item } => self.sub_item_added(*item),
            MediaEvent::DurationChanged { duration_ms } => self.duration_changed(*duration_ms),
            MediaEvent::ParsedChanged { status } => self.parsed_changed(*status),
            MediaEvent::Freed => self.freed(),
            MediaEvent::StateChanged { state } => self.state_changed(*state),
            MediaEvent::SubItemTreeAdded { item } => self.sub_item_tree_added(*item),
            MediaEvent::ThumbnailGenerated(picture) => {
                self.thumbnail_generated(picture.as_ref())
            }
        }
    }

    fn meta_changed(&self, _meta_type: i32) {}
    fn sub_item_added(&self, _item: NativeRef) {}
    fn duration_changed(&self, _duration_ms: i64) {}
    fn parsed_changed(&self, _status: ParsedStatus) {}
    fn freed(&self) {}
    fn state_changed(&self, _state: MediaState) {}
    fn sub_item_tree_added(&self, _item: NativeRef) {}
    fn thumbnail_generated(&self, _picture: Option<&Picture>) {}
}

impl TypedEvent for MediaEvent {
    type Listener = dyn MediaEventListener;

    const WATCHED: &'static [EventKind] = &[
        EventKind::MetaChanged,
        EventKind::SubItemAdded,
        EventKind::DurationChanged,
        EventKind::ParsedChanged,
        EventKind::Freed,
        EventKind::StateChanged,
        EventKind::SubItemTreeAdded,
        EventKind::ThumbnailGenerated,
    ];

    const SOURCE: &'static str = "media";

    unsafe fn from_raw(raw: &RawEvent, engine: &dyn NativeEngine) -> Option<Self> {
        let u = &raw.u;
        Some(match EventKind::from_raw(raw.event_type)? {
            EventKind::MetaChanged => MediaEvent::MetaChanged {
                meta_type: u.meta_changed.meta_type,
            },
            EventKind::SubItemAdded => MediaEvent::SubItemAdded {
                item: NativeRef::from_ptr(u.sub_item.item),
            },
            EventKind::DurationChanged => MediaEvent::DurationChanged {
                duration_ms: u.duration_changed.new_duration,
            },
            EventKind::ParsedChanged => MediaEvent::ParsedChanged {
                status: ParsedStatus::from_raw(u.parsed_changed.new_status),
            },
            EventKind::Freed => MediaEvent::Freed,
            EventKind::StateChanged => MediaEvent::StateChanged {
                state: MediaState::from_raw(u.state_changed.new_state),
            },
            EventKind::SubItemTreeAdded => MediaEvent::SubItemTreeAdded {
                item: NativeRef::from_ptr(u.sub_item.item),
            },
            EventKind::ThumbnailGenerated => MediaEvent::ThumbnailGenerated(
                RawHandle::from_ptr(u.thumbnail_generated.picture)
                    .map(|picture| Picture::copy_from(engine, picture)),
            ),
            _ => return None,
        })
    }

    fn kind(&self) -> EventKind {
        match self {
            MediaEvent::MetaChanged { .. } => EventKind::MetaChanged,
            MediaEvent::SubItemAdded { .. } => EventKind::SubItemAdded,
            MediaEvent::DurationChanged { .. } => EventKind::DurationChanged,
            MediaEvent::ParsedChanged { .. } => EventKind::ParsedChanged,
            MediaEvent::Freed => EventKind::Freed,
            MediaEvent::StateChanged { .. } => EventKind::StateChanged,
            MediaEvent::SubItemTreeAdded { .. } => EventKind::SubItemTreeAdded,
            MediaEvent::ThumbnailGenerated(_) => EventKind::ThumbnailGenerated,
        }
    }

    fn notify(&self, listener: &Self::Listener) {
        listener.on_event(self);
    }

    fn listener_fn<F>(f: F) -> Arc<Self::Listener>
    where
        F: Fn(&Self) + Send + Sync + 'static,
    {
        Arc::new(FnListener(f))
    }
}

// =========================================================================
// Player events
// =========================================================================

/// Events raised by a media player.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    MediaChanged { media: NativeRef },
    Opening,
    Buffering { cache: f32 },
    Playing,
    Paused,
    Stopped,
    EndReached,
    EncounteredError,
    TimeChanged { time_ms: i64 },
    PositionChanged { position: f32 },
    LengthChanged { length_ms: i64 },
}

/// Receives [`PlayerEvent`]s. Override only what you need.
pub trait PlayerEventListener: Send + Sync {
    fn on_event(&self, event: &PlayerEvent) {
        match event {
            PlayerEvent::MediaChanged { media } => self.media_changed(*media),
            PlayerEvent::Opening => self.opening(),
            PlayerEvent::Buffering { cache } => self.buffering(*cache),
            PlayerEvent::Playing => self.playing(),
            PlayerEvent::Paused => self.paused(),
            PlayerEvent::Stopped => self.stopped(),
            PlayerEvent::EndReached => self.end_reached(),
            PlayerEvent::EncounteredError => self.error(),
            PlayerEvent::TimeChanged { time_ms } => self.time_changed(*time_ms),
            PlayerEvent::PositionChanged { position } => self.position_changed(*position),
            PlayerEvent::LengthChanged { length_ms } => self.length_changed(*length_ms),
        }
    }

    fn media_changed(&self, _media: NativeRef) {}
    fn opening(&self) {}
    fn buffering(&self, _cache: f32) {}
    fn playing(&self) {}
    fn paused(&self) {}
    fn stopped(&self) {}
    fn end_reached(&self) {}
    fn error(&self) {}
    fn time_changed(&self, _time_ms: i64) {}
    fn position_changed(&self, _position: f32) {}
    fn length_changed(&self, _length_ms: i64) {}
}

impl TypedEvent for PlayerEvent {
    type Listener = dyn PlayerEventListener;

    const WATCHED: &'static [EventKind] = &[
        EventKind::MediaChanged,
        EventKind::Opening,
        EventKind::Buffering,
        EventKind::Playing,
        EventKind::Paused,
        EventKind::Stopped,
        EventKind::EndReached,
        EventKind::EncounteredError,
        EventKind::TimeChanged,
        EventKind::PositionChanged,
        EventKind::LengthChanged,
    ];

    const SOURCE: &'static str = "media player";

    unsafe fn from_raw(raw: &RawEvent, _engine: &dyn NativeEngine) -> Option<Self> {
        let u = &raw.u;
        Some(match EventKind::from_raw(raw.event_type)? {
            EventKind::MediaChanged => PlayerEvent::MediaChanged {
                media: NativeRef::from_ptr(u.media_changed.new_media),
            },
            EventKind::Opening => PlayerEvent::Opening,
            EventKind::Buffering => PlayerEvent::Buffering {
                cache: u.buffering.new_cache,
            },
            EventKind::Playing => PlayerEvent::Playing,
            EventKind::Paused => PlayerEvent::Paused,
            EventKind::Stopped => PlayerEvent::Stopped,
            EventKind::EndReached => PlayerEvent::EndReached,
            EventKind::EncounteredError => PlayerEvent::EncounteredError,
            EventKind::TimeChanged => PlayerEvent::TimeChanged {
                time_ms: u.time_changed.new_time,
            },
            EventKind::PositionChanged => PlayerEvent::PositionChanged {
                position: u.position_changed.new_position,
            },
            EventKind::LengthChanged => PlayerEvent::LengthChanged {
                length_ms: u.length_changed.new_length,
            },
            _ => return None,
        })
    }

    fn kind(&self) -> EventKind {
        match self {
            PlayerEvent::MediaChanged { .. } => EventKind::MediaChanged,
            PlayerEvent::Opening => EventKind::Opening,
            PlayerEvent::Buffering { .. } => EventKind::Buffering,
            PlayerEvent::Playing => EventKind::Playing,
            PlayerEvent::Paused => EventKind::Paused,
            PlayerEvent::Stopped => EventKind::Stopped,
            PlayerEvent::EndReached => EventKind::EndReached,
            PlayerEvent::EncounteredError => EventKind::EncounteredError,
            PlayerEvent::TimeChanged { .. } => EventKind::TimeChanged,
            PlayerEvent::PositionChanged { .. } => EventKind::PositionChanged,
            PlayerEvent::LengthChanged { .. } => EventKind::LengthChanged,
        }
    }

    fn notify(&self, listener: &Self::Listener) {
        listener.on_event(self);
    }

    fn listener_fn<F>(f: F) -> Arc<Self::Listener>
    where
        F: Fn(&Self) + Send + Sync + 'static,
    {
        Arc::new(FnListener(f))
    }
}

/// Closure adapter implementing both listener traits.
struct FnListener<F>(F);

impl<F> MediaEventListener for FnListener<F>
where
    F: Fn(&MediaEvent) + Send + Sync,
{
    fn on_event(&self, event: &MediaEvent) {
        (self.0)(event)
    }
}

impl<F> PlayerEventListener for FnListener<F>
where
    F: Fn(&PlayerEvent) + Send + Sync,
{
    fn on_event(&self, event: &PlayerEvent) {
        (self.0)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{RawEventPayload, StateChangedPayload, TimeChangedPayload};
    use crate::simulated::SimulatedEngine;
    use parking_lot::Mutex;

    #[test]
    fn test_kind_raw_roundtrip_covers_all_watched() {
        for kind in MediaEvent::WATCHED.iter().chain(PlayerEvent::WATCHED) {
            assert_eq!(EventKind::from_raw(kind.as_raw()), Some(*kind));
        }
        assert_eq!(EventKind::from_raw(0x7777), None);
    }

    #[test]
    fn test_media_state_from_raw() {
        let raw = RawEvent::new(
            event_type::MEDIA_STATE_CHANGED,
            std::ptr::null_mut(),
            RawEventPayload {
                state_changed: StateChangedPayload { new_state: 3 },
            },
        );
        let engine = SimulatedEngine::new();
        let event = unsafe { MediaEvent::from_raw(&raw, engine.as_ref()) }.unwrap();
        assert_eq!(
            event,
            MediaEvent::StateChanged {
                state: MediaState::Playing
            }
        );
    }

    #[test]
    fn test_player_kind_not_a_media_event() {
        let raw = RawEvent::new(
            event_type::PLAYER_TIME_CHANGED,
            std::ptr::null_mut(),
            RawEventPayload {
                time_changed: TimeChangedPayload { new_time: 5 },
            },
        );
        let engine = SimulatedEngine::new();
        assert!(unsafe { MediaEvent::from_raw(&raw, engine.as_ref()) }.is_none());
        assert_eq!(
            unsafe { PlayerEvent::from_raw(&raw, engine.as_ref()) },
            Some(PlayerEvent::TimeChanged { time_ms: 5 })
        );
    }

    #[test]
    fn test_default_methods_route_by_kind() {
        struct DurationOnly(Mutex<Vec<i64>>);
        impl MediaEventListener for DurationOnly {
            fn duration_changed(&self, duration_ms: i64) {
                self.0.lock().push(duration_ms);
            }
        }

        let listener = DurationOnly(Mutex::new(Vec::new()));
        MediaEvent::Freed.notify(&listener);
        MediaEvent::DurationChanged { duration_ms: 90 }.notify(&listener);
        assert_eq!(*listener.0.lock(), vec![90]);
    }

    #[test]
    fn test_listener_fn() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = PlayerEvent::listener_fn(move |event| sink.lock().push(event.kind()));
        PlayerEvent::Playing.notify(listener.as_ref());
        PlayerEvent::Stopped.notify(listener.as_ref());
        assert_eq!(*seen.lock(), vec![EventKind::Playing, EventKind::Stopped]);
    }
}
