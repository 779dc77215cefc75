//! Scriptable in-process engine.
//!
//! [`SimulatedEngine`] implements [`NativeEngine`] without decoding anything.
//! It keeps native-style object tables keyed by fake addresses, stores the
//! callbacks the bridge registers, and invokes them the way the real engine
//! does: through raw function pointers, with payloads that only live for the
//! duration of the call, from a thread the bridge did not create.
//!
//! Asynchronous work (playback start, parsing, thumbnails, frames) runs on a
//! single engine thread fed by a `crossbeam-channel`, so events for one
//! object are raised in order. [`SimulatedEngine::flush`] waits for that
//! queue to drain.
//!
//! MRLs starting with `fail://` make playback, parsing and thumbnailing fail.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::native::{
    event_type, BufferingPayload, DurationChangedPayload, LengthChangedPayload,
    MediaChangedPayload, MetaChangedPayload, NativeEngine, ParsedChangedPayload, RawEvent,
    RawEventCallback, RawEventPayload, RawHandle, ThumbnailGeneratedPayload, TimeChangedPayload,
    VideoDisplay, VideoFormatCleanup, VideoFormatSetup, VideoLock, VideoUnlock, MAX_PLANES,
};

/// Fake native addresses, unique across every engine in the process.
static NEXT_ADDRESS: AtomicUsize = AtomicUsize::new(0x5100_0000);

fn allocate_address() -> usize {
    NEXT_ADDRESS.fetch_add(0x40, Ordering::Relaxed)
}

const FAIL_SCHEME: &str = "fail://";
const DEFAULT_DURATION_MS: i64 = 90_000;
const DEFAULT_FRAMES_PER_PLAY: u64 = 3;
const DEFAULT_SOURCE_GEOMETRY: (u32, u32) = (64, 36);
const FRAME_INTERVAL_MS: i64 = 40;

/// Byte the engine writes at `offset` of `plane` for frame number `frame`.
pub fn frame_pattern(frame: u64, plane: usize, offset: usize) -> u8 {
    (frame as usize)
        .wrapping_mul(7)
        .wrapping_add(plane * 31)
        .wrapping_add(offset) as u8
}

type Job = Box<dyn FnOnce(&SimulatedEngine) + Send>;

#[derive(Clone, Copy)]
struct Subscription {
    manager: usize,
    event_type: i32,
    callback: RawEventCallback,
    user_data: usize,
}

#[derive(Clone, Copy)]
struct VideoCallbacks {
    lock: VideoLock,
    unlock: Option<VideoUnlock>,
    display: Option<VideoDisplay>,
    opaque: usize,
}

#[derive(Clone, Copy)]
struct FormatCallbacks {
    setup: VideoFormatSetup,
    cleanup: Option<VideoFormatCleanup>,
}

#[derive(Clone, Copy)]
struct Negotiated {
    opaque: usize,
    pitches: [u32; MAX_PLANES],
    lines: [u32; MAX_PLANES],
}

struct SimMedia {
    mrl: String,
    manager: usize,
    options: Vec<String>,
}

struct SimPlayer {
    manager: usize,
    media: Option<usize>,
    playing: bool,
    paused: bool,
    video: Option<VideoCallbacks>,
    format: Option<FormatCallbacks>,
    negotiated: Option<Negotiated>,
    frames_written: u64,
}

struct SimRequest {
    cancelled: bool,
}

struct SimPicture {
    width: u32,
    height: u32,
    stride: u32,
    picture_type: i32,
    time_ms: i64,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct EngineState {
    media: HashMap<usize, SimMedia>,
    players: HashMap<usize, SimPlayer>,
    requests: HashMap<usize, SimRequest>,
    pictures: HashMap<usize, SimPicture>,
    /// manager address -> owning object, kept after release
    managers: HashMap<usize, usize>,
    subscriptions: Vec<Subscription>,
    /// Subscriptions removed by `event_detach`, for in-flight replay
    detached: Vec<Subscription>,
    releases: HashMap<usize, usize>,
    attach_budget: Option<usize>,
    fail_stop: bool,
    frames_per_play: u64,
    source_geometry: (u32, u32),
}

impl EngineState {
    fn manager_of(&self, owner: usize) -> Option<usize> {
        self.media
            .get(&owner)
            .map(|m| m.manager)
            .or_else(|| self.players.get(&owner).map(|p| p.manager))
    }

    fn is_failing_media(&self, media: usize) -> bool {
        self.media
            .get(&media)
            .is_some_and(|m| m.mrl.starts_with(FAIL_SCHEME))
    }
}

/// Payload moved to the engine thread.
struct QueuedPayload(RawEventPayload);

// SAFETY: payloads built by this engine only carry fake addresses that are
// never dereferenced through the payload itself.
unsafe impl Send for QueuedPayload {}

/// In-process [`NativeEngine`] for tests and demos.
pub struct SimulatedEngine {
    state: Mutex<EngineState>,
    /// Held around each frame and by `player_stop`
    video_gate: Mutex<()>,
    jobs: Option<Sender<Job>>,
    args: Vec<String>,
}

impl SimulatedEngine {
    pub fn new() -> Arc<Self> {
        Self::with_args(Vec::new())
    }

    /// Engine "constructed" with command-line style arguments.
    pub fn with_args(args: Vec<String>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let (tx, rx) = crossbeam_channel::unbounded::<Job>();
            let weak = weak.clone();
            let jobs = match std::thread::Builder::new()
                .name("sim-engine".into())
                .spawn(move || engine_loop(weak, rx))
            {
                Ok(_) => Some(tx),
                Err(e) => {
                    tracing::error!("failed to spawn simulated engine thread: {e}; running inline");
                    None
                }
            };
            Self {
                state: Mutex::new(EngineState {
                    frames_per_play: DEFAULT_FRAMES_PER_PLAY,
                    source_geometry: DEFAULT_SOURCE_GEOMETRY,
                    ..Default::default()
                }),
                video_gate: Mutex::new(()),
                jobs,
                args,
            }
        })
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn post(&self, job: impl FnOnce(&SimulatedEngine) + Send + 'static) {
        let job: Job = Box::new(job);
        match &self.jobs {
            Some(tx) => {
                if let Err(e) = tx.send(job) {
                    tracing::warn!("simulated engine thread gone: {e}");
                }
            }
            None => job(self),
        }
    }

    /// Blocks until every job queued so far has run.
    pub fn flush(&self) {
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        self.post(move |_| {
            let _ = tx.send(());
        });
        let _ = rx.recv();
    }

    // ---------------------------------------------------------------------
    // Event raising
    // ---------------------------------------------------------------------

    /// Raises an event on the calling thread. Returns the number of
    /// callbacks invoked.
    pub fn raise(&self, owner: usize, event_type: i32, payload: RawEventPayload) -> usize {
        let targets: Vec<Subscription> = {
            let state = self.state.lock();
            let Some(manager) = state.manager_of(owner) else {
                return 0;
            };
            state
                .subscriptions
                .iter()
                .filter(|s| s.manager == manager && s.event_type == event_type)
                .copied()
                .collect()
        };
        self.invoke(&targets, owner, event_type, payload)
    }

    /// Raises an event to callbacks that were detached from `owner`'s
    /// event manager, as the engine would for an event it had already
    /// dequeued when detach ran. Works after the object was released.
    pub fn raise_in_flight(&self, owner: usize, event_type: i32, payload: RawEventPayload) -> usize {
        let targets: Vec<Subscription> = {
            let state = self.state.lock();
            state
                .detached
                .iter()
                .filter(|s| {
                    s.event_type == event_type && state.managers.get(&s.manager) == Some(&owner)
                })
                .copied()
                .collect()
        };
        self.invoke(&targets, owner, event_type, payload)
    }

    /// Raises an event from the engine thread.
    pub fn post_event(&self, owner: usize, event_type: i32, payload: RawEventPayload) {
        let payload = QueuedPayload(payload);
        self.post(move |engine| {
            let payload = payload;
            engine.raise(owner, event_type, payload.0);
        });
    }

    fn invoke(
        &self,
        targets: &[Subscription],
        owner: usize,
        event_type: i32,
        payload: RawEventPayload,
    ) -> usize {
        let event = RawEvent::new(event_type, owner as *mut c_void, payload);
        for target in targets {
            // SAFETY: callbacks were registered through `event_attach` with
            // this user data; `event` outlives the call.
            unsafe { (target.callback)(&event, target.user_data as *mut c_void) };
        }
        targets.len()
    }

    // ---------------------------------------------------------------------
    // Inspection and scripting
    // ---------------------------------------------------------------------

    /// How many times `address` was released.
    pub fn release_count(&self, address: usize) -> usize {
        self.state.lock().releases.get(&address).copied().unwrap_or(0)
    }

    /// Number of event kinds currently subscribed on `manager`.
    pub fn attached_kinds(&self, manager: RawHandle) -> usize {
        self.state
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.manager == manager.addr())
            .count()
    }

    /// Makes `event_attach` fail after `successes` more successful calls.
    pub fn fail_event_attach_after(&self, successes: usize) {
        self.state.lock().attach_budget = Some(successes);
    }

    /// Makes `player_stop` report failure without stopping anything.
    pub fn fail_stop(&self, fail: bool) {
        self.state.lock().fail_stop = fail;
    }

    /// Frames rendered per `player_play` on direct-rendering players.
    pub fn set_frames_per_play(&self, frames: u64) {
        self.state.lock().frames_per_play = frames;
    }

    /// Geometry offered to the format callback.
    pub fn set_source_geometry(&self, width: u32, height: u32) {
        self.state.lock().source_geometry = (width, height);
    }

    pub fn media_options(&self, media: usize) -> Vec<String> {
        self.state
            .lock()
            .media
            .get(&media)
            .map(|m| m.options.clone())
            .unwrap_or_default()
    }

    /// Media currently set on `player`.
    pub fn player_media(&self, player: usize) -> Option<usize> {
        self.state.lock().players.get(&player).and_then(|p| p.media)
    }

    pub fn is_playing(&self, player: usize) -> bool {
        self.state
            .lock()
            .players
            .get(&player)
            .is_some_and(|p| p.playing && !p.paused)
    }

    /// Number of frames written into `player`'s buffers so far.
    pub fn frames_written(&self, player: usize) -> u64 {
        self.state
            .lock()
            .players
            .get(&player)
            .map_or(0, |p| p.frames_written)
    }

    pub fn outstanding_requests(&self) -> usize {
        self.state.lock().requests.len()
    }

    fn record_release(state: &mut EngineState, address: usize) {
        *state.releases.entry(address).or_insert(0) += 1;
    }

    // ---------------------------------------------------------------------
    // Engine-thread work
    // ---------------------------------------------------------------------

    fn run_playback(&self, player: usize) {
        let (media, failing) = {
            let state = self.state.lock();
            let Some(entry) = state.players.get(&player) else {
                return;
            };
            if !entry.playing {
                return;
            }
            let media = entry.media;
            (media, media.is_some_and(|m| state.is_failing_media(m)))
        };

        self.raise(player, event_type::PLAYER_OPENING, RawEventPayload::empty());
        self.raise(
            player,
            event_type::PLAYER_BUFFERING,
            RawEventPayload {
                buffering: BufferingPayload { new_cache: 100.0 },
            },
        );

        if failing || media.is_none() {
            if let Some(entry) = self.state.lock().players.get_mut(&player) {
                entry.playing = false;
            }
            self.raise(
                player,
                event_type::PLAYER_ENCOUNTERED_ERROR,
                RawEventPayload::empty(),
            );
            return;
        }

        self.raise(
            player,
            event_type::PLAYER_LENGTH_CHANGED,
            RawEventPayload {
                length_changed: LengthChangedPayload {
                    new_length: DEFAULT_DURATION_MS,
                },
            },
        );
        self.raise(player, event_type::PLAYER_PLAYING, RawEventPayload::empty());
        self.render_frames(player);
    }

    fn render_frames(&self, player: usize) {
        let (video, format, frames, geometry) = {
            let state = self.state.lock();
            let Some(entry) = state.players.get(&player) else {
                return;
            };
            match (entry.video, entry.format) {
                (Some(video), Some(format)) => {
                    (video, format, state.frames_per_play, state.source_geometry)
                }
                _ => return,
            }
        };

        let Some(negotiated) = self.negotiate(player, video, format, geometry) else {
            return;
        };

        for _ in 0..frames {
            let time_ms = {
                let _gate = self.video_gate.lock();
                let frame = {
                    let state = self.state.lock();
                    match state.players.get(&player) {
                        Some(entry) if entry.playing => entry.frames_written,
                        _ => break,
                    }
                };
                // SAFETY: callbacks and opaque were registered for this
                // player; pointers handed out by `lock` stay valid until
                // `display` returns.
                unsafe { write_frame(video, &negotiated, frame) };
                let mut state = self.state.lock();
                match state.players.get_mut(&player) {
                    Some(entry) => {
                        entry.frames_written += 1;
                        entry.frames_written as i64 * FRAME_INTERVAL_MS
                    }
                    None => break,
                }
            };
            self.raise(
                player,
                event_type::PLAYER_TIME_CHANGED,
                RawEventPayload {
                    time_changed: TimeChangedPayload { new_time: time_ms },
                },
            );
        }
    }

    fn negotiate(
        &self,
        player: usize,
        video: VideoCallbacks,
        format: FormatCallbacks,
        geometry: (u32, u32),
    ) -> Option<Negotiated> {
        let _gate = self.video_gate.lock();
        if let Some(negotiated) = self.state.lock().players.get(&player)?.negotiated {
            return Some(negotiated);
        }

        let mut opaque = video.opaque as *mut c_void;
        let mut chroma = [0 as c_char; 4];
        let (mut width, mut height) = geometry;
        let mut pitches = [0u32; MAX_PLANES];
        let mut lines = [0u32; MAX_PLANES];
        // SAFETY: every out-pointer refers to a live local of the size the
        // callback contract requires.
        let count = unsafe {
            (format.setup)(
                &mut opaque,
                chroma.as_mut_ptr(),
                &mut width,
                &mut height,
                pitches.as_mut_ptr(),
                lines.as_mut_ptr(),
            )
        };
        if count == 0 {
            tracing::warn!("simulated player {player:#x}: format setup refused");
            return None;
        }

        let negotiated = Negotiated {
            opaque: opaque as usize,
            pitches,
            lines,
        };
        self.state.lock().players.get_mut(&player)?.negotiated = Some(negotiated);
        Some(negotiated)
    }

    fn run_parse(&self, media: usize) {
        let failing = self.state.lock().is_failing_media(media);
        if !failing {
            self.raise(
                media,
                event_type::MEDIA_DURATION_CHANGED,
                RawEventPayload {
                    duration_changed: DurationChangedPayload {
                        new_duration: DEFAULT_DURATION_MS,
                    },
                },
            );
            self.raise(
                media,
                event_type::MEDIA_META_CHANGED,
                RawEventPayload {
                    meta_changed: MetaChangedPayload { meta_type: 0 },
                },
            );
        }
        self.raise(
            media,
            event_type::MEDIA_PARSED_CHANGED,
            RawEventPayload {
                parsed_changed: ParsedChangedPayload {
                    new_status: if failing { 2 } else { 4 },
                },
            },
        );
    }

    fn run_thumbnail(
        &self,
        media: usize,
        request: usize,
        time_ms: i64,
        width: u32,
        height: u32,
        picture_type: i32,
    ) {
        let picture = {
            let mut state = self.state.lock();
            match state.requests.get(&request) {
                Some(entry) if !entry.cancelled => {}
                _ => return,
            }
            if state.is_failing_media(media) {
                None
            } else {
                let address = allocate_address();
                let stride = width * 4;
                let bytes = (0..stride as usize * height as usize)
                    .map(|i| frame_pattern(time_ms as u64, 0, i))
                    .collect();
                state.pictures.insert(
                    address,
                    SimPicture {
                        width,
                        height,
                        stride,
                        picture_type,
                        time_ms,
                        bytes,
                    },
                );
                Some(address)
            }
        };

        self.raise(
            media,
            event_type::MEDIA_THUMBNAIL_GENERATED,
            RawEventPayload {
                thumbnail_generated: ThumbnailGeneratedPayload {
                    picture: picture.map_or(std::ptr::null_mut(), |a| a as *mut c_void),
                },
            },
        );

        // The picture only lives for the duration of the callback.
        if let Some(address) = picture {
            self.state.lock().pictures.remove(&address);
        }
    }

    fn new_thumbnail_request(
        &self,
        media: RawHandle,
        time_ms: i64,
        width: u32,
        height: u32,
        picture_type: i32,
    ) -> Option<RawHandle> {
        let address = {
            let mut state = self.state.lock();
            if !state.media.contains_key(&media.addr()) {
                return None;
            }
            let address = allocate_address();
            state
                .requests
                .insert(address, SimRequest { cancelled: false });
            address
        };
        let media = media.addr();
        let (width, height) = if width == 0 || height == 0 {
            (32, 18)
        } else {
            (width, height)
        };
        self.post(move |engine| {
            engine.run_thumbnail(media, address, time_ms, width, height, picture_type)
        });
        RawHandle::from_addr(address)
    }

    fn with_picture<R: Default>(&self, picture: RawHandle, f: impl FnOnce(&SimPicture) -> R) -> R {
        self.state
            .lock()
            .pictures
            .get(&picture.addr())
            .map(f)
            .unwrap_or_default()
    }
}

/// Locks, fills, unlocks and displays one frame.
unsafe fn write_frame(video: VideoCallbacks, negotiated: &Negotiated, frame: u64) {
    let opaque = negotiated.opaque as *mut c_void;
    let mut planes = [std::ptr::null_mut::<c_void>(); MAX_PLANES];
    let picture = (video.lock)(opaque, planes.as_mut_ptr());
    for (plane, &pointer) in planes.iter().enumerate() {
        let len = negotiated.pitches[plane] as usize * negotiated.lines[plane] as usize;
        if pointer.is_null() || len == 0 {
            continue;
        }
        let bytes = pointer.cast::<u8>();
        for offset in 0..len {
            bytes.add(offset).write(frame_pattern(frame, plane, offset));
        }
    }
    if let Some(unlock) = video.unlock {
        unlock(opaque, picture, planes.as_ptr());
    }
    if let Some(display) = video.display {
        display(opaque, picture);
    }
}

fn engine_loop(engine: Weak<SimulatedEngine>, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        job(&engine);
    }
    tracing::trace!("simulated engine thread exiting");
}

impl NativeEngine for SimulatedEngine {
    fn media_new_location(&self, mrl: &CStr) -> Option<RawHandle> {
        let mrl = mrl.to_str().ok()?.to_string();
        if mrl.is_empty() {
            return None;
        }
        let address = allocate_address();
        let manager = allocate_address();
        let mut state = self.state.lock();
        state.managers.insert(manager, address);
        state.media.insert(
            address,
            SimMedia {
                mrl,
                manager,
                options: Vec::new(),
            },
        );
        RawHandle::from_addr(address)
    }

    fn media_release(&self, media: RawHandle) {
        self.raise(media.addr(), event_type::MEDIA_FREED, RawEventPayload::empty());
        let mut state = self.state.lock();
        state.media.remove(&media.addr());
        Self::record_release(&mut state, media.addr());
    }

    fn media_event_manager(&self, media: RawHandle) -> Option<RawHandle> {
        let state = self.state.lock();
        RawHandle::from_addr(state.media.get(&media.addr())?.manager)
    }

    fn media_add_option(&self, media: RawHandle, option: &CStr) -> i32 {
        let Ok(option) = option.to_str() else {
            return -1;
        };
        if option.is_empty() {
            return -1;
        }
        match self.state.lock().media.get_mut(&media.addr()) {
            Some(entry) => {
                entry.options.push(option.to_string());
                0
            }
            None => -1,
        }
    }

    fn media_parse(&self, media: RawHandle, _flags: i32, _timeout_ms: i32) -> i32 {
        if !self.state.lock().media.contains_key(&media.addr()) {
            return -1;
        }
        let media = media.addr();
        self.post(move |engine| engine.run_parse(media));
        0
    }

    fn media_parse_stop(&self, _media: RawHandle) {}

    fn media_thumbnail_request_by_time(
        &self,
        media: RawHandle,
        time_ms: i64,
        _speed: i32,
        width: u32,
        height: u32,
        picture_type: i32,
        _timeout_ms: i64,
    ) -> Option<RawHandle> {
        self.new_thumbnail_request(media, time_ms, width, height, picture_type)
    }

    fn media_thumbnail_request_by_pos(
        &self,
        media: RawHandle,
        position: f32,
        _speed: i32,
        width: u32,
        height: u32,
        picture_type: i32,
        _timeout_ms: i64,
    ) -> Option<RawHandle> {
        let time_ms = (position.clamp(0.0, 1.0) as f64 * DEFAULT_DURATION_MS as f64) as i64;
        self.new_thumbnail_request(media, time_ms, width, height, picture_type)
    }

    fn media_thumbnail_request_cancel(&self, request: RawHandle) {
        if let Some(entry) = self.state.lock().requests.get_mut(&request.addr()) {
            entry.cancelled = true;
        }
    }

    fn media_thumbnail_request_destroy(&self, request: RawHandle) {
        let mut state = self.state.lock();
        state.requests.remove(&request.addr());
        Self::record_release(&mut state, request.addr());
    }

    fn picture_width(&self, picture: RawHandle) -> u32 {
        self.with_picture(picture, |p| p.width)
    }

    fn picture_height(&self, picture: RawHandle) -> u32 {
        self.with_picture(picture, |p| p.height)
    }

    fn picture_stride(&self, picture: RawHandle) -> u32 {
        self.with_picture(picture, |p| p.stride)
    }

    fn picture_type(&self, picture: RawHandle) -> i32 {
        self.with_picture(picture, |p| p.picture_type)
    }

    fn picture_time(&self, picture: RawHandle) -> i64 {
        self.with_picture(picture, |p| p.time_ms)
    }

    fn picture_buffer(&self, picture: RawHandle) -> (*const u8, usize) {
        // The bytes are heap-allocated and stay put until the picture is
        // removed after the callback returns.
        self.state
            .lock()
            .pictures
            .get(&picture.addr())
            .map_or((std::ptr::null(), 0), |p| (p.bytes.as_ptr(), p.bytes.len()))
    }

    fn player_new(&self) -> Option<RawHandle> {
        let address = allocate_address();
        let manager = allocate_address();
        let mut state = self.state.lock();
        state.managers.insert(manager, address);
        state.players.insert(
            address,
            SimPlayer {
                manager,
                media: None,
                playing: false,
                paused: false,
                video: None,
                format: None,
                negotiated: None,
                frames_written: 0,
            },
        );
        RawHandle::from_addr(address)
    }

    fn player_release(&self, player: RawHandle) {
        let mut state = self.state.lock();
        state.players.remove(&player.addr());
        Self::record_release(&mut state, player.addr());
    }

    fn player_event_manager(&self, player: RawHandle) -> Option<RawHandle> {
        let state = self.state.lock();
        RawHandle::from_addr(state.players.get(&player.addr())?.manager)
    }

    fn player_set_media(&self, player: RawHandle, media: Option<RawHandle>) {
        let media = media.map(RawHandle::addr);
        let changed = match self.state.lock().players.get_mut(&player.addr()) {
            Some(entry) if entry.media != media => {
                entry.media = media;
                true
            }
            _ => false,
        };
        if changed {
            self.post_event(
                player.addr(),
                event_type::PLAYER_MEDIA_CHANGED,
                RawEventPayload {
                    media_changed: MediaChangedPayload {
                        new_media: media.unwrap_or(0) as *mut c_void,
                    },
                },
            );
        }
    }

    fn player_play(&self, player: RawHandle) -> i32 {
        {
            let mut state = self.state.lock();
            let Some(entry) = state.players.get_mut(&player.addr()) else {
                return -1;
            };
            if entry.media.is_none() {
                return -1;
            }
            entry.paused = false;
            if entry.playing {
                return 0;
            }
            entry.playing = true;
        }
        let player = player.addr();
        self.post(move |engine| engine.run_playback(player));
        0
    }

    fn player_set_pause(&self, player: RawHandle, pause: bool) {
        let raise = match self.state.lock().players.get_mut(&player.addr()) {
            Some(entry) if entry.playing && entry.paused != pause => {
                entry.paused = pause;
                Some(if pause {
                    event_type::PLAYER_PAUSED
                } else {
                    event_type::PLAYER_PLAYING
                })
            }
            _ => None,
        };
        if let Some(kind) = raise {
            self.post_event(player.addr(), kind, RawEventPayload::empty());
        }
    }

    fn player_pause(&self, player: RawHandle) {
        let paused = self
            .state
            .lock()
            .players
            .get(&player.addr())
            .is_some_and(|p| p.paused);
        self.player_set_pause(player, !paused);
    }

    fn player_stop(&self, player: RawHandle) -> i32 {
        let (was_playing, format, negotiated) = {
            let mut state = self.state.lock();
            if state.fail_stop {
                return -1;
            }
            let Some(entry) = state.players.get_mut(&player.addr()) else {
                return -1;
            };
            let was_playing = entry.playing;
            entry.playing = false;
            entry.paused = false;
            (was_playing, entry.format, entry.negotiated.take())
        };

        // Wait out a frame in progress; none start after this.
        {
            let _gate = self.video_gate.lock();
            if let (Some(format), Some(negotiated)) = (format, negotiated) {
                if let Some(cleanup) = format.cleanup {
                    // SAFETY: opaque is the value negotiated for this player.
                    unsafe { cleanup(negotiated.opaque as *mut c_void) };
                }
            }
        }

        if was_playing {
            self.post_event(player.addr(), event_type::PLAYER_STOPPED, RawEventPayload::empty());
        }
        0
    }

    fn video_set_callbacks(
        &self,
        player: RawHandle,
        lock: VideoLock,
        unlock: Option<VideoUnlock>,
        display: Option<VideoDisplay>,
        opaque: *mut c_void,
    ) {
        if let Some(entry) = self.state.lock().players.get_mut(&player.addr()) {
            entry.video = Some(VideoCallbacks {
                lock,
                unlock,
                display,
                opaque: opaque as usize,
            });
        }
    }

    fn video_set_format_callbacks(
        &self,
        player: RawHandle,
        setup: VideoFormatSetup,
        cleanup: Option<VideoFormatCleanup>,
    ) {
        if let Some(entry) = self.state.lock().players.get_mut(&player.addr()) {
            entry.format = Some(FormatCallbacks { setup, cleanup });
        }
    }

    fn event_attach(
        &self,
        manager: RawHandle,
        event_type: i32,
        callback: RawEventCallback,
        user_data: *mut c_void,
    ) -> i32 {
        let mut state = self.state.lock();
        if let Some(budget) = state.attach_budget.as_mut() {
            if *budget == 0 {
                state.attach_budget = None;
                return -1;
            }
            *budget -= 1;
        }
        state.subscriptions.push(Subscription {
            manager: manager.addr(),
            event_type,
            callback,
            user_data: user_data as usize,
        });
        0
    }

    fn event_detach(
        &self,
        manager: RawHandle,
        event_type: i32,
        callback: RawEventCallback,
        user_data: *mut c_void,
    ) {
        let mut state = self.state.lock();
        let position = state.subscriptions.iter().position(|s| {
            s.manager == manager.addr()
                && s.event_type == event_type
                && s.callback as usize == callback as usize
                && s.user_data == user_data as usize
        });
        if let Some(position) = position {
            let removed = state.subscriptions.remove(position);
            state.detached.push(removed);
        }
    }
}

impl std::fmt::Debug for SimulatedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulatedEngine")
            .field("media", &state.media.len())
            .field("players", &state.players.len())
            .field("subscriptions", &state.subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::StateChangedPayload;

    #[test]
    fn test_addresses_unique_across_engines() {
        let a = SimulatedEngine::new();
        let b = SimulatedEngine::new();
        let x = a.player_new().unwrap();
        let y = b.player_new().unwrap();
        assert_ne!(x, y);
    }

    #[test]
    fn test_raise_without_subscription() {
        let engine = SimulatedEngine::new();
        let media = engine.media_new_location(c"file:///x.ogg").unwrap();
        let payload = RawEventPayload {
            state_changed: StateChangedPayload { new_state: 3 },
        };
        assert_eq!(
            engine.raise(media.addr(), event_type::MEDIA_STATE_CHANGED, payload),
            0
        );
    }

    #[test]
    fn test_play_requires_media() {
        let engine = SimulatedEngine::new();
        let player = engine.player_new().unwrap();
        assert_eq!(engine.player_play(player), -1);

        let media = engine.media_new_location(c"file:///x.ogg").unwrap();
        engine.player_set_media(player, Some(media));
        assert_eq!(engine.player_play(player), 0);
        engine.flush();
        assert!(engine.is_playing(player.addr()));
        assert_eq!(engine.player_stop(player), 0);
        assert!(!engine.is_playing(player.addr()));
    }

    #[test]
    fn test_option_rejected_when_empty() {
        let engine = SimulatedEngine::new();
        let media = engine.media_new_location(c"file:///x.ogg").unwrap();
        assert_eq!(engine.media_add_option(media, c":no-audio"), 0);
        assert_eq!(engine.media_add_option(media, c""), -1);
        assert_eq!(engine.media_options(media.addr()), vec![":no-audio"]);
    }

    #[test]
    fn test_frame_pattern_varies() {
        assert_ne!(frame_pattern(0, 0, 0), frame_pattern(1, 0, 0));
        assert_ne!(frame_pattern(0, 0, 0), frame_pattern(0, 1, 0));
        assert_eq!(frame_pattern(0, 0, 5), 5);
    }
}
