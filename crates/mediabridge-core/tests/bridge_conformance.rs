//! Conformance tests for the event bridge, lifecycle and direct rendering,
//! driven through the simulated engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use mediabridge_core::buffer::aligned_window;
use mediabridge_core::native::{event_type, RawEventPayload, StateChangedPayload};
use mediabridge_core::simulated::{frame_pattern, SimulatedEngine};
use mediabridge_core::{
    BridgeConfig, BridgeError, BufferFormat, BufferFormatCallback, EventKind, LatchOutcome,
    MediaBridge, MediaEvent, MediaEventListener, MediaState, PlayerEvent, RenderCallback,
    TypedEvent,
};

fn bridge() -> (Arc<SimulatedEngine>, MediaBridge) {
    let engine = SimulatedEngine::new();
    let bridge = MediaBridge::new(engine.clone(), BridgeConfig::default()).unwrap();
    (engine, bridge)
}

fn state_payload(state: MediaState) -> RawEventPayload {
    RawEventPayload {
        state_changed: StateChangedPayload {
            new_state: state.as_raw(),
        },
    }
}

/// Records every media event it receives.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<MediaEvent>>,
}

impl MediaEventListener for Recorder {
    fn on_event(&self, event: &MediaEvent) {
        self.events.lock().push(event.clone());
    }
}

impl Recorder {
    fn count(&self) -> usize {
        self.events.lock().len()
    }
}

// =========================================================================
// Registration table
// =========================================================================

#[test]
fn listener_receives_iff_attached_at_snapshot() {
    let (engine, bridge) = bridge();
    let media = bridge.new_media("file:///property.mp4").unwrap();

    const LISTENERS: usize = 6;
    let recorders: Vec<Arc<Recorder>> = (0..LISTENERS).map(|_| Arc::default()).collect();
    let mut attached: Vec<Option<mediabridge_core::ListenerId>> = vec![None; LISTENERS];
    let mut expected = vec![0usize; LISTENERS];

    // Deterministic LCG so failures reproduce.
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move || {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (seed >> 33) as usize
    };

    for _ in 0..500 {
        let which = next() % LISTENERS;
        match next() % 3 {
            0 => {
                if attached[which].is_none() {
                    attached[which] = Some(media.events().attach(recorders[which].clone()).unwrap());
                }
            }
            1 => {
                if let Some(id) = attached[which].take() {
                    assert!(media.events().detach_id(id).unwrap());
                }
            }
            _ => {
                engine.raise(
                    media.address(),
                    event_type::MEDIA_STATE_CHANGED,
                    state_payload(MediaState::Buffering),
                );
                for (index, id) in attached.iter().enumerate() {
                    if id.is_some() {
                        expected[index] += 1;
                    }
                }
            }
        }
    }

    let received: Vec<usize> = recorders.iter().map(|r| r.count()).collect();
    assert_eq!(received, expected);
}

#[test]
fn detach_during_dispatch_takes_effect_next_event() {
    let (engine, bridge) = bridge();
    let media = bridge.new_media("file:///detach.mp4").unwrap();
    let media = Arc::new(media);

    let victim = Arc::new(Recorder::default());
    let victim_listener: Arc<dyn MediaEventListener> = victim.clone();

    // First listener detaches the second while event 1 is being delivered.
    let detached = Arc::new(Mutex::new(false));
    {
        let media = Arc::downgrade(&media);
        let victim_listener = victim_listener.clone();
        let detached = detached.clone();
        media
            .upgrade()
            .unwrap()
            .events()
            .attach_fn(move |_| {
                let mut done = detached.lock();
                if !*done {
                    if let Some(media) = media.upgrade() {
                        assert!(media.events().detach(&victim_listener).unwrap());
                    }
                    *done = true;
                }
            })
            .unwrap();
    }
    media.events().attach(victim_listener).unwrap();

    let fire = || {
        engine.raise(
            media.address(),
            event_type::MEDIA_STATE_CHANGED,
            state_payload(MediaState::Playing),
        )
    };
    fire();
    assert_eq!(victim.count(), 1, "event 1 was already snapshotted");
    fire();
    assert_eq!(victim.count(), 1, "event 2 must not reach a detached listener");
    assert_eq!(media.events().listener_count(), 1);
}

#[test]
fn listener_can_detach_itself() {
    let (engine, bridge) = bridge();
    let media = Arc::new(bridge.new_media("file:///self.mp4").unwrap());
    let hits = Arc::new(Mutex::new(0));

    let own_id = Arc::new(Mutex::new(None));
    let id = {
        let media = Arc::downgrade(&media);
        let hits = hits.clone();
        let own_id = own_id.clone();
        media
            .upgrade()
            .unwrap()
            .events()
            .attach_fn(move |_| {
                *hits.lock() += 1;
                if let (Some(media), Some(id)) = (media.upgrade(), *own_id.lock()) {
                    media.events().detach_id(id).unwrap();
                }
            })
            .unwrap()
    };
    *own_id.lock() = Some(id);

    for _ in 0..3 {
        engine.raise(media.address(), event_type::MEDIA_FREED, RawEventPayload::empty());
    }
    assert_eq!(*hits.lock(), 1);
}

#[test]
fn panicking_listener_does_not_block_others() {
    let (engine, bridge) = bridge();
    let media = bridge.new_media("file:///panic.mp4").unwrap();
    let before = Arc::new(Recorder::default());
    let after = Arc::new(Recorder::default());

    media.events().attach(before.clone()).unwrap();
    media
        .events()
        .attach_fn(|_| panic!("listener failure"))
        .unwrap();
    media.events().attach(after.clone()).unwrap();

    for _ in 0..2 {
        engine.raise(
            media.address(),
            event_type::MEDIA_STATE_CHANGED,
            state_payload(MediaState::Opening),
        );
    }
    assert_eq!(before.count(), 2);
    assert_eq!(after.count(), 2);
    assert_eq!(media.events().dispatch_failures(), 2);
    assert_eq!(media.events().listener_count(), 3);
}

#[test]
fn events_arrive_on_engine_thread_in_order() {
    let (engine, bridge) = bridge();
    let media = bridge.new_media("file:///order.mp4").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        media
            .events()
            .attach_fn(move |event| {
                if let MediaEvent::StateChanged { state } = event {
                    seen.lock().push((*state, std::thread::current().id()));
                }
            })
            .unwrap();
    }

    let states = [
        MediaState::Opening,
        MediaState::Buffering,
        MediaState::Playing,
        MediaState::Paused,
        MediaState::Stopped,
    ];
    for state in states {
        engine.post_event(
            media.address(),
            event_type::MEDIA_STATE_CHANGED,
            state_payload(state),
        );
    }
    engine.flush();

    let seen = seen.lock();
    let order: Vec<MediaState> = seen.iter().map(|(state, _)| *state).collect();
    assert_eq!(order, states);
    let me = std::thread::current().id();
    assert!(seen.iter().all(|(_, thread)| *thread != me));
}

// =========================================================================
// Release scenario
// =========================================================================

#[test]
fn state_changed_then_release_then_stale_event() {
    let (engine, bridge) = bridge();
    let media = bridge.new_media("file:///scenario.mp4").unwrap();
    let listener = Arc::new(Recorder::default());
    media.events().attach(listener.clone()).unwrap();

    engine.raise(
        media.address(),
        event_type::MEDIA_STATE_CHANGED,
        state_payload(MediaState::Playing),
    );
    assert_eq!(
        *listener.events.lock(),
        vec![MediaEvent::StateChanged {
            state: MediaState::Playing
        }]
    );

    let address = media.address();
    let token = media.events().token();
    media.release().unwrap();
    assert!(!mediabridge_core::trampoline::is_installed(token));

    // The engine no longer knows about the media...
    assert_eq!(
        engine.raise(
            address,
            event_type::MEDIA_STATE_CHANGED,
            state_payload(MediaState::Stopped)
        ),
        0
    );
    // ...but an event it had already dequeued still hits the trampoline.
    let invoked = engine.raise_in_flight(
        address,
        event_type::MEDIA_STATE_CHANGED,
        state_payload(MediaState::Stopped),
    );
    assert_eq!(invoked, 1);
    assert_eq!(listener.count(), 1);
}

#[test]
fn every_operation_fails_after_release() {
    let (_engine, bridge) = bridge();
    let media = bridge.new_media("file:///gone.mp4").unwrap();
    let player = bridge.new_player().unwrap();
    media.release().unwrap();
    player.release().unwrap();

    let media_gone = BridgeError::AlreadyReleased { object: "media" };
    let player_gone = BridgeError::AlreadyReleased {
        object: "media player",
    };

    assert_eq!(media.events().attach_fn(|_| {}).unwrap_err(), media_gone);
    assert_eq!(
        media.events().latch(&[EventKind::Freed], &[]).unwrap_err(),
        media_gone
    );
    assert_eq!(media.options().add(":x"), Err(media_gone.clone()));
    assert_eq!(player.controls().play(), Err(player_gone.clone()));
    assert_eq!(player.controls().pause(), Err(player_gone.clone()));
    assert_eq!(player.media().is_set(), Err(player_gone.clone()));
    assert_eq!(
        player.events().latch(&[EventKind::Playing], &[]).unwrap_err(),
        player_gone
    );
}

// =========================================================================
// Latch
// =========================================================================

#[test]
fn latch_resolves_within_delivering_call() {
    let (engine, bridge) = bridge();
    let player = bridge.new_player().unwrap();
    let latch = player
        .events()
        .latch(&[EventKind::Playing], &[EventKind::EncounteredError])
        .unwrap();

    engine.raise(player.address(), event_type::PLAYER_PLAYING, RawEventPayload::empty());
    assert_eq!(latch.outcome(), Some(LatchOutcome::Success));
    assert_eq!(latch.wait(Duration::ZERO), Ok(true));

    // One-shot: a later failure changes nothing.
    engine.raise(
        player.address(),
        event_type::PLAYER_ENCOUNTERED_ERROR,
        RawEventPayload::empty(),
    );
    assert_eq!(latch.outcome(), Some(LatchOutcome::Success));
    assert_eq!(player.events().listener_count(), 0);
}

#[test]
fn latch_resolves_false_on_release() {
    let (_engine, bridge) = bridge();
    let player = bridge.new_player().unwrap();
    let latch = player
        .events()
        .latch(&[EventKind::Playing], &[EventKind::EncounteredError])
        .unwrap();

    let waiter = std::thread::spawn(move || latch.wait(Duration::from_secs(10)));
    std::thread::sleep(Duration::from_millis(20));
    player.release().unwrap();
    assert_eq!(waiter.join().unwrap(), Ok(false));
}

#[test]
fn latch_drops_events_after_timeout() {
    let (engine, bridge) = bridge();
    let player = bridge.new_player().unwrap();
    let latch = player
        .events()
        .latch(&[EventKind::Playing], &[EventKind::EncounteredError])
        .unwrap();

    let timeout = Duration::from_millis(10);
    assert_eq!(latch.wait(timeout), Err(BridgeError::LatchTimeout(timeout)));
    assert_eq!(player.events().listener_count(), 0);

    engine.raise(player.address(), event_type::PLAYER_PLAYING, RawEventPayload::empty());
    assert_eq!(latch.outcome(), Some(LatchOutcome::TimedOut));
    assert_eq!(latch.wait(timeout), Err(BridgeError::LatchTimeout(timeout)));
}

#[test]
fn blocking_start_through_engine_thread() {
    let (engine, bridge) = bridge();
    let player = bridge.new_player().unwrap();
    player
        .media()
        .set(bridge.new_media("file:///start.mp4").unwrap())
        .unwrap();

    let kinds = Arc::new(Mutex::new(Vec::new()));
    {
        let kinds = kinds.clone();
        player
            .events()
            .attach_fn(move |event: &PlayerEvent| kinds.lock().push(event.kind()))
            .unwrap();
    }

    assert_eq!(player.controls().start(), Ok(true));
    engine.flush();
    let kinds = kinds.lock();
    let playing = kinds.iter().position(|k| *k == EventKind::Playing).unwrap();
    let opening = kinds.iter().position(|k| *k == EventKind::Opening).unwrap();
    assert!(opening < playing);
}

// =========================================================================
// Aligned buffers and direct rendering
// =========================================================================

#[test]
fn aligned_window_for_synthetic_addresses() {
    for address in 0..64usize {
        let window = aligned_window(address, 1000, 32).unwrap();
        assert_eq!((address + window.start) % 32, 0);
        assert_eq!(window.len(), 1000);
    }
}

struct FixedFormat(fn(u32, u32) -> BufferFormat);

impl BufferFormatCallback for FixedFormat {
    fn buffer_format(&self, source_width: u32, source_height: u32) -> BufferFormat {
        (self.0)(source_width, source_height)
    }
}

#[derive(Default)]
struct FrameStats {
    frames: Mutex<Vec<(Vec<usize>, bool)>>,
}

impl RenderCallback for FrameStats {
    fn display(&self, planes: &[&[u8]], _format: &BufferFormat) {
        let lengths = planes.iter().map(|p| p.len()).collect();
        let aligned = planes.iter().all(|p| p.as_ptr() as usize % 32 == 0);
        self.frames.lock().push((lengths, aligned));
    }
}

#[test]
fn direct_frames_round_trip() {
    let (engine, bridge) = bridge();
    engine.set_source_geometry(48, 20);
    engine.set_frames_per_play(4);

    let stats = Arc::new(FrameStats::default());
    let player = bridge
        .new_direct_player(Arc::new(FixedFormat(BufferFormat::i420)), stats.clone())
        .unwrap();
    player
        .media()
        .set(bridge.new_media("file:///frames.mp4").unwrap())
        .unwrap();

    assert_eq!(player.controls().start(), Ok(true));
    engine.flush();

    let video = player.video().unwrap();
    assert_eq!(video.frames_rendered(), 4);
    assert_eq!(video.format().unwrap(), Some(BufferFormat::i420(48, 20)));
    {
        let frames = stats.frames.lock();
        assert_eq!(frames.len(), 4);
        for (lengths, aligned) in frames.iter() {
            assert_eq!(lengths, &vec![48 * 20, 24 * 10, 24 * 10]);
            assert!(aligned);
        }
    }

    let last = engine.frames_written(player.address()) - 1;
    let matches = video
        .with_frame(|planes, _| {
            planes.iter().enumerate().all(|(plane, bytes)| {
                bytes
                    .iter()
                    .enumerate()
                    .all(|(offset, byte)| *byte == frame_pattern(last, plane, offset))
            })
        })
        .unwrap();
    assert_eq!(matches, Some(true));
}

#[test]
fn frames_read_during_playback_are_never_torn() {
    const FRAMES: u64 = 400;
    let (engine, bridge) = bridge();
    engine.set_source_geometry(256, 64);
    engine.set_frames_per_play(FRAMES);
    let player = bridge
        .new_direct_player(
            Arc::new(FixedFormat(BufferFormat::rv32)),
            Arc::new(FrameStats::default()),
        )
        .unwrap();
    player
        .media()
        .set(bridge.new_media("file:///concurrent.mp4").unwrap())
        .unwrap();
    let video = player.video().unwrap();

    let (reads, torn) = std::thread::scope(|scope| {
        let reader = scope.spawn(|| {
            let deadline = Instant::now() + Duration::from_secs(30);
            let (mut reads, mut torn) = (0u64, 0u64);
            loop {
                let done = video.frames_rendered() >= FRAMES || Instant::now() > deadline;
                // Every byte of one frame is offset from the first by its index.
                let consistent = video
                    .with_frame(|planes, _| {
                        let first = planes[0][0];
                        planes[0]
                            .iter()
                            .enumerate()
                            .all(|(offset, byte)| *byte == first.wrapping_add(offset as u8))
                    })
                    .unwrap();
                if let Some(consistent) = consistent {
                    reads += 1;
                    if !consistent {
                        torn += 1;
                    }
                }
                if done {
                    return (reads, torn);
                }
            }
        });
        assert_eq!(player.controls().start(), Ok(true));
        engine.flush();
        reader.join().unwrap()
    });

    assert_eq!(video.frames_rendered(), FRAMES);
    assert!(reads > 0);
    assert_eq!(torn, 0);
}

#[test]
fn buffers_reallocated_only_on_format_change() {
    let (engine, bridge) = bridge();
    engine.set_frames_per_play(1);
    let player = bridge
        .new_direct_player(
            Arc::new(FixedFormat(BufferFormat::rv32)),
            Arc::new(FrameStats::default()),
        )
        .unwrap();
    player
        .media()
        .set(bridge.new_media("file:///realloc.mp4").unwrap())
        .unwrap();
    let video = player.video().unwrap();

    assert_eq!(player.controls().start(), Ok(true));
    engine.flush();
    player.controls().stop().unwrap();
    assert_eq!(player.controls().start(), Ok(true));
    engine.flush();
    assert_eq!(video.allocations(), 1);

    player.controls().stop().unwrap();
    engine.set_source_geometry(32, 32);
    assert_eq!(player.controls().start(), Ok(true));
    engine.flush();
    assert_eq!(video.allocations(), 2);
    assert_eq!(video.format().unwrap(), Some(BufferFormat::rv32(32, 32)));
}

#[test]
fn player_release_stops_video_before_freeing_buffers() {
    let (engine, bridge) = bridge();
    engine.set_frames_per_play(2);
    let player = bridge
        .new_direct_player(
            Arc::new(FixedFormat(BufferFormat::rv32)),
            Arc::new(FrameStats::default()),
        )
        .unwrap();
    player
        .media()
        .set(bridge.new_media("file:///teardown.mp4").unwrap())
        .unwrap();
    assert_eq!(player.controls().start(), Ok(true));

    let address = player.address();
    player.release().unwrap();
    engine.flush();
    assert!(!engine.is_playing(address));
    assert_eq!(engine.release_count(address), 1);
    assert!(player.video().unwrap().format().is_err());
}
