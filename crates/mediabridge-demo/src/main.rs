//! mediabridge Demo
//!
//! Walks through the bridge against the simulated engine: media events,
//! parsing, thumbnails, blocking start and direct rendering.
//!
//! Run with `RUST_LOG=mediabridge_core=trace` to see every native callback.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use mediabridge_core::simulated::SimulatedEngine;
use mediabridge_core::{
    BridgeConfig, BufferFormat, BufferFormatCallback, EventKind, MediaBridge, MediaEvent,
    ParseFlags, PictureType, PlayerEvent, RenderCallback, ThumbnailSpeed,
};

/// Negotiates full-resolution I420 whatever the source is.
struct I420Format;

impl BufferFormatCallback for I420Format {
    fn buffer_format(&self, source_width: u32, source_height: u32) -> BufferFormat {
        tracing::info!("source is {source_width}x{source_height}, rendering I420");
        BufferFormat::i420(source_width, source_height)
    }

    fn allocated(&self, format: &BufferFormat) {
        tracing::info!(
            "allocated {} planes: {:?} bytes",
            format.plane_count(),
            format.plane_sizes()
        );
    }
}

/// Keeps a luma checksum of every displayed frame.
#[derive(Default)]
struct LumaChecksums {
    sums: Mutex<Vec<u64>>,
}

impl RenderCallback for LumaChecksums {
    fn display(&self, planes: &[&[u8]], _format: &BufferFormat) {
        let sum = planes
            .first()
            .map_or(0, |luma| luma.iter().map(|&b| b as u64).sum());
        self.sums.lock().push(sum);
    }
}

fn main() -> mediabridge_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mediabridge_core=debug".parse().unwrap())
                .add_directive("mediabridge_demo=info".parse().unwrap()),
        )
        .init();

    let config = BridgeConfig::from_env();
    let engine = SimulatedEngine::with_args(config.engine_args.clone());
    engine.set_source_geometry(320, 180);
    engine.set_frames_per_play(5);
    let bridge = MediaBridge::new(engine.clone(), config)?;

    // Media: events, parse, thumbnail
    let media = bridge.new_media_with_options("file:///demo/bunny.mp4", &[":no-audio"])?;
    media.events().attach_fn(|event: &MediaEvent| match event {
        MediaEvent::ThumbnailGenerated(Some(picture)) => tracing::info!(
            "thumbnail {}x{} ({} bytes) at {}ms",
            picture.width,
            picture.height,
            picture.size(),
            picture.time_ms
        ),
        other => tracing::info!("media event: {other:?}"),
    })?;

    let parsed = media
        .events()
        .latch(&[EventKind::ParsedChanged], &[])?;
    media.parsing().parse(ParseFlags::LOCAL | ParseFlags::FETCH_LOCAL, 1000)?;
    if !parsed.wait(Duration::from_secs(2))? {
        tracing::warn!("parse was interrupted");
    }

    let request = media.thumbnails().request_by_position(
        0.25,
        ThumbnailSpeed::Fast,
        160,
        90,
        PictureType::Argb,
        1000,
    )?;
    engine.flush();
    media.thumbnails().release_request(request)?;

    // Player: direct rendering and blocking start
    let checksums = Arc::new(LumaChecksums::default());
    let player = bridge.new_direct_player(Arc::new(I420Format), checksums.clone())?;
    player.events().attach_fn(|event: &PlayerEvent| match event {
        PlayerEvent::TimeChanged { .. } => {}
        other => tracing::info!("player event: {other:?}"),
    })?;
    player.media().set(media)?;

    if player.controls().start()? {
        engine.flush();
        if let Some(video) = player.video() {
            tracing::info!(
                "rendered {} frames with {} allocation(s), luma sums {:?}",
                video.frames_rendered(),
                video.allocations(),
                checksums.sums.lock()
            );
        }
    } else {
        tracing::warn!("playback failed to start");
    }

    player.release()?;
    engine.flush();
    tracing::info!("released; engine holds {} thumbnail requests", engine.outstanding_requests());
    Ok(())
}
