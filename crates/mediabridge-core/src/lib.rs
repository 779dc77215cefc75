//! mediabridge-core: native callback event bridge and resource lifecycle.
//!
//! This crate sits between application code and an opaque native media
//! engine reached through [`native::NativeEngine`]. It contains:
//!
//! - Ownership of native objects: [`handle`], [`lifecycle`]
//! - The event bridge: [`registration`], [`trampoline`], [`event`], [`latch`]
//! - Zero-copy direct rendering: [`buffer`], [`direct`]
//! - Composite objects: [`media`], [`player`], created from a [`MediaBridge`]
//! - A scriptable engine for tests and demos: [`simulated`]
//!
//! Native callbacks arrive on threads the engine owns. Everything they touch
//! is either copied out before the callback returns or guarded by
//! `parking_lot` locks that are never held while listener code runs.

// === Native boundary ===

pub mod native;
pub mod safety;
pub mod trampoline;

// === Ownership and teardown ===

pub mod diagnostics;
pub mod handle;
pub mod lifecycle;

// === Event bridge ===

pub mod event;
pub mod latch;
pub mod registration;

// === Direct rendering ===

pub mod buffer;
pub mod direct;

// === Composite objects ===

pub mod config;
pub mod context;
pub mod error;
pub mod media;
pub mod player;

pub mod simulated;

pub use buffer::{AlignedBuffer, BufferPool};
pub use config::BridgeConfig;
pub use context::MediaBridge;
pub use direct::{BufferFormat, BufferFormatCallback, DirectVideo, RenderCallback};
pub use error::{BridgeError, Result};
pub use event::{
    EventKind, MediaEvent, MediaEventListener, MediaState, ParsedStatus, Picture, PictureType,
    PlayerEvent, PlayerEventListener, TypedEvent,
};
pub use latch::{BlockingLatch, LatchOutcome};
pub use media::{Media, ParseFlags, ThumbnailRequest, ThumbnailSpeed};
pub use player::MediaPlayer;
pub use registration::ListenerId;
