//! The factory every media item and player is created from.

use std::sync::Arc;

use crate::config::BridgeConfig;
use crate::direct::{BufferFormatCallback, RenderCallback};
use crate::error::Result;
use crate::media::Media;
use crate::native::NativeEngine;
use crate::player::{DirectCallbacks, MediaPlayer};

/// One engine plus the configuration shared by everything created from it.
///
/// Contexts are independent: several can coexist, each with its own engine.
#[derive(Clone)]
pub struct MediaBridge {
    engine: Arc<dyn NativeEngine>,
    config: Arc<BridgeConfig>,
}

impl MediaBridge {
    pub fn new(engine: Arc<dyn NativeEngine>, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            "media bridge ready (alignment {}, start timeout {:?}, {} engine args)",
            config.buffer_alignment,
            config.start_timeout,
            config.engine_args.len()
        );
        Ok(Self {
            engine,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.engine
    }

    pub fn new_media(&self, mrl: &str) -> Result<Media> {
        self.new_media_with_options(mrl, &[])
    }

    pub fn new_media_with_options(&self, mrl: &str, options: &[&str]) -> Result<Media> {
        Media::new(&self.engine, &self.config, mrl, options)
    }

    pub fn new_player(&self) -> Result<MediaPlayer> {
        MediaPlayer::new(&self.engine, &self.config, None)
    }

    /// A player rendering into application-owned aligned buffers.
    pub fn new_direct_player(
        &self,
        format_callback: Arc<dyn BufferFormatCallback>,
        render_callback: Arc<dyn RenderCallback>,
    ) -> Result<MediaPlayer> {
        MediaPlayer::new(
            &self.engine,
            &self.config,
            Some(DirectCallbacks {
                format: format_callback,
                render: render_callback,
            }),
        )
    }
}

impl std::fmt::Debug for MediaBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaBridge")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
