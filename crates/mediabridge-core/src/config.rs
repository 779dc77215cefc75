//! Bridge configuration.

use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Alignment the native video callbacks expect for plane buffers.
pub const DEFAULT_BUFFER_ALIGNMENT: usize = 32;

/// Default deadline for a blocking `start()`.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration shared by every object created from one [`MediaBridge`](crate::MediaBridge).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Byte alignment for direct-rendering plane buffers (power of two)
    pub buffer_alignment: usize,
    /// Deadline used by `ControlsService::start`
    pub start_timeout: Duration,
    /// Log every dispatched event at trace level
    pub trace_events: bool,
    /// Arguments for engine construction, passed through untouched
    pub engine_args: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer_alignment: DEFAULT_BUFFER_ALIGNMENT,
            start_timeout: DEFAULT_START_TIMEOUT,
            trace_events: false,
            engine_args: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Default configuration with environment overrides applied.
    ///
    /// - `MEDIABRIDGE_BUFFER_ALIGNMENT`: plane buffer alignment in bytes
    /// - `MEDIABRIDGE_START_TIMEOUT_MS`: blocking start deadline
    /// - `MEDIABRIDGE_TRACE_EVENTS`: `1`/`true` to trace every event
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("MEDIABRIDGE_BUFFER_ALIGNMENT") {
            match value.parse::<usize>() {
                Ok(alignment) if alignment.is_power_of_two() => {
                    config.buffer_alignment = alignment;
                }
                _ => tracing::warn!(
                    "Ignoring MEDIABRIDGE_BUFFER_ALIGNMENT={value:?}: expected a power of two"
                ),
            }
        }

        if let Ok(value) = std::env::var("MEDIABRIDGE_START_TIMEOUT_MS") {
            match value.parse::<u64>() {
                Ok(ms) => config.start_timeout = Duration::from_millis(ms),
                Err(_) => tracing::warn!(
                    "Ignoring MEDIABRIDGE_START_TIMEOUT_MS={value:?}: expected milliseconds"
                ),
            }
        }

        config.trace_events = std::env::var("MEDIABRIDGE_TRACE_EVENTS")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        config
    }

    /// Checks invariants the rest of the crate relies on.
    pub fn validate(&self) -> Result<()> {
        if !self.buffer_alignment.is_power_of_two() {
            return Err(BridgeError::InvalidAlignment(self.buffer_alignment));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.buffer_alignment, 32);
        assert_eq!(config.start_timeout, Duration::from_secs(10));
        assert!(!config.trace_events);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_odd_alignment() {
        let config = BridgeConfig {
            buffer_alignment: 24,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(BridgeError::InvalidAlignment(24)));

        let config = BridgeConfig {
            buffer_alignment: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
