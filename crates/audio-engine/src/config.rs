//! Engine configuration and the preferences store
//!
//! [`EngineConfig`] holds the tuning knobs owned by the engine itself; the
//! user's device choices and gain/mute defaults are read through the
//! [`AudioPreferences`] trait, which the engine never writes back to.
//!
//! ```rust
//! use rvoip_audio_engine::config::{EngineConfig, LatencyConfig, ResamplerKind};
//!
//! let config = EngineConfig::new()
//!     .with_application_name("softphone")
//!     .with_latency(LatencyConfig::low_latency())
//!     .with_resampler(ResamplerKind::Linear)
//!     .with_start_timeout_ms(2_000);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.latency.target_ms, 20);
//! ```

use crate::backend::BufferAttributes;
use crate::error::{EngineError, EngineResult};
use crate::types::{AudioFormat, StreamRole};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stream buffering targets in milliseconds
///
/// Converted to explicit byte lengths per stream so the server's tick rate
/// stays bounded and periodic instead of being left to "auto".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Maximum buffered audio (`maxlength`)
    pub max_ms: u32,
    /// Target buffered audio for playback (`tlength`)
    pub target_ms: u32,
    /// Audio required before playback starts (`prebuf`)
    pub prebuffer_ms: u32,
    /// Minimum request size per write callback (`minreq`)
    pub min_request_ms: u32,
    /// Capture fragment size (`fragsize`)
    pub fragment_ms: u32,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            max_ms: 80,
            target_ms: 40,
            prebuffer_ms: 20,
            min_request_ms: 20,
            fragment_ms: 20,
        }
    }
}

impl LatencyConfig {
    /// Tightest setting still inside the 20–80 ms window
    pub fn low_latency() -> Self {
        Self {
            max_ms: 40,
            target_ms: 20,
            prebuffer_ms: 10,
            min_request_ms: 10,
            fragment_ms: 10,
        }
    }

    /// Check value ordering
    pub fn validate(&self) -> EngineResult<()> {
        let values = [
            self.max_ms,
            self.target_ms,
            self.prebuffer_ms,
            self.min_request_ms,
            self.fragment_ms,
        ];
        if values.iter().any(|v| *v == 0) {
            return Err(EngineError::configuration("latency values must be non-zero"));
        }
        if self.min_request_ms > self.target_ms || self.target_ms > self.max_ms {
            return Err(EngineError::configuration(format!(
                "latency must satisfy min_request ({}) <= target ({}) <= max ({})",
                self.min_request_ms, self.target_ms, self.max_ms
            )));
        }
        if self.prebuffer_ms > self.target_ms {
            return Err(EngineError::configuration(format!(
                "prebuffer ({} ms) exceeds target ({} ms)",
                self.prebuffer_ms, self.target_ms
            )));
        }
        Ok(())
    }

    /// Byte-length buffer attributes for a stream of `role` in `format`
    pub fn attributes_for(&self, role: StreamRole, format: &AudioFormat) -> BufferAttributes {
        match role {
            StreamRole::Playback | StreamRole::Ringtone => BufferAttributes {
                max_length: format.bytes_for_ms(self.max_ms) as u32,
                target_length: format.bytes_for_ms(self.target_ms) as u32,
                prebuffer: format.bytes_for_ms(self.prebuffer_ms) as u32,
                min_request: format.bytes_for_ms(self.min_request_ms) as u32,
                fragment_size: u32::MAX,
            },
            StreamRole::Capture => BufferAttributes {
                max_length: format.bytes_for_ms(self.max_ms) as u32,
                target_length: u32::MAX,
                prebuffer: u32::MAX,
                min_request: u32::MAX,
                fragment_size: format.bytes_for_ms(self.fragment_ms) as u32,
            },
        }
    }
}

/// Resampling algorithm used when stream and pipeline rates differ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResamplerKind {
    /// Linear interpolation, no extra latency
    Linear,
    /// Band-limited resampling (requires the `format-conversion` feature)
    Sinc,
}

impl Default for ResamplerKind {
    fn default() -> Self {
        ResamplerKind::Linear
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Client name announced to the audio server
    pub application_name: String,
    /// Stream buffering targets
    pub latency: LatencyConfig,
    /// Default bound on `start()` when the caller passes none
    pub start_timeout_ms: u64,
    /// Resampler used by the mixer
    pub resampler: ResamplerKind,
    /// Remove DC bias from captured audio
    pub dc_removal: bool,
    /// Capacity of the engine event broadcast channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            application_name: "rvoip".to_string(),
            latency: LatencyConfig::default(),
            start_timeout_ms: 5_000,
            resampler: ResamplerKind::default(),
            dc_removal: true,
            event_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON configuration; missing fields take defaults
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::configuration(format!("invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the client name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set buffering targets
    pub fn with_latency(mut self, latency: LatencyConfig) -> Self {
        self.latency = latency;
        self
    }

    /// Set the default start timeout
    pub fn with_start_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.start_timeout_ms = timeout_ms;
        self
    }

    /// Set the resampler
    pub fn with_resampler(mut self, resampler: ResamplerKind) -> Self {
        self.resampler = resampler;
        self
    }

    /// Enable or disable capture DC removal
    pub fn with_dc_removal(mut self, enabled: bool) -> Self {
        self.dc_removal = enabled;
        self
    }

    /// Default start timeout as a duration
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> EngineResult<()> {
        self.latency.validate()?;
        if self.application_name.is_empty() {
            return Err(EngineError::configuration("application name must not be empty"));
        }
        if self.event_capacity == 0 {
            return Err(EngineError::configuration("event capacity must be non-zero"));
        }
        #[cfg(not(feature = "format-conversion"))]
        if self.resampler == ResamplerKind::Sinc {
            return Err(EngineError::configuration(
                "sinc resampler requires the format-conversion feature",
            ));
        }
        Ok(())
    }
}

/// Read-only view of the user's audio preferences
///
/// The engine only reads these values; persisting them belongs to the
/// application.
pub trait AudioPreferences: Send + Sync {
    /// Preferred device system name for a role, `None` for the server default
    fn device_name(&self, role: StreamRole) -> Option<String>;

    /// Initial capture gain
    fn capture_gain(&self) -> f64 {
        1.0
    }

    /// Initial playback gain
    fn playback_gain(&self) -> f64 {
        1.0
    }

    /// Whether capture starts muted
    fn capture_muted(&self) -> bool {
        false
    }

    /// Whether playback starts muted
    fn playback_muted(&self) -> bool {
        false
    }

    /// Whether the ringtone starts muted
    fn ringtone_muted(&self) -> bool {
        false
    }
}

/// Plain preferences record, typically loaded from the application's settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicePreferences {
    /// Preferred playback device system name
    pub playback_device: Option<String>,
    /// Preferred capture device system name
    pub capture_device: Option<String>,
    /// Preferred ringtone device system name
    pub ringtone_device: Option<String>,
    /// Initial capture gain
    pub capture_gain: f64,
    /// Initial playback gain
    pub playback_gain: f64,
    /// Capture muted at start
    pub capture_muted: bool,
    /// Playback muted at start
    pub playback_muted: bool,
    /// Ringtone muted at start
    pub ringtone_muted: bool,
}

impl Default for DevicePreferences {
    fn default() -> Self {
        Self {
            playback_device: None,
            capture_device: None,
            ringtone_device: None,
            capture_gain: 1.0,
            playback_gain: 1.0,
            capture_muted: false,
            playback_muted: false,
            ringtone_muted: false,
        }
    }
}

impl DevicePreferences {
    /// Set the preferred device for a role
    pub fn with_device(mut self, role: StreamRole, name: impl Into<String>) -> Self {
        let name = Some(name.into());
        match role {
            StreamRole::Playback => self.playback_device = name,
            StreamRole::Capture => self.capture_device = name,
            StreamRole::Ringtone => self.ringtone_device = name,
        }
        self
    }
}

impl AudioPreferences for DevicePreferences {
    fn device_name(&self, role: StreamRole) -> Option<String> {
        match role {
            StreamRole::Playback => self.playback_device.clone(),
            StreamRole::Capture => self.capture_device.clone(),
            StreamRole::Ringtone => self.ringtone_device.clone(),
        }
    }

    fn capture_gain(&self) -> f64 {
        self.capture_gain
    }

    fn playback_gain(&self) -> f64 {
        self.playback_gain
    }

    fn capture_muted(&self) -> bool {
        self.capture_muted
    }

    fn playback_muted(&self) -> bool {
        self.playback_muted
    }

    fn ringtone_muted(&self) -> bool {
        self.ringtone_muted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_latency_is_valid() {
        assert!(LatencyConfig::default().validate().is_ok());
        assert!(LatencyConfig::low_latency().validate().is_ok());
    }

    #[test]
    fn test_latency_ordering_rejected() {
        let latency = LatencyConfig {
            min_request_ms: 60,
            ..LatencyConfig::default()
        };
        assert!(matches!(
            latency.validate(),
            Err(EngineError::Configuration { .. })
        ));
    }

    #[test]
    fn test_playback_attributes_are_explicit() {
        let format = AudioFormat::studio_stereo();
        let attrs = LatencyConfig::default().attributes_for(StreamRole::Playback, &format);
        assert_eq!(attrs.max_length, 15360);
        assert_eq!(attrs.target_length, 7680);
        assert_eq!(attrs.prebuffer, 3840);
        assert_eq!(attrs.min_request, 3840);
    }

    #[test]
    fn test_capture_attributes_use_fragment_size() {
        let format = AudioFormat::wideband_mono();
        let attrs = LatencyConfig::default().attributes_for(StreamRole::Capture, &format);
        assert_eq!(attrs.fragment_size, 640);
        assert_eq!(attrs.target_length, u32::MAX);
    }

    #[test]
    fn test_config_from_json_fills_defaults() {
        let config = EngineConfig::from_json_str(r#"{"application_name":"phone","dc_removal":false}"#)
            .unwrap();
        assert_eq!(config.application_name, "phone");
        assert!(!config.dc_removal);
        assert_eq!(config.latency, LatencyConfig::default());
    }

    #[test]
    fn test_config_from_json_validates() {
        let result = EngineConfig::from_json_str(r#"{"latency":{"max_ms":10,"target_ms":40}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_device_preferences_lookup() {
        let prefs = DevicePreferences::default()
            .with_device(StreamRole::Capture, "hw:1")
            .with_device(StreamRole::Ringtone, "hw:2");
        assert_eq!(prefs.device_name(StreamRole::Capture).as_deref(), Some("hw:1"));
        assert_eq!(prefs.device_name(StreamRole::Ringtone).as_deref(), Some("hw:2"));
        assert_eq!(prefs.device_name(StreamRole::Playback), None);
    }
}
