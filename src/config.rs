//! Engine configuration
//!
//! Stored as TOML. Every field has a default, so a partial file (or an
//! empty one) is a valid configuration.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::{
    DEFAULT_AUDIO_BITRATE, DEFAULT_CHANNELS, DEFAULT_FPS, DEFAULT_JITTER_COMP_MS,
    DEFAULT_PTIME_MS, DEFAULT_SAMPLE_RATE, DEFAULT_TICKER_PERIOD_MS, OPUS_PAYLOAD_TYPE,
    QUEUE_CAPACITY, RAW_VIDEO_PAYLOAD_TYPE, RTCP_DEFAULT_INTERVAL_MS, VIDEO_CLOCK_RATE,
};
use crate::error::{Error, Result};
use crate::rtp::SessionParams;
use crate::srtp::SrtpSuite;
use crate::video::VideoGeometry;

/// Settings of one audio or video stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Remote host name or address
    pub remote_host: String,
    pub remote_rtp_port: u16,
    pub remote_rtcp_port: u16,
    pub local_rtp_port: u16,
    pub local_rtcp_port: u16,
    /// Bind the IPv6 wildcard address instead of the IPv4 one
    pub ipv6: bool,
    pub payload_type: u8,
    /// RTP clock rate (also the audio sample rate)
    pub clock_rate: u32,
    pub channels: u16,
    /// Audio packet duration
    pub ptime_ms: u32,
    /// Encoder target bitrate (bps)
    pub bitrate: u32,
    /// Video frame rate
    pub fps: u32,
    pub jitter_comp_ms: u32,
    pub adaptive_jitter: bool,
    pub adaptive_bitrate: bool,
    pub symmetric_rtp: bool,
    pub rtcp_interval_ms: u64,
    /// DSCP applied to both sockets when set
    pub dscp: Option<u8>,
    pub cname: Option<String>,
    pub tool: Option<String>,
    pub ticker_period_ms: u64,
    pub video_size: VideoGeometry,
}

impl StreamConfig {
    pub fn audio() -> Self {
        Self {
            remote_host: "127.0.0.1".to_string(),
            remote_rtp_port: 7078,
            remote_rtcp_port: 7079,
            local_rtp_port: 7078,
            local_rtcp_port: 7079,
            ipv6: false,
            payload_type: OPUS_PAYLOAD_TYPE,
            clock_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            ptime_ms: DEFAULT_PTIME_MS,
            bitrate: DEFAULT_AUDIO_BITRATE,
            fps: DEFAULT_FPS,
            jitter_comp_ms: DEFAULT_JITTER_COMP_MS,
            adaptive_jitter: true,
            adaptive_bitrate: false,
            symmetric_rtp: true,
            rtcp_interval_ms: RTCP_DEFAULT_INTERVAL_MS,
            dscp: None,
            cname: None,
            tool: None,
            ticker_period_ms: DEFAULT_TICKER_PERIOD_MS,
            video_size: VideoGeometry::CIF,
        }
    }

    pub fn video() -> Self {
        Self {
            remote_rtp_port: 9078,
            remote_rtcp_port: 9079,
            local_rtp_port: 9078,
            local_rtcp_port: 9079,
            payload_type: RAW_VIDEO_PAYLOAD_TYPE,
            clock_rate: VIDEO_CLOCK_RATE,
            bitrate: 256_000,
            video_size: VideoGeometry::QCIF,
            ..Self::audio()
        }
    }

    /// Session parameters derived from this stream
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            payload_type: self.payload_type,
            clock_rate: self.clock_rate,
            jitter_comp_ms: self.jitter_comp_ms,
            adaptive_jitter: self.adaptive_jitter,
            symmetric_rtp: self.symmetric_rtp,
            rtcp_interval_ms: self.rtcp_interval_ms,
            ..SessionParams::default()
        }
    }

    /// Check values that would only fail later, deep inside a subsystem
    pub fn validate(&self) -> Result<()> {
        if self.payload_type > 127 {
            return Err(Error::Config(format!(
                "payload type {} out of range",
                self.payload_type
            )));
        }
        if self.clock_rate == 0 {
            return Err(Error::Config("clock rate must be positive".into()));
        }
        if self.ticker_period_ms == 0 {
            return Err(Error::Config("ticker period must be positive".into()));
        }
        if let Some(dscp) = self.dscp {
            if dscp > 63 {
                return Err(Error::Config(format!("DSCP {} out of range", dscp)));
            }
        }
        if !self.video_size.is_valid() {
            return Err(Error::Config(format!(
                "video size {}x{} is not usable",
                self.video_size.width, self.video_size.height
            )));
        }
        if crate::codec::fragment_count(self.video_size) > QUEUE_CAPACITY {
            return Err(Error::Config(format!(
                "video size {}x{} is too large for raw video transport",
                self.video_size.width, self.video_size.height
            )));
        }
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::audio()
    }
}

/// SRTP keying for both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SrtpConfig {
    pub suite: SrtpSuite,
    /// Base64 master key and salt used for what we send
    pub send_key: String,
    /// Base64 master key and salt used for what we receive
    pub recv_key: String,
}

/// Top level configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    pub audio: StreamConfig,
    pub video: StreamConfig,
    pub srtp: Option<SrtpConfig>,
}

/// File layout before per-kind defaults are filled in
#[derive(Deserialize)]
struct RawConfig {
    audio: Option<toml::Table>,
    video: Option<toml::Table>,
    srtp: Option<SrtpConfig>,
}

/// Overlay the keys present in a file section on a kind's defaults
fn section(defaults: StreamConfig, table: Option<toml::Table>) -> Result<StreamConfig> {
    let Some(table) = table else {
        return Ok(defaults);
    };
    let mut merged = toml::Value::try_from(&defaults).map_err(|e| Error::Config(e.to_string()))?;
    if let toml::Value::Table(fields) = &mut merged {
        fields.extend(table);
    }
    merged.try_into().map_err(|e: toml::de::Error| Error::Config(e.to_string()))
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            audio: StreamConfig::audio(),
            video: StreamConfig::video(),
            srtp: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        let config = Self {
            audio: section(StreamConfig::audio(), raw.audio)?,
            video: section(StreamConfig::video(), raw.video)?,
            srtp: raw.srtp,
        };
        config.audio.validate()?;
        config.video.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Save as a TOML file, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Per-user configuration file location
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "mediastream", "media-stream-engine")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.video.clock_rate, VIDEO_CLOCK_RATE);
    }

    #[test]
    fn test_partial_section() {
        let config = EngineConfig::from_toml_str(
            r#"
            [audio]
            remote_host = "192.0.2.7"
            dscp = 46

            [srtp]
            suite = "AES_CM_128_HMAC_SHA1_32"
            send_key = "a"
            recv_key = "b"
            "#,
        )
        .unwrap();
        assert_eq!(config.audio.remote_host, "192.0.2.7");
        assert_eq!(config.audio.dscp, Some(46));
        assert_eq!(config.audio.clock_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(config.srtp.unwrap().suite, SrtpSuite::AesCm128HmacSha1_32);
    }

    #[test]
    fn test_video_section_keeps_video_defaults() {
        let config = EngineConfig::from_toml_str("[video]\nfps = 25").unwrap();
        assert_eq!(config.video.fps, 25);
        assert_eq!(config.video.clock_rate, VIDEO_CLOCK_RATE);
        assert_eq!(config.video.local_rtp_port, 9078);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(EngineConfig::from_toml_str("[audio]\ndscp = 64").is_err());
        assert!(EngineConfig::from_toml_str("[video]\nticker_period_ms = 0").is_err());
        assert!(EngineConfig::from_toml_str("[video]\nvideo_size = { width = 15, height = 10, stride = 15 }").is_err());
        assert!(EngineConfig::from_toml_str("[video]\nvideo_size = { width = 640, height = 480, stride = 640 }").is_err());
        assert!(EngineConfig::from_toml_str("[audio]\nclock_rate = \"fast\"").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir()
            .join(format!("mse-config-{}", std::process::id()))
            .join("config.toml");
        let mut config = EngineConfig::default();
        config.audio.cname = Some("alice@example.org".into());
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
