//! Reader configuration
//!
//! Tunables shared by video and audio readers, loadable from JSON, and the
//! video output description handed to frame converters.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rf_core::{RfError, RfResult};

use crate::codec::PixelFormat;

/// Reader tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Seconds cached ahead of the read head in the travel direction
    pub forward_cache_secs: f64,
    /// Seconds cached behind the read head
    pub backward_cache_secs: f64,
    /// Decoded-but-unconverted video frames allowed before decoding pauses
    pub max_pending_frames: i64,
    /// Sleep of an idle worker thread (ms)
    pub idle_wait_ms: u64,
    /// Ask the source for a hardware video decoder
    pub prefer_hardware: bool,
    /// Length of an audio task (seconds)
    pub audio_task_secs: f64,
    /// Append every converted audio frame to this file (raw PCM)
    pub pcm_dump_path: Option<PathBuf>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            forward_cache_secs: 1.0,
            backward_cache_secs: 0.5,
            max_pending_frames: 8,
            idle_wait_ms: 5,
            prefer_hardware: false,
            audio_task_secs: 1.0,
            pcm_dump_path: None,
        }
    }
}

impl ReaderConfig {
    pub fn from_json(json: &str) -> RfResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> RfResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn to_json(&self) -> RfResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> RfResult<()> {
        if !(self.forward_cache_secs >= 0.0 && self.backward_cache_secs >= 0.0) {
            return Err(RfError::Config(format!(
                "cache durations must be non-negative (forward {}, backward {})",
                self.forward_cache_secs, self.backward_cache_secs
            )));
        }
        if self.max_pending_frames < 1 {
            return Err(RfError::Config("max_pending_frames must be at least 1".into()));
        }
        if !(self.audio_task_secs > 0.0) {
            return Err(RfError::Config("audio_task_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn forward_cache_ms(&self) -> i64 {
        secs_to_ms(self.forward_cache_secs)
    }

    pub fn backward_cache_ms(&self) -> i64 {
        secs_to_ms(self.backward_cache_secs)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }
}

pub(crate) fn secs_to_ms(secs: f64) -> i64 {
    (secs * 1000.0).round() as i64
}

// ============ Video Output ============

/// Scaling filter used when resizing frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interpolation {
    Nearest,
    Bilinear,
    Bicubic,
    Lanczos,
}

impl Default for Interpolation {
    fn default() -> Self {
        Self::Bilinear
    }
}

/// Requested output of a video reader
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoOutputConfig {
    /// 0 keeps the source size (or follows `height` keeping aspect)
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub interpolation: Interpolation,
}

impl Default for VideoOutputConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            format: PixelFormat::Rgba32,
            interpolation: Interpolation::Bilinear,
        }
    }
}

impl VideoOutputConfig {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            ..Default::default()
        }
    }

    /// Output size for a source of `src_w` x `src_h`
    pub fn resolve_size(&self, src_w: u32, src_h: u32) -> (u32, u32) {
        match (self.width, self.height) {
            (0, 0) => (src_w, src_h),
            (w, 0) if src_w > 0 => (w, ((w as u64 * src_h as u64) / src_w as u64).max(1) as u32),
            (0, h) if src_h > 0 => (((h as u64 * src_w as u64) / src_h as u64).max(1) as u32, h),
            (w, h) => (w, h),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReaderConfig::default();
        assert_eq!(config.forward_cache_ms(), 1000);
        assert_eq!(config.backward_cache_ms(), 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ReaderConfig::from_json(r#"{ "forward_cache_secs": 1.5 }"#).unwrap();
        assert_eq!(config.forward_cache_ms(), 1500);
        assert_eq!(config.max_pending_frames, 8);
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(ReaderConfig::from_json(r#"{ "backward_cache_secs": -1.0 }"#).is_err());
        assert!(matches!(
            ReaderConfig::from_json("not json"),
            Err(RfError::Serialization(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reader.json");
        let config = ReaderConfig {
            idle_wait_ms: 2,
            ..Default::default()
        };
        fs::write(&path, config.to_json().unwrap()).unwrap();
        assert_eq!(ReaderConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_resolve_size() {
        let out = VideoOutputConfig::new(320, 0, PixelFormat::Rgb24);
        assert_eq!(out.resolve_size(1920, 1080), (320, 180));
        assert_eq!(VideoOutputConfig::default().resolve_size(64, 48), (64, 48));
    }
}
