//! Track configuration

use serde::{Deserialize, Serialize};

use rf_core::{AudioFormat, RfError, RfResult};

use crate::overlap::CrossfadeCurve;

/// Output layout and mixing tunables of an [`AudioTrack`](crate::AudioTrack)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    /// Layout handed to callers; clips must match its channels and rate
    pub format: AudioFormat,
    /// Frames mixed per queued block
    pub mix_chunk_frames: usize,
    /// Curve for newly created overlaps
    pub crossfade_curve: CrossfadeCurve,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            mix_chunk_frames: 1024,
            crossfade_curve: CrossfadeCurve::default(),
        }
    }
}

impl TrackConfig {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> RfResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> RfResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> RfResult<()> {
        self.format.validate()?;
        if self.mix_chunk_frames == 0 {
            return Err(RfError::Config("mix_chunk_frames must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rf_core::SampleFormat;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = TrackConfig::from_json(r#"{ "crossfade_curve": "Linear" }"#).unwrap();
        assert_eq!(config.crossfade_curve, CrossfadeCurve::Linear);
        assert_eq!(config.mix_chunk_frames, 1024);
        assert_eq!(config.format.sample_format, SampleFormat::F32);
    }

    #[test]
    fn test_zero_chunk_rejected() {
        let config = TrackConfig {
            mix_chunk_frames: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RfError::Config(_))));
    }
}
