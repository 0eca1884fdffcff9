//! rf-core: Shared types for the media read engine
//!
//! Error taxonomy, time-unit conversions and PCM format types used by
//! `rf-reader` and `rf-track`.

mod error;
mod sample;
mod time;

pub use error::*;
pub use sample::*;
pub use time::*;

/// Playback direction of a reader or track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    #[inline]
    pub fn from_forward(forward: bool) -> Self {
        if forward { Self::Forward } else { Self::Backward }
    }

    #[inline]
    pub fn is_forward(self) -> bool {
        self == Self::Forward
    }
}

impl Default for Direction {
    fn default() -> Self {
        Self::Forward
    }
}
