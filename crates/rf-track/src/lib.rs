//! rf-track: Audio track compositor
//!
//! Mixes the clips of one timeline track into a single PCM stream:
//! - Clips sorted by start, each backed by a [`ClipSource`] (memory or an `AudioReader`)
//! - One crossfade overlap per intersecting clip pair, kept in sync with every edit
//! - Sample-accurate reads in both directions, with seeks at any position
//! - Per-track effect chain and mute

pub mod clip;
pub mod config;
pub mod effect;
pub mod overlap;
pub mod track;

pub use clip::{AudioClip, ClipId, ClipInfo, ClipSource, MemoryClipSource, ReaderClipSource, TrackId};
pub use config::TrackConfig;
pub use effect::{AudioEffect, EffectChain, GainEffect};
pub use overlap::{AudioOverlap, CrossfadeCurve, OverlapId};
pub use track::{AudioTrack, ReadCursor, TrackRead};
