//! Timeline clips and the sample sources behind them
//!
//! Clip geometry is kept in milliseconds (timeline start, trimmed offsets);
//! sample positions are derived at the track's output rate when reading.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rf_core::{
    AudioFormat, RfError, RfResult, SampleFormat, f32_from_le_bytes, ms_to_samples,
    reverse_frames_in_place, samples_to_ms,
};
use rf_reader::{AudioReader, MediaSource, ReaderConfig};

// ═══════════════════════════════════════════════════════════════════════════════
// IDS
// ═══════════════════════════════════════════════════════════════════════════════

static NEXT_CLIP_ID: AtomicU64 = AtomicU64::new(1);

pub type ClipId = u64;
pub type TrackId = u64;

fn new_clip_id() -> ClipId {
    NEXT_CLIP_ID.fetch_add(1, Ordering::Relaxed)
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLIP SOURCE
// ═══════════════════════════════════════════════════════════════════════════════

/// Sample data of a clip, interleaved f32
pub trait ClipSource: Send {
    /// Channel count and rate of the samples `read` produces
    fn format(&self) -> AudioFormat;

    /// Source length in frames
    fn frames(&self) -> i64;

    /// Fill `dst` with frames starting at `src_frame`, in media order.
    /// Frames past the end are zeroed; returns the frames actually read.
    fn read(&mut self, dst: &mut [f32], src_frame: i64) -> RfResult<usize>;

    /// Hint for sources that cache ahead of the read position
    fn set_direction(&mut self, _forward: bool) {}

    fn try_clone(&self) -> RfResult<Box<dyn ClipSource>>;
}

/// Samples held in memory
#[derive(Clone)]
pub struct MemoryClipSource {
    format: AudioFormat,
    samples: Arc<Vec<f32>>,
}

impl MemoryClipSource {
    pub fn new(channels: u16, sample_rate: u32, samples: Vec<f32>) -> RfResult<Self> {
        let format = AudioFormat::new(channels, sample_rate, SampleFormat::F32);
        format.validate()?;
        if samples.len() % channels as usize != 0 {
            return Err(RfError::InvalidArgument(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }
        Ok(Self {
            format,
            samples: Arc::new(samples),
        })
    }

    /// Generate `frames` frames from `f(frame, channel)`
    pub fn from_fn(
        channels: u16,
        sample_rate: u32,
        frames: usize,
        f: impl Fn(usize, usize) -> f32,
    ) -> RfResult<Self> {
        let ch = channels as usize;
        let samples = (0..frames * ch).map(|i| f(i / ch.max(1), i % ch.max(1))).collect();
        Self::new(channels, sample_rate, samples)
    }
}

impl ClipSource for MemoryClipSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn frames(&self) -> i64 {
        (self.samples.len() / self.format.channels as usize) as i64
    }

    fn read(&mut self, dst: &mut [f32], src_frame: i64) -> RfResult<usize> {
        let ch = self.format.channels as usize;
        dst.fill(0.0);
        if src_frame < 0 || src_frame >= self.frames() {
            return Ok(0);
        }
        let begin = src_frame as usize * ch;
        let len = dst.len().min(self.samples.len() - begin);
        dst[..len].copy_from_slice(&self.samples[begin..begin + len]);
        Ok(len / ch)
    }

    fn try_clone(&self) -> RfResult<Box<dyn ClipSource>> {
        Ok(Box::new(self.clone()))
    }
}

/// Samples pulled through an [`AudioReader`]
///
/// Reads follow the reader's cursor; a read that does not continue where
/// the last one stopped seeks first. In backward mode the reader caches
/// ahead of the (descending) play position and the block is flipped back
/// into media order.
pub struct ReaderClipSource {
    reader: AudioReader,
    source: Arc<dyn MediaSource>,
    config: ReaderConfig,
    format: AudioFormat,
    frames: i64,
    forward: bool,
    scratch: Vec<u8>,
}

impl ReaderClipSource {
    pub fn new(
        source: Arc<dyn MediaSource>,
        channels: u16,
        sample_rate: u32,
        config: ReaderConfig,
    ) -> RfResult<Self> {
        let format = AudioFormat::new(channels, sample_rate, SampleFormat::F32);
        let reader = AudioReader::new(config.clone())?;
        reader.open(source.clone())?;
        reader.configure(format)?;
        reader.start()?;
        let frames = reader
            .total_samples()
            .unwrap_or_else(|| ms_to_samples(source.info().duration_ms, sample_rate));
        Ok(Self {
            reader,
            source,
            config,
            format,
            frames,
            forward: true,
            scratch: Vec::new(),
        })
    }
}

impl ClipSource for ReaderClipSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn frames(&self) -> i64 {
        self.frames
    }

    fn read(&mut self, dst: &mut [f32], src_frame: i64) -> RfResult<usize> {
        let ch = self.format.channels as usize;
        let want = dst.len() / ch;
        dst.fill(0.0);
        if want == 0 || src_frame < 0 || src_frame >= self.frames {
            return Ok(0);
        }

        // the reader hands out frames from its cursor: forward from the
        // block start, backward from the block end
        let anchor = if self.forward {
            src_frame
        } else {
            (src_frame + want as i64).min(self.frames)
        };
        if self.reader.cursor() != anchor {
            self.reader.seek_to_sample(anchor)?;
        }

        self.scratch.resize(want * self.format.frame_size(), 0);
        let outcome = self.reader.read_audio_samples(&mut self.scratch, true)?;
        let got = outcome.frames;
        if self.forward {
            f32_from_le_bytes(&self.scratch[..outcome.bytes], &mut dst[..got * ch]);
        } else {
            // the reader returned [anchor - got, anchor) reversed
            let offset = (anchor - got as i64 - src_frame).max(0) as usize;
            let block = &mut dst[offset * ch..(offset + got) * ch];
            f32_from_le_bytes(&self.scratch[..outcome.bytes], block);
            reverse_frames_in_place(block, ch);
        }
        Ok(got)
    }

    fn set_direction(&mut self, forward: bool) {
        self.forward = forward;
        self.reader.set_direction(forward);
    }

    fn try_clone(&self) -> RfResult<Box<dyn ClipSource>> {
        let mut clone = Self::new(
            self.source.clone(),
            self.format.channels,
            self.format.sample_rate,
            self.config.clone(),
        )?;
        clone.set_direction(self.forward);
        Ok(Box::new(clone))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AUDIO CLIP
// ═══════════════════════════════════════════════════════════════════════════════

/// Geometry of a clip, without its source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipInfo {
    pub id: ClipId,
    pub track_id: Option<TrackId>,
    /// Timeline position (ms)
    pub start: i64,
    pub duration: i64,
    pub start_offset: i64,
    pub end_offset: i64,
}

impl ClipInfo {
    pub fn end(&self) -> i64 {
        self.start + self.duration
    }
}

/// Audio clip placed on a timeline
pub struct AudioClip {
    id: ClipId,
    /// Owning track, `None` while detached
    track_id: Option<TrackId>,
    /// Timeline position (ms)
    start: i64,
    /// Untrimmed source length (ms)
    source_duration: i64,
    /// Trimmed from the head of the source (ms)
    start_offset: i64,
    /// Trimmed from the tail of the source (ms)
    end_offset: i64,
    source: Box<dyn ClipSource>,
}

impl std::fmt::Debug for AudioClip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioClip")
            .field("id", &self.id)
            .field("track_id", &self.track_id)
            .field("start", &self.start)
            .field("duration", &self.duration())
            .field("start_offset", &self.start_offset)
            .field("end_offset", &self.end_offset)
            .finish()
    }
}

impl AudioClip {
    pub fn new(start: i64, source: Box<dyn ClipSource>) -> Self {
        let rate = source.format().sample_rate;
        Self {
            id: new_clip_id(),
            track_id: None,
            start,
            source_duration: samples_to_ms(source.frames(), rate),
            start_offset: 0,
            end_offset: 0,
            source,
        }
    }

    pub fn id(&self) -> ClipId {
        self.id
    }

    pub fn track_id(&self) -> Option<TrackId> {
        self.track_id
    }

    pub(crate) fn set_track(&mut self, track: Option<TrackId>) {
        self.track_id = track;
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn duration(&self) -> i64 {
        self.source_duration - self.start_offset - self.end_offset
    }

    pub fn end(&self) -> i64 {
        self.start + self.duration()
    }

    pub fn start_offset(&self) -> i64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> i64 {
        self.end_offset
    }

    pub fn source_duration(&self) -> i64 {
        self.source_duration
    }

    pub fn format(&self) -> AudioFormat {
        self.source.format()
    }

    pub fn info(&self) -> ClipInfo {
        ClipInfo {
            id: self.id,
            track_id: self.track_id,
            start: self.start,
            duration: self.duration(),
            start_offset: self.start_offset,
            end_offset: self.end_offset,
        }
    }

    pub fn set_start(&mut self, start: i64) {
        self.start = start;
    }

    /// Trim the head. The material stays anchored to the timeline, so the
    /// clip start moves by the same amount as the offset.
    pub fn change_start_offset(&mut self, offset: i64) -> RfResult<()> {
        if offset < 0 || offset + self.end_offset >= self.source_duration {
            return Err(RfError::InvalidArgument(format!(
                "start offset {} leaves no material in clip {}",
                offset, self.id
            )));
        }
        self.start += offset - self.start_offset;
        self.start_offset = offset;
        Ok(())
    }

    pub fn change_end_offset(&mut self, offset: i64) -> RfResult<()> {
        if offset < 0 || self.start_offset + offset >= self.source_duration {
            return Err(RfError::InvalidArgument(format!(
                "end offset {} leaves no material in clip {}",
                offset, self.id
            )));
        }
        self.end_offset = offset;
        Ok(())
    }

    /// Timeline frame range `[begin, end)` at `rate`
    pub fn frame_range(&self, rate: u32) -> (i64, i64) {
        (ms_to_samples(self.start, rate), ms_to_samples(self.end(), rate))
    }

    /// Overlapping timeline range with another clip, if any
    pub fn intersection(&self, other: &AudioClip) -> Option<(i64, i64)> {
        let begin = self.start.max(other.start);
        let end = self.end().min(other.end());
        (end > begin).then_some((begin, end))
    }

    pub(crate) fn set_direction(&mut self, forward: bool) {
        self.source.set_direction(forward);
    }

    /// Read timeline frames `[frame, frame + dst.len() / channels)`.
    /// Frames outside the trimmed clip read as silence.
    pub(crate) fn read_at(&mut self, dst: &mut [f32], frame: i64, rate: u32) -> RfResult<()> {
        let ch = self.format().channels as usize;
        let frames = (dst.len() / ch) as i64;
        let (begin, end) = self.frame_range(rate);
        dst.fill(0.0);

        let lo = frame.max(begin);
        let hi = (frame + frames).min(end);
        if lo >= hi {
            return Ok(());
        }
        let src = lo - begin + ms_to_samples(self.start_offset, rate);
        let out = &mut dst[(lo - frame) as usize * ch..(hi - frame) as usize * ch];
        self.source.read(out, src)?;
        Ok(())
    }

    /// Copy with a fresh id and a cloned source, detached from any track
    pub fn try_clone(&self) -> RfResult<Self> {
        Ok(Self {
            id: new_clip_id(),
            track_id: None,
            start: self.start,
            source_duration: self.source_duration,
            start_offset: self.start_offset,
            end_offset: self.end_offset,
            source: self.source.try_clone()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_clip(start: i64, ms: usize) -> AudioClip {
        // 1 kHz mono, one frame per ms
        let source = MemoryClipSource::from_fn(1, 1000, ms, |i, _| i as f32).unwrap();
        AudioClip::new(start, Box::new(source))
    }

    #[test]
    fn test_duration_follows_offsets() {
        let mut clip = ramp_clip(1000, 5000);
        assert_eq!(clip.duration(), 5000);
        clip.change_end_offset(1000).unwrap();
        assert_eq!(clip.duration(), 4000);
        assert_eq!(clip.end(), 5000);
    }

    #[test]
    fn test_start_offset_keeps_material_anchored() {
        let mut clip = ramp_clip(1000, 5000);
        clip.change_start_offset(500).unwrap();
        assert_eq!(clip.start(), 1500);
        assert_eq!(clip.duration(), 4500);

        let mut buf = [0.0f32; 3];
        clip.read_at(&mut buf, 1500, 1000).unwrap();
        assert_eq!(buf, [500.0, 501.0, 502.0]);

        clip.change_start_offset(200).unwrap();
        assert_eq!(clip.start(), 1200);
    }

    #[test]
    fn test_offsets_must_leave_material() {
        let mut clip = ramp_clip(0, 100);
        assert!(clip.change_start_offset(100).is_err());
        assert!(clip.change_end_offset(-1).is_err());
        clip.change_start_offset(60).unwrap();
        assert!(clip.change_end_offset(40).is_err());
    }

    #[test]
    fn test_read_outside_clip_is_silent() {
        let mut clip = ramp_clip(10, 5);
        let mut buf = [9.0f32; 8];
        clip.read_at(&mut buf, 8, 1000).unwrap();
        assert_eq!(buf, [0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 0.0]);
    }

    #[test]
    fn test_intersection() {
        let a = ramp_clip(0, 5000);
        let b = ramp_clip(4000, 5000);
        let c = ramp_clip(5000, 100);
        assert_eq!(a.intersection(&b), Some((4000, 5000)));
        assert_eq!(a.intersection(&c), None);
    }

    #[test]
    fn test_clone_gets_fresh_id() {
        let clip = ramp_clip(0, 10);
        let copy = clip.try_clone().unwrap();
        assert_ne!(clip.id(), copy.id());
        assert_eq!(copy.duration(), 10);
        assert!(copy.track_id().is_none());
    }

    #[test]
    fn test_memory_source_rejects_ragged_samples() {
        assert!(MemoryClipSource::new(2, 48000, vec![0.0; 3]).is_err());
    }
}
