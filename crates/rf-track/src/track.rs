//! Audio track: clip list, overlap list and the mixed read
//!
//! Clips are kept sorted by start, overlaps by start. Reading walks the
//! timeline from the read position and alternates between plain clip spans
//! and crossfaded overlap spans, switching exactly at overlap boundaries.
//! Mixed blocks go through the effect chain into a FIFO that serves reads of
//! any length. Any mutation drops the FIFO, so queued audio never outlives
//! the track layout it was mixed from.
//!
//! Every public method takes the track lock once and calls a `*_impl`
//! method that assumes the lock is held.

use std::collections::VecDeque;

use parking_lot::Mutex;

use rf_core::{
    AudioFormat, Direction, RfError, RfResult, ms_to_samples, reverse_frames_in_place,
    samples_to_ms,
};

use crate::clip::{AudioClip, ClipId, ClipInfo, TrackId};
use crate::config::TrackConfig;
use crate::effect::{AudioEffect, EffectChain};
use crate::overlap::{AudioOverlap, OverlapId};

// ═══════════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of one track read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackRead {
    pub frames: usize,
    pub bytes: usize,
    /// Read position (ms) before this read
    pub pos_ms: i64,
    /// No more frames in the current direction
    pub eof: bool,
}

/// Position of the read head in the clip and overlap lists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadCursor {
    /// Clips starting at or before the read position
    pub clip: usize,
    /// Overlaps starting at or before the read position
    pub overlap: usize,
}

struct TrackInner {
    id: TrackId,
    config: TrackConfig,
    /// Sorted by (start, id)
    clips: Vec<AudioClip>,
    /// Sorted by (start, id)
    overlaps: Vec<AudioOverlap>,
    next_overlap_id: OverlapId,
    effects: EffectChain,
    direction: Direction,
    /// Frame delivered next
    read_pos: i64,
    /// Frame where the queued audio ends (in travel direction)
    render_pos: i64,
    cursor: ReadCursor,
    fifo: VecDeque<Vec<f32>>,
    /// Frames already consumed from the front block
    fifo_offset: usize,
    scratch: Vec<f32>,
}

/// Timeline track mixing its clips into one PCM stream
pub struct AudioTrack {
    inner: Mutex<TrackInner>,
}

impl std::fmt::Debug for AudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AudioTrack")
            .field("id", &inner.id)
            .field("clips", &inner.clips.len())
            .field("overlaps", &inner.overlaps.len())
            .field("read_pos", &inner.read_pos)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PUBLIC API
// ═══════════════════════════════════════════════════════════════════════════════

impl AudioTrack {
    pub fn new(id: TrackId, config: TrackConfig) -> RfResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Mutex::new(TrackInner::new(id, config)),
        })
    }

    pub fn id(&self) -> TrackId {
        self.inner.lock().id
    }

    pub fn format(&self) -> AudioFormat {
        self.inner.lock().config.format
    }

    /// Take ownership of a detached clip
    pub fn insert_clip(&self, clip: AudioClip) -> RfResult<ClipId> {
        self.inner.lock().insert_clip_impl(clip)
    }

    pub fn move_clip(&self, id: ClipId, start: i64) -> RfResult<()> {
        self.inner.lock().move_clip_impl(id, start)
    }

    /// Set both trim offsets (ms); the clip start follows the head trim
    pub fn change_clip_range(&self, id: ClipId, start_offset: i64, end_offset: i64) -> RfResult<()> {
        self.inner.lock().change_clip_range_impl(id, start_offset, end_offset)
    }

    pub fn remove_clip_by_id(&self, id: ClipId) -> RfResult<AudioClip> {
        let mut inner = self.inner.lock();
        let index = inner.index_of(id)?;
        inner.remove_clip_impl(index)
    }

    pub fn remove_clip_by_index(&self, index: usize) -> RfResult<AudioClip> {
        let mut inner = self.inner.lock();
        if index >= inner.clips.len() {
            return Err(RfError::InvalidArgument(format!("no clip at index {}", index)));
        }
        inner.remove_clip_impl(index)
    }

    pub fn clip_by_id(&self, id: ClipId) -> Option<ClipInfo> {
        let inner = self.inner.lock();
        inner.clips.iter().find(|c| c.id() == id).map(AudioClip::info)
    }

    /// Clip at `index` in start order
    pub fn clip_by_index(&self, index: usize) -> Option<ClipInfo> {
        self.inner.lock().clips.get(index).map(AudioClip::info)
    }

    pub fn clips(&self) -> Vec<ClipInfo> {
        self.inner.lock().clips.iter().map(AudioClip::info).collect()
    }

    pub fn clip_count(&self) -> usize {
        self.inner.lock().clips.len()
    }

    pub fn overlap_by_id(&self, id: OverlapId) -> Option<AudioOverlap> {
        self.inner.lock().overlaps.iter().find(|o| o.id == id).cloned()
    }

    /// Overlaps in start order
    pub fn overlaps(&self) -> Vec<AudioOverlap> {
        self.inner.lock().overlaps.clone()
    }

    /// End of the last clip by start order (ms), 0 when empty
    pub fn duration(&self) -> i64 {
        self.inner.lock().duration_impl()
    }

    pub fn seek_to(&self, pos_ms: i64) -> RfResult<()> {
        let mut inner = self.inner.lock();
        let frame = ms_to_samples(pos_ms, inner.config.format.sample_rate);
        inner.seek_impl(frame)
    }

    pub fn seek_to_sample(&self, frame: i64) -> RfResult<()> {
        self.inner.lock().seek_impl(frame)
    }

    pub fn set_direction(&self, forward: bool) {
        self.inner.lock().set_direction_impl(forward);
    }

    pub fn direction(&self) -> Direction {
        self.inner.lock().direction
    }

    /// Fill `buf` with mixed frames in the track format, moving the read
    /// position in the current direction. Stops early only at the track
    /// edges.
    pub fn read_audio_samples(&self, buf: &mut [u8]) -> RfResult<TrackRead> {
        self.inner.lock().read_audio_samples_impl(buf)
    }

    pub fn set_muted(&self, muted: bool) {
        let mut inner = self.inner.lock();
        inner.effects.set_muted(muted);
        inner.invalidate();
    }

    pub fn is_muted(&self) -> bool {
        self.inner.lock().effects.is_muted()
    }

    pub fn add_effect(&self, effect: Box<dyn AudioEffect>) {
        let mut inner = self.inner.lock();
        inner.effects.add(effect);
        inner.invalidate();
    }

    pub fn set_effect_param(&self, effect: usize, param: usize, value: f64) -> RfResult<()> {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.effects.effect_mut(effect) else {
            return Err(RfError::InvalidArgument(format!("no effect at index {}", effect)));
        };
        slot.set_param(param, value);
        inner.invalidate();
        Ok(())
    }

    /// Copy of this track with cloned clips and the same effect settings
    pub fn clone_track(&self, id: TrackId) -> RfResult<AudioTrack> {
        let inner = self.inner.lock();
        let mut copy = TrackInner::new(id, inner.config.clone());
        copy.effects = inner.effects.duplicate();
        copy.direction = inner.direction;

        for clip in &inner.clips {
            copy.insert_clip_impl(clip.try_clone()?)?;
        }
        copy.seek_impl(inner.read_pos)?;
        log::debug!("AudioTrack {}: cloned into track {}", inner.id, id);
        Ok(AudioTrack {
            inner: Mutex::new(copy),
        })
    }

    /// Rebuild the overlaps touching `clip`; with `removing` its overlaps
    /// are dropped instead of created
    pub fn update_clip_overlap(&self, clip: ClipId, removing: bool) {
        self.inner.lock().update_clip_overlap_impl(clip, removing);
    }

    /// Drop queued audio and re-derive the cursor for the read position
    pub fn update_read_iterator(&self) {
        self.inner.lock().invalidate();
    }

    pub fn read_cursor(&self) -> ReadCursor {
        self.inner.lock().cursor
    }

    /// Read position (ms)
    pub fn read_pos(&self) -> i64 {
        let inner = self.inner.lock();
        samples_to_ms(inner.read_pos, inner.config.format.sample_rate)
    }

    pub fn read_pos_samples(&self) -> i64 {
        self.inner.lock().read_pos
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// INTERNALS (lock held)
// ═══════════════════════════════════════════════════════════════════════════════

fn find_clip(clips: &[AudioClip], id: ClipId) -> Option<&AudioClip> {
    clips.iter().find(|c| c.id() == id)
}

fn pair_mut(clips: &mut [AudioClip], a: usize, b: usize) -> (&mut AudioClip, &mut AudioClip) {
    if a < b {
        let (lo, hi) = clips.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = clips.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

impl TrackInner {
    fn new(id: TrackId, config: TrackConfig) -> Self {
        let channels = config.format.channels as usize;
        Self {
            id,
            config,
            clips: Vec::new(),
            overlaps: Vec::new(),
            next_overlap_id: 1,
            effects: EffectChain::new(channels),
            direction: Direction::Forward,
            read_pos: 0,
            render_pos: 0,
            cursor: ReadCursor::default(),
            fifo: VecDeque::new(),
            fifo_offset: 0,
            scratch: Vec::new(),
        }
    }

    fn rate(&self) -> u32 {
        self.config.format.sample_rate
    }

    fn channels(&self) -> usize {
        self.config.format.channels as usize
    }

    fn index_of(&self, id: ClipId) -> RfResult<usize> {
        self.clips
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| RfError::InvalidArgument(format!("clip {} not on track {}", id, self.id)))
    }

    fn duration_impl(&self) -> i64 {
        self.clips.last().map_or(0, AudioClip::end)
    }

    fn duration_frames(&self) -> i64 {
        ms_to_samples(self.duration_impl(), self.rate())
    }

    fn sort_clips(&mut self) {
        self.clips.sort_by_key(|c| (c.start(), c.id()));
    }

    // ============ Clip Maintenance ============

    fn insert_clip_impl(&mut self, mut clip: AudioClip) -> RfResult<ClipId> {
        if let Some(owner) = clip.track_id() {
            return Err(RfError::InvalidArgument(format!(
                "clip {} is owned by track {}",
                clip.id(),
                owner
            )));
        }
        let format = clip.format();
        if format.channels != self.config.format.channels
            || format.sample_rate != self.config.format.sample_rate
        {
            return Err(RfError::InvalidArgument(format!(
                "clip {} is {}ch/{}Hz, track {} mixes {}ch/{}Hz",
                clip.id(),
                format.channels,
                format.sample_rate,
                self.id,
                self.config.format.channels,
                self.config.format.sample_rate
            )));
        }

        let id = clip.id();
        clip.set_track(Some(self.id));
        clip.set_direction(self.direction.is_forward());
        self.clips.push(clip);
        self.sort_clips();
        self.update_clip_overlap_impl(id, false);
        self.invalidate();
        log::debug!(
            "AudioTrack {}: inserted clip {}, duration {} ms",
            self.id,
            id,
            self.duration_impl()
        );
        Ok(id)
    }

    fn move_clip_impl(&mut self, id: ClipId, start: i64) -> RfResult<()> {
        let index = self.index_of(id)?;
        self.clips[index].set_start(start);
        self.sort_clips();
        self.update_clip_overlap_impl(id, false);
        self.invalidate();
        Ok(())
    }

    fn change_clip_range_impl(&mut self, id: ClipId, start_offset: i64, end_offset: i64) -> RfResult<()> {
        let index = self.index_of(id)?;
        let clip = &mut self.clips[index];
        if start_offset < 0 || end_offset < 0 || start_offset + end_offset >= clip.source_duration() {
            return Err(RfError::InvalidArgument(format!(
                "range [{}, -{}] leaves no material in clip {}",
                start_offset, end_offset, id
            )));
        }
        // each step below is valid on its own once the pair is
        clip.change_end_offset(0)?;
        clip.change_start_offset(start_offset)?;
        clip.change_end_offset(end_offset)?;
        self.sort_clips();
        self.update_clip_overlap_impl(id, false);
        self.invalidate();
        Ok(())
    }

    fn remove_clip_impl(&mut self, index: usize) -> RfResult<AudioClip> {
        let mut clip = self.clips.remove(index);
        clip.set_track(None);
        self.update_clip_overlap_impl(clip.id(), true);
        self.invalidate();
        log::debug!(
            "AudioTrack {}: removed clip {}, duration {} ms",
            self.id,
            clip.id(),
            self.duration_impl()
        );
        Ok(clip)
    }

    fn update_clip_overlap_impl(&mut self, id: ClipId, removing: bool) {
        let clips = &self.clips;
        self.overlaps.retain_mut(|overlap| {
            if removing && overlap.involves(id) {
                return false;
            }
            match (find_clip(clips, overlap.front), find_clip(clips, overlap.rear)) {
                (Some(a), Some(b)) => overlap.update(a, b),
                _ => false,
            }
        });

        if !removing && let Some(clip) = find_clip(&self.clips, id) {
            let curve = self.config.crossfade_curve;
            for other in self.clips.iter().filter(|c| c.id() != id) {
                let pair = (id.min(other.id()), id.max(other.id()));
                if self.overlaps.iter().any(|o| o.pair() == pair) {
                    continue;
                }
                if let Some(overlap) =
                    AudioOverlap::between(self.next_overlap_id, clip, other, curve)
                {
                    log::trace!(
                        "AudioTrack {}: overlap {} [{}, {}) between {} and {}",
                        self.id,
                        overlap.id,
                        overlap.start,
                        overlap.end(),
                        overlap.front,
                        overlap.rear
                    );
                    self.next_overlap_id += 1;
                    self.overlaps.push(overlap);
                }
            }
        }

        self.overlaps.sort_by_key(|o| (o.start, o.id));
    }

    // ============ Cursor ============

    fn update_read_iterator_impl(&mut self) {
        let rate = self.rate();
        let pos = self.read_pos;
        self.cursor = ReadCursor {
            clip: self.clips.partition_point(|c| c.frame_range(rate).0 <= pos),
            overlap: self.overlaps.partition_point(|o| o.frame_range(rate).0 <= pos),
        };
    }

    /// Drop queued audio so the next read mixes from the read position
    fn invalidate(&mut self) {
        self.fifo.clear();
        self.fifo_offset = 0;
        self.render_pos = self.read_pos;
        self.effects.reset();
        self.update_read_iterator_impl();
    }

    fn seek_impl(&mut self, frame: i64) -> RfResult<()> {
        if frame < 0 {
            return Err(RfError::InvalidArgument(format!("negative seek position {}", frame)));
        }
        self.read_pos = frame;
        self.invalidate();
        Ok(())
    }

    fn set_direction_impl(&mut self, forward: bool) {
        let direction = Direction::from_forward(forward);
        if direction == self.direction {
            return;
        }
        self.direction = direction;
        for clip in &mut self.clips {
            clip.set_direction(forward);
        }
        self.invalidate();
    }

    // ============ Mixed Read ============

    fn read_audio_samples_impl(&mut self, buf: &mut [u8]) -> RfResult<TrackRead> {
        let format = self.config.format;
        let fs = format.frame_size();
        let bps = format.sample_format.bytes_per_sample();
        let ch = self.channels();
        let want = buf.len() / fs;
        let pos_ms = samples_to_ms(self.read_pos, self.rate());
        let forward = self.direction.is_forward();

        let mut done = 0;
        while done < want {
            if self.fifo.is_empty() && !self.refill()? {
                break;
            }
            let Some(block) = self.fifo.front() else {
                break;
            };
            let block_frames = block.len() / ch;
            let n = (block_frames - self.fifo_offset).min(want - done);
            let samples = &block[self.fifo_offset * ch..(self.fifo_offset + n) * ch];
            for (i, s) in samples.iter().enumerate() {
                let at = done * fs + i * bps;
                format.sample_format.write_f32(*s, &mut buf[at..at + bps]);
            }

            done += n;
            self.fifo_offset += n;
            if self.fifo_offset >= block_frames {
                self.fifo.pop_front();
                self.fifo_offset = 0;
            }
            self.read_pos += if forward { n as i64 } else { -(n as i64) };
        }

        self.update_read_iterator_impl();
        let eof = if forward {
            self.read_pos >= self.duration_frames()
        } else {
            self.read_pos <= 0
        };
        Ok(TrackRead {
            frames: done,
            bytes: done * fs,
            pos_ms,
            eof,
        })
    }

    /// Mix the next block past `render_pos` into the FIFO.
    /// Returns `false` at the track edge.
    fn refill(&mut self) -> RfResult<bool> {
        let chunk = self.config.mix_chunk_frames as i64;
        let (begin, end) = if self.direction.is_forward() {
            let total = self.duration_frames();
            if self.render_pos >= total {
                return Ok(false);
            }
            (self.render_pos, (self.render_pos + chunk).min(total))
        } else {
            if self.render_pos <= 0 {
                return Ok(false);
            }
            ((self.render_pos - chunk).max(0), self.render_pos)
        };

        let mut block = self.mix_range(begin, end)?;
        if self.direction.is_forward() {
            self.render_pos = end;
        } else {
            reverse_frames_in_place(&mut block, self.channels());
            self.render_pos = begin;
        }
        for out in self.effects.process_data(block) {
            self.fifo.push_back(out);
        }
        Ok(true)
    }

    /// Timeline frames `[begin, end)` in media order
    fn mix_range(&mut self, begin: i64, end: i64) -> RfResult<Vec<f32>> {
        let rate = self.rate();
        let ch = self.channels();
        let mut out = vec![0.0f32; (end - begin) as usize * ch];

        let mut pos = begin;
        while pos < end {
            // overlaps starting at or before pos; the latest one still
            // running at pos is mixed
            let started = self.overlaps.partition_point(|o| o.frame_range(rate).0 <= pos);
            let next_overlap = self
                .overlaps
                .get(started)
                .map_or(end, |o| o.frame_range(rate).0.min(end));
            let active = self.overlaps[..started]
                .iter()
                .rposition(|o| o.frame_range(rate).1 > pos);

            let stop = match active {
                Some(index) => {
                    let stop = self.overlaps[index].frame_range(rate).1.min(next_overlap);
                    let dst = &mut out[(pos - begin) as usize * ch..(stop - begin) as usize * ch];
                    self.mix_overlap(index, pos, stop, dst)?;
                    stop
                }
                None => self.read_plain(pos, next_overlap, begin, &mut out)?,
            };
            pos = stop;
        }
        Ok(out)
    }

    fn mix_overlap(&mut self, index: usize, pos: i64, stop: i64, dst: &mut [f32]) -> RfResult<()> {
        let rate = self.rate();
        let overlap = &self.overlaps[index];
        debug_assert_eq!(dst.len(), (stop - pos) as usize * self.channels());
        let front = self.index_of(overlap.front)?;
        let rear = self.index_of(overlap.rear)?;
        let (front, rear) = pair_mut(&mut self.clips, front, rear);
        overlap.mix(front, rear, dst, &mut self.scratch, pos, rate)
    }

    /// Plain clip audio from `pos` up to `limit` or the next clip boundary.
    /// Returns where the span stopped.
    fn read_plain(&mut self, pos: i64, limit: i64, begin: i64, out: &mut [f32]) -> RfResult<i64> {
        let rate = self.rate();
        let ch = self.channels();
        let started = self.clips.partition_point(|c| c.frame_range(rate).0 <= pos);
        let next_clip = self
            .clips
            .get(started)
            .map_or(limit, |c| c.frame_range(rate).0.min(limit));
        let under = self.clips[..started]
            .iter()
            .rposition(|c| c.frame_range(rate).1 > pos);

        let Some(index) = under else {
            // gap between clips stays silent
            return Ok(next_clip);
        };
        let stop = self.clips[index].frame_range(rate).1.min(next_clip);
        let dst = &mut out[(pos - begin) as usize * ch..(stop - begin) as usize * ch];
        self.clips[index].read_at(dst, pos, rate)?;
        Ok(stop)
    }
}
