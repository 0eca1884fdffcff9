//! Overlapping clip pairs and their crossfades

use serde::{Deserialize, Serialize};

use rf_core::{RfResult, ms_to_samples};

use crate::clip::{AudioClip, ClipId};

pub type OverlapId = u64;

/// Crossfade curve types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CrossfadeCurve {
    Linear,
    #[default]
    EqualPower,
    SCurve,
}

impl CrossfadeCurve {
    /// Gains for the outgoing and incoming clip at `t` in `[0, 1]`
    pub fn gains_at(self, t: f64) -> (f64, f64) {
        let t = t.clamp(0.0, 1.0);
        match self {
            CrossfadeCurve::Linear => (1.0 - t, t),
            CrossfadeCurve::EqualPower => {
                let angle = t * std::f64::consts::FRAC_PI_2;
                (angle.cos(), angle.sin())
            }
            CrossfadeCurve::SCurve => {
                let s = (1.0 - (t * std::f64::consts::PI).cos()) * 0.5;
                (1.0 - s, s)
            }
        }
    }
}

/// Region where two clips of a track intersect
///
/// `front` is the clip that starts first; it fades out across the region
/// while `rear` fades in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioOverlap {
    pub id: OverlapId,
    pub front: ClipId,
    pub rear: ClipId,
    /// Timeline start (ms)
    pub start: i64,
    pub duration: i64,
    pub curve: CrossfadeCurve,
}

impl AudioOverlap {
    /// Build the overlap of two clips, `None` if they do not intersect
    pub fn between(
        id: OverlapId,
        a: &AudioClip,
        b: &AudioClip,
        curve: CrossfadeCurve,
    ) -> Option<Self> {
        let mut overlap = Self {
            id,
            front: a.id(),
            rear: b.id(),
            start: 0,
            duration: 0,
            curve,
        };
        overlap.update(a, b).then_some(overlap)
    }

    pub fn end(&self) -> i64 {
        self.start + self.duration
    }

    pub fn involves(&self, clip: ClipId) -> bool {
        self.front == clip || self.rear == clip
    }

    pub fn pair(&self) -> (ClipId, ClipId) {
        (self.front.min(self.rear), self.front.max(self.rear))
    }

    /// Recompute geometry and front/rear roles from the current clips.
    /// Returns `false` once the clips no longer intersect.
    pub fn update(&mut self, a: &AudioClip, b: &AudioClip) -> bool {
        let Some((start, end)) = a.intersection(b) else {
            self.duration = 0;
            return false;
        };
        let (front, rear) = if (a.start(), a.id()) <= (b.start(), b.id()) {
            (a, b)
        } else {
            (b, a)
        };
        self.front = front.id();
        self.rear = rear.id();
        self.start = start;
        self.duration = end - start;
        true
    }

    /// Timeline frame range `[begin, end)` at `rate`
    pub fn frame_range(&self, rate: u32) -> (i64, i64) {
        (ms_to_samples(self.start, rate), ms_to_samples(self.end(), rate))
    }

    /// Crossfade both clips into `dst`, which covers timeline frames
    /// starting at `frame`. `scratch` is reused for the rear clip.
    pub(crate) fn mix(
        &self,
        front: &mut AudioClip,
        rear: &mut AudioClip,
        dst: &mut [f32],
        scratch: &mut Vec<f32>,
        frame: i64,
        rate: u32,
    ) -> RfResult<()> {
        let ch = front.format().channels as usize;
        scratch.resize(dst.len(), 0.0);
        front.read_at(dst, frame, rate)?;
        rear.read_at(scratch, frame, rate)?;

        let (begin, end) = self.frame_range(rate);
        let len = (end - begin).max(1) as f64;
        for (i, (out, incoming)) in dst
            .chunks_exact_mut(ch)
            .zip(scratch.chunks_exact(ch))
            .enumerate()
        {
            let t = (frame + i as i64 - begin) as f64 / len;
            let (gain_out, gain_in) = self.curve.gains_at(t);
            for (o, s) in out.iter_mut().zip(incoming) {
                *o = (*o as f64 * gain_out + *s as f64 * gain_in) as f32;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::MemoryClipSource;
    use approx::assert_relative_eq;

    fn constant_clip(start: i64, ms: usize, value: f32) -> AudioClip {
        let source = MemoryClipSource::from_fn(1, 1000, ms, |_, _| value).unwrap();
        AudioClip::new(start, Box::new(source))
    }

    #[test]
    fn test_curve_endpoints() {
        for curve in [CrossfadeCurve::Linear, CrossfadeCurve::EqualPower, CrossfadeCurve::SCurve] {
            let (a, b) = curve.gains_at(0.0);
            assert_relative_eq!(a, 1.0, epsilon = 1e-9);
            assert_relative_eq!(b, 0.0, epsilon = 1e-9);
            let (a, b) = curve.gains_at(1.0);
            assert_relative_eq!(a, 0.0, epsilon = 1e-9);
            assert_relative_eq!(b, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_equal_power_keeps_power() {
        for i in 0..=10 {
            let (a, b) = CrossfadeCurve::EqualPower.gains_at(i as f64 / 10.0);
            assert_relative_eq!(a * a + b * b, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_between_orders_by_start() {
        let late = constant_clip(4000, 5000, 1.0);
        let early = constant_clip(0, 5000, 1.0);
        let overlap = AudioOverlap::between(1, &late, &early, CrossfadeCurve::Linear).unwrap();
        assert_eq!(overlap.front, early.id());
        assert_eq!(overlap.rear, late.id());
        assert_eq!((overlap.start, overlap.duration), (4000, 1000));
    }

    #[test]
    fn test_update_reports_separation() {
        let a = constant_clip(0, 100, 1.0);
        let mut b = constant_clip(50, 100, 1.0);
        let mut overlap = AudioOverlap::between(1, &a, &b, CrossfadeCurve::Linear).unwrap();
        b.set_start(100);
        assert!(!overlap.update(&a, &b));
    }

    #[test]
    fn test_linear_mix_ramps() {
        let mut a = constant_clip(0, 20, 1.0);
        let mut b = constant_clip(10, 20, -1.0);
        let overlap = AudioOverlap::between(1, &a, &b, CrossfadeCurve::Linear).unwrap();

        let mut dst = vec![0.0f32; 10];
        let mut scratch = Vec::new();
        overlap.mix(&mut a, &mut b, &mut dst, &mut scratch, 10, 1000).unwrap();
        assert_relative_eq!(dst[0], 1.0);
        assert_relative_eq!(dst[5], 0.0);
        assert_relative_eq!(dst[9], -0.8, epsilon = 1e-6);
    }
}
