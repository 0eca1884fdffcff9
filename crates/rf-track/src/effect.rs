//! Track effect chain
//!
//! Every mixed block of a track passes through its chain before it is
//! queued for output. A muted chain replaces the block with silence of
//! the same length.

// ============ Effect ============

/// Effect applied to interleaved f32 blocks
pub trait AudioEffect: Send {
    /// Effect name
    fn name(&self) -> &str;

    /// Process an interleaved block in place
    fn process(&mut self, block: &mut [f32], channels: usize);

    /// Clear any internal state (called on seeks and direction changes)
    fn reset(&mut self) {}

    fn num_params(&self) -> usize {
        0
    }

    fn get_param(&self, _index: usize) -> f64 {
        0.0
    }

    fn set_param(&mut self, _index: usize, _value: f64) {}

    fn param_name(&self, _index: usize) -> &str {
        ""
    }

    /// Fresh instance of the same effect with the same parameters
    fn box_clone(&self) -> Box<dyn AudioEffect>;
}

/// Fixed gain in dB
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainEffect {
    gain_db: f64,
}

impl GainEffect {
    pub const MIN_DB: f64 = -96.0;
    pub const MAX_DB: f64 = 24.0;

    pub fn new(gain_db: f64) -> Self {
        Self {
            gain_db: gain_db.clamp(Self::MIN_DB, Self::MAX_DB),
        }
    }

    pub fn gain_db(&self) -> f64 {
        self.gain_db
    }

    /// Linear factor; the floor maps to silence
    pub fn linear(&self) -> f64 {
        if self.gain_db <= Self::MIN_DB {
            0.0
        } else {
            10f64.powf(self.gain_db / 20.0)
        }
    }
}

impl AudioEffect for GainEffect {
    fn name(&self) -> &str {
        "Gain"
    }

    fn process(&mut self, block: &mut [f32], _channels: usize) {
        let gain = self.linear() as f32;
        if gain == 1.0 {
            return;
        }
        for s in block.iter_mut() {
            *s *= gain;
        }
    }

    fn num_params(&self) -> usize {
        1
    }

    fn get_param(&self, index: usize) -> f64 {
        match index {
            0 => self.gain_db,
            _ => 0.0,
        }
    }

    fn set_param(&mut self, index: usize, value: f64) {
        if index == 0 {
            self.gain_db = value.clamp(Self::MIN_DB, Self::MAX_DB);
        }
    }

    fn param_name(&self, index: usize) -> &str {
        match index {
            0 => "Gain (dB)",
            _ => "",
        }
    }

    fn box_clone(&self) -> Box<dyn AudioEffect> {
        Box::new(*self)
    }
}

// ============ Effect Chain ============

/// Ordered effects plus the track mute switch
pub struct EffectChain {
    effects: Vec<Box<dyn AudioEffect>>,
    muted: bool,
    channels: usize,
}

impl EffectChain {
    pub fn new(channels: usize) -> Self {
        Self {
            effects: Vec::new(),
            muted: false,
            channels: channels.max(1),
        }
    }

    pub fn add(&mut self, effect: Box<dyn AudioEffect>) {
        log::debug!("EffectChain: added {}", effect.name());
        self.effects.push(effect);
    }

    pub fn remove(&mut self, index: usize) -> Option<Box<dyn AudioEffect>> {
        (index < self.effects.len()).then(|| self.effects.remove(index))
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn effect(&self, index: usize) -> Option<&dyn AudioEffect> {
        self.effects.get(index).map(|e| e.as_ref())
    }

    pub fn effect_mut(&mut self, index: usize) -> Option<&mut Box<dyn AudioEffect>> {
        self.effects.get_mut(index)
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Run one block through the chain. The returned blocks are queued in
    /// order; the current effects always yield exactly one.
    pub fn process_data(&mut self, mut block: Vec<f32>) -> Vec<Vec<f32>> {
        if self.muted {
            block.fill(0.0);
            return vec![block];
        }
        for effect in &mut self.effects {
            effect.process(&mut block, self.channels);
        }
        vec![block]
    }

    pub fn reset(&mut self) {
        for effect in &mut self.effects {
            effect.reset();
        }
    }

    /// Same effects with the same parameters, unmuted state included
    pub fn duplicate(&self) -> Self {
        let mut chain = Self::new(self.channels);
        chain.effects = self.effects.iter().map(|e| e.box_clone()).collect();
        chain.copy_params_from(self);
        chain
    }

    /// Copy mute state and the parameters of effects that line up by
    /// position and name
    pub fn copy_params_from(&mut self, other: &EffectChain) {
        self.muted = other.muted;
        for (dst, src) in self.effects.iter_mut().zip(&other.effects) {
            if dst.name() != src.name() {
                continue;
            }
            for i in 0..src.num_params().min(dst.num_params()) {
                dst.set_param(i, src.get_param(i));
            }
        }
    }
}

impl std::fmt::Debug for EffectChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectChain")
            .field("effects", &self.effects.iter().map(|e| e.name()).collect::<Vec<_>>())
            .field("muted", &self.muted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_gain_effect() {
        let mut gain = GainEffect::new(-6.0);
        let mut block = vec![1.0f32; 4];
        gain.process(&mut block, 2);
        assert_relative_eq!(block[0], 0.501_187, epsilon = 1e-5);

        let mut floor = GainEffect::new(-200.0);
        assert_eq!(floor.gain_db(), GainEffect::MIN_DB);
        floor.process(&mut block, 2);
        assert!(block.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_muted_chain_outputs_silence() {
        let mut chain = EffectChain::new(2);
        chain.set_muted(true);
        let out = chain.process_data(vec![0.5; 8]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], vec![0.0; 8]);
    }

    #[test]
    fn test_chain_applies_effects_in_order() {
        let mut chain = EffectChain::new(1);
        chain.add(Box::new(GainEffect::new(6.0)));
        chain.add(Box::new(GainEffect::new(-6.0)));
        let out = chain.process_data(vec![0.25; 4]);
        assert_relative_eq!(out[0][0], 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_copy_params_matches_by_position_and_name() {
        let mut source = EffectChain::new(2);
        source.add(Box::new(GainEffect::new(-12.0)));
        source.set_muted(true);

        let mut target = EffectChain::new(2);
        target.add(Box::new(GainEffect::new(0.0)));
        target.copy_params_from(&source);

        assert!(target.is_muted());
        assert_eq!(target.effect(0).unwrap().get_param(0), -12.0);
    }

    #[test]
    fn test_duplicate() {
        let mut chain = EffectChain::new(2);
        chain.add(Box::new(GainEffect::new(3.0)));
        let copy = chain.duplicate();
        assert_eq!(copy.len(), 1);
        assert_eq!(copy.effect(0).unwrap().name(), "Gain");
        assert_eq!(copy.effect(0).unwrap().get_param(0), 3.0);
    }
}
