//! Tempo control: rate validation, pitch compensation policies and the packed
//! rate/pitch pair shared with the render thread.

use std::sync::atomic::{AtomicU64, Ordering};

use tempo_types::TempoStatus;

use crate::error::{EngineError, Result};

/// Cents per octave.
pub const CENTS_PER_OCTAVE: f32 = 1200.0;

/// Maps a playback rate to the pitch shift (in cents) applied by the time-pitch stage.
pub trait PitchCompensation: Send + Sync {
    fn cents_for_rate(&self, rate: f32) -> f32;
}

/// Keep perceived pitch constant: `-1200 * log2(rate)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PreservePitch;

impl PitchCompensation for PreservePitch {
    fn cents_for_rate(&self, rate: f32) -> f32 {
        -CENTS_PER_OCTAVE * rate.log2()
    }
}

/// No compensation: pitch follows speed like a tape machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct FreePitch;

impl PitchCompensation for FreePitch {
    fn cents_for_rate(&self, _rate: f32) -> f32 {
        0.0
    }
}

/// Rate/pitch pair currently requested by the caller.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TempoState {
    pub rate: f32,
    pub pitch_cents: f32,
}

impl Default for TempoState {
    fn default() -> Self {
        Self {
            rate: 1.0,
            pitch_cents: 0.0,
        }
    }
}

impl From<TempoState> for TempoStatus {
    fn from(t: TempoState) -> Self {
        TempoStatus {
            rate: t.rate,
            pitch_cents: t.pitch_cents,
        }
    }
}

impl TempoState {
    /// Build the state for `rate` under `policy`, rejecting non-finite or non-positive rates.
    pub fn for_rate(rate: f32, policy: &dyn PitchCompensation) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(EngineError::InvalidTempo { rate });
        }
        Ok(Self {
            rate,
            pitch_cents: policy.cents_for_rate(rate),
        })
    }
}

/// Rate and pitch packed into one atomic word so readers never see a torn pair.
#[derive(Debug)]
pub struct StageParams {
    bits: AtomicU64,
}

impl Default for StageParams {
    fn default() -> Self {
        Self::new(TempoState::default())
    }
}

impl StageParams {
    pub fn new(state: TempoState) -> Self {
        Self {
            bits: AtomicU64::new(pack(state)),
        }
    }

    pub fn store(&self, state: TempoState) {
        self.bits.store(pack(state), Ordering::Release);
    }

    pub fn load(&self) -> TempoState {
        unpack(self.bits.load(Ordering::Acquire))
    }
}

fn pack(state: TempoState) -> u64 {
    ((state.rate.to_bits() as u64) << 32) | state.pitch_cents.to_bits() as u64
}

fn unpack(bits: u64) -> TempoState {
    TempoState {
        rate: f32::from_bits((bits >> 32) as u32),
        pitch_cents: f32::from_bits(bits as u32),
    }
}

/// Convert a cents offset to a frequency ratio.
pub fn cents_to_ratio(cents: f32) -> f32 {
    (cents / CENTS_PER_OCTAVE).exp2()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserve_pitch_reference_points() {
        let p = PreservePitch;
        assert_eq!(p.cents_for_rate(1.0), 0.0);
        assert_eq!(p.cents_for_rate(2.0), -1200.0);
        assert_eq!(p.cents_for_rate(0.5), 1200.0);
        assert_eq!(p.cents_for_rate(4.0), -2400.0);
    }

    #[test]
    fn preserve_pitch_matches_formula_for_arbitrary_rates() {
        for rate in [0.3_f32, 0.75, 1.1, 1.5, 3.7] {
            let state = TempoState::for_rate(rate, &PreservePitch).unwrap();
            assert_eq!(state.rate, rate);
            assert_eq!(state.pitch_cents, -1200.0 * rate.log2());
        }
    }

    #[test]
    fn free_pitch_never_compensates() {
        let state = TempoState::for_rate(2.0, &FreePitch).unwrap();
        assert_eq!(state.rate, 2.0);
        assert_eq!(state.pitch_cents, 0.0);
    }

    #[test]
    fn rejects_non_positive_and_non_finite_rates() {
        for rate in [0.0_f32, -0.0, -1.0, f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let err = TempoState::for_rate(rate, &PreservePitch).unwrap_err();
            assert!(matches!(err, EngineError::InvalidTempo { .. }));
        }
    }

    #[test]
    fn stage_params_pack_roundtrip_keeps_exact_bits() {
        let params = StageParams::default();
        assert_eq!(params.load(), TempoState::default());
        let state = TempoState {
            rate: 1.37,
            pitch_cents: -545.25,
        };
        params.store(state);
        assert_eq!(params.load(), state);
    }

    #[test]
    fn cents_to_ratio_octaves() {
        assert_eq!(cents_to_ratio(0.0), 1.0);
        assert_eq!(cents_to_ratio(1200.0), 2.0);
        assert_eq!(cents_to_ratio(-1200.0), 0.5);
    }
}
