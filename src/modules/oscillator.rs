use super::{clamp_or, mismatch, ModularNode, ModuleKind, ModuleState, StateError};
use crate::context::{param, AudioContext, NativeId, NativeInput, NativeKind, Waveform};
use crate::port::AudioEndpoint;
use crate::smooth::{SmoothCv, DEFAULT_SLEW_HZ};
use libm::Libm;
use serde::{Deserialize, Serialize};

/// C4, the pitch-mode reference at octave 0, semitone 0
pub const PITCH_BASE_HZ: f64 = 261.6256;

/// Detune cents per unit of pitch CV (1 V/oct)
pub const PITCH_CV_CENTS_PER_VOLT: f64 = 1200.0;

/// How the oscillator's frequency is addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OscillatorMode {
    /// Octave, semitone and cents relative to C4
    #[default]
    Pitch,
    /// Frequency in Hz
    Freq,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OscillatorState {
    pub waveform: Waveform,
    pub mode: OscillatorMode,
    pub octave: i32,
    pub semitone: i32,
    pub cents: f64,
    pub frequency: f64,
}

impl Default for OscillatorState {
    fn default() -> Self {
        Self {
            waveform: Waveform::Sine,
            mode: OscillatorMode::Pitch,
            octave: 0,
            semitone: 0,
            cents: 0.0,
            frequency: PITCH_BASE_HZ,
        }
    }
}

impl OscillatorState {
    fn clamped(mut self) -> Self {
        self.octave = self.octave.clamp(-4, 4);
        self.semitone = self.semitone.clamp(-12, 12);
        self.cents = clamp_or(self.cents, -100.0, 100.0, 0.0);
        self.frequency = clamp_or(self.frequency, 0.1, 20_000.0, PITCH_BASE_HZ);
        if self.mode == OscillatorMode::Pitch {
            self.frequency = pitch_frequency(self.octave, self.semitone);
        }
        self
    }

    fn detune(&self) -> f64 {
        match self.mode {
            OscillatorMode::Pitch => self.cents,
            OscillatorMode::Freq => 0.0,
        }
    }
}

/// `base * 2^octave * 2^(semitone / 12)`
pub(crate) fn pitch_frequency(octave: i32, semitone: i32) -> f64 {
    PITCH_BASE_HZ
        * Libm::<f64>::pow(2.0, f64::from(octave))
        * Libm::<f64>::pow(2.0, f64::from(semitone) / 12.0)
}

/// Voltage-Controlled Oscillator
///
/// A native periodic generator whose frequency is driven by a [`SmoothCv`].
/// The `pitch` CV input is scaled to detune cents so 1.0 of CV moves the
/// pitch one octave.
#[derive(Debug)]
pub struct Oscillator {
    osc: NativeId,
    pitch_cv: NativeId,
    frequency: SmoothCv,
    state: OscillatorState,
}

impl Oscillator {
    pub fn new(ctx: &mut AudioContext) -> Self {
        let state = OscillatorState::default().clamped();

        let osc = ctx.create_oscillator(state.waveform);
        ctx.set_intrinsic(osc, param::FREQUENCY, 0.0);
        let frequency = SmoothCv::new(ctx, state.frequency, DEFAULT_SLEW_HZ);
        frequency.connect(ctx, NativeInput::Param(osc, param::FREQUENCY));

        let pitch_cv = ctx.create_gain(PITCH_CV_CENTS_PER_VOLT);
        ctx.connect(pitch_cv, NativeInput::Param(osc, param::DETUNE));

        let now = ctx.now();
        ctx.start(osc, now);

        Self {
            osc,
            pitch_cv,
            frequency,
            state,
        }
    }

    pub fn set_waveform(&mut self, ctx: &mut AudioContext, waveform: Waveform) {
        self.state.waveform = waveform;
        if let Some(node) = ctx.node_mut(self.osc) {
            node.kind = NativeKind::Oscillator { waveform };
        }
    }

    /// Switching modes recomputes the frequency immediately
    pub fn set_mode(&mut self, ctx: &mut AudioContext, mode: OscillatorMode) {
        self.state.mode = mode;
        self.apply_pitch(ctx);
    }

    pub fn set_octave(&mut self, ctx: &mut AudioContext, octave: i32) {
        self.state.octave = octave;
        self.apply_pitch(ctx);
    }

    pub fn set_semitone(&mut self, ctx: &mut AudioContext, semitone: i32) {
        self.state.semitone = semitone;
        self.apply_pitch(ctx);
    }

    pub fn set_cents(&mut self, ctx: &mut AudioContext, cents: f64) {
        self.state.cents = cents;
        self.apply_pitch(ctx);
    }

    /// Direct frequency; only audible in `freq` mode
    pub fn set_frequency(&mut self, ctx: &mut AudioContext, hz: f64) {
        self.state.frequency = hz;
        self.apply_pitch(ctx);
    }

    pub fn frequency(&self) -> f64 {
        self.state.frequency
    }

    fn apply_pitch(&mut self, ctx: &mut AudioContext) {
        self.state = self.state.clone().clamped();
        self.frequency.set_value(ctx, self.state.frequency);
        ctx.set_param_now(self.osc, param::DETUNE, self.state.detune());
    }
}

impl ModularNode for Oscillator {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Oscillator
    }

    fn input_port(&self, _ctx: &AudioContext) -> Option<AudioEndpoint> {
        None
    }

    fn output_port(&self) -> Option<AudioEndpoint> {
        Some(AudioEndpoint(self.osc))
    }

    fn cv_input(&self, port: &str) -> Option<NativeInput> {
        match port {
            "freq" => Some(NativeInput::Param(self.osc, param::FREQUENCY)),
            "pitch" => Some(NativeInput::Node(self.pitch_cv)),
            _ => None,
        }
    }

    fn state(&self) -> ModuleState {
        ModuleState::Oscillator(self.state.clone())
    }

    fn set_state(&mut self, ctx: &mut AudioContext, state: ModuleState) -> Result<(), StateError> {
        let ModuleState::Oscillator(state) = state else {
            return Err(mismatch(ModuleKind::Oscillator, &state));
        };
        self.set_waveform(ctx, state.waveform);
        self.state = state;
        self.apply_pitch(ctx);
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut AudioContext) {
        let now = ctx.now();
        ctx.stop(self.osc, now);
        self.frequency.destroy(ctx);
        ctx.release(self.pitch_cv);
        ctx.release(self.osc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ManualClock, NativeFeatures};
    use approx::assert_abs_diff_eq;

    fn context() -> AudioContext {
        AudioContext::new(ManualClock::new(0.0), NativeFeatures::default())
    }

    #[test]
    fn test_pitch_mode_frequency() {
        assert_abs_diff_eq!(pitch_frequency(0, 0), PITCH_BASE_HZ);
        assert_abs_diff_eq!(pitch_frequency(1, 0), PITCH_BASE_HZ * 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pitch_frequency(0, 9), 440.0, epsilon = 1e-3);
    }

    #[test]
    fn test_octave_and_semitone_are_clamped() {
        let mut ctx = context();
        let mut osc = Oscillator::new(&mut ctx);
        osc.set_octave(&mut ctx, 9);
        osc.set_semitone(&mut ctx, -20);
        let ModuleState::Oscillator(state) = osc.state() else {
            panic!("wrong state kind");
        };
        assert_eq!(state.octave, 4);
        assert_eq!(state.semitone, -12);
        assert_abs_diff_eq!(state.frequency, pitch_frequency(4, -12), epsilon = 1e-9);
    }

    #[test]
    fn test_mode_switch_recomputes_frequency() {
        let mut ctx = context();
        let mut osc = Oscillator::new(&mut ctx);
        osc.set_mode(&mut ctx, OscillatorMode::Freq);
        osc.set_frequency(&mut ctx, 100.0);
        assert_abs_diff_eq!(osc.frequency(), 100.0);

        osc.set_mode(&mut ctx, OscillatorMode::Pitch);
        assert_abs_diff_eq!(osc.frequency(), PITCH_BASE_HZ, epsilon = 1e-9);
    }

    #[test]
    fn test_cents_drive_detune_in_pitch_mode_only() {
        let mut ctx = context();
        let mut osc = Oscillator::new(&mut ctx);
        osc.set_cents(&mut ctx, 25.0);
        let detune = |ctx: &AudioContext, osc: &Oscillator| {
            ctx.param(osc.osc, param::DETUNE).map(|p| p.value_at(0.0))
        };
        assert_eq!(detune(&ctx, &osc), Some(25.0));

        osc.set_mode(&mut ctx, OscillatorMode::Freq);
        assert_eq!(detune(&ctx, &osc), Some(0.0));
    }

    #[test]
    fn test_pitch_cv_scales_to_detune() {
        let mut ctx = context();
        let osc = Oscillator::new(&mut ctx);
        let gain = ctx.param(osc.pitch_cv, param::GAIN).map(|p| p.value_at(0.0));
        assert_eq!(gain, Some(PITCH_CV_CENTS_PER_VOLT));
        assert!(ctx.is_connected(osc.pitch_cv, NativeInput::Param(osc.osc, param::DETUNE)));
    }

    #[test]
    fn test_waveform_reaches_native_node() {
        let mut ctx = context();
        let mut osc = Oscillator::new(&mut ctx);
        osc.set_waveform(&mut ctx, Waveform::Sawtooth);
        assert_eq!(
            ctx.node(osc.osc).map(|n| n.kind.clone()),
            Some(NativeKind::Oscillator {
                waveform: Waveform::Sawtooth
            })
        );
    }
}
