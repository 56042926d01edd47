use super::{clamp_or, mismatch, ModularNode, ModuleKind, ModuleState, StateError};
use crate::context::{param, AudioContext, NativeId, NativeInput, NativeKind, Waveform};
use crate::port::AudioEndpoint;
use crate::smooth::{SmoothCv, FAST_SLEW_HZ};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LfoState {
    pub waveform: Waveform,
    pub rate: f64,
    pub depth: f64,
}

impl Default for LfoState {
    fn default() -> Self {
        Self {
            waveform: Waveform::Sine,
            rate: 2.0,
            depth: 0.5,
        }
    }
}

/// Low-Frequency Oscillator
///
/// Rate and depth glide at [`FAST_SLEW_HZ`] so modulation edits feel
/// immediate.
#[derive(Debug)]
pub struct Lfo {
    osc: NativeId,
    depth_gain: NativeId,
    rate: SmoothCv,
    depth: SmoothCv,
    state: LfoState,
}

impl Lfo {
    pub fn new(ctx: &mut AudioContext) -> Self {
        let state = LfoState::default();

        let osc = ctx.create_oscillator(state.waveform);
        ctx.set_intrinsic(osc, param::FREQUENCY, 0.0);
        let depth_gain = ctx.create_gain(0.0);
        ctx.connect(osc, NativeInput::Node(depth_gain));

        let rate = SmoothCv::new(ctx, state.rate, FAST_SLEW_HZ);
        rate.connect(ctx, NativeInput::Param(osc, param::FREQUENCY));
        let depth = SmoothCv::new(ctx, state.depth, FAST_SLEW_HZ);
        depth.connect(ctx, NativeInput::Param(depth_gain, param::GAIN));

        let now = ctx.now();
        ctx.start(osc, now);

        Self {
            osc,
            depth_gain,
            rate,
            depth,
            state,
        }
    }

    pub fn set_waveform(&mut self, ctx: &mut AudioContext, waveform: Waveform) {
        self.state.waveform = waveform;
        if let Some(node) = ctx.node_mut(self.osc) {
            node.kind = NativeKind::Oscillator { waveform };
        }
    }

    pub fn set_rate(&mut self, ctx: &mut AudioContext, hz: f64) {
        self.state.rate = clamp_or(hz, 0.01, 50.0, self.state.rate);
        self.rate.set_value(ctx, self.state.rate);
    }

    pub fn set_depth(&mut self, ctx: &mut AudioContext, depth: f64) {
        self.state.depth = clamp_or(depth, 0.0, 1.0, self.state.depth);
        self.depth.set_value(ctx, self.state.depth);
    }
}

impl ModularNode for Lfo {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Lfo
    }

    fn input_port(&self, _ctx: &AudioContext) -> Option<AudioEndpoint> {
        None
    }

    fn output_port(&self) -> Option<AudioEndpoint> {
        Some(AudioEndpoint(self.depth_gain))
    }

    fn cv_input(&self, port: &str) -> Option<NativeInput> {
        (port == "freq").then_some(NativeInput::Param(self.osc, param::FREQUENCY))
    }

    fn state(&self) -> ModuleState {
        ModuleState::Lfo(self.state.clone())
    }

    fn set_state(&mut self, ctx: &mut AudioContext, state: ModuleState) -> Result<(), StateError> {
        let ModuleState::Lfo(state) = state else {
            return Err(mismatch(ModuleKind::Lfo, &state));
        };
        self.set_waveform(ctx, state.waveform);
        self.set_rate(ctx, state.rate);
        self.set_depth(ctx, state.depth);
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut AudioContext) {
        let now = ctx.now();
        ctx.stop(self.osc, now);
        self.rate.destroy(ctx);
        self.depth.destroy(ctx);
        ctx.release(self.osc);
        ctx.release(self.depth_gain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ManualClock, NativeFeatures, SourceState};

    #[test]
    fn test_uses_fast_slew() {
        let mut ctx = AudioContext::new(ManualClock::new(0.0), NativeFeatures::default());
        let lfo = Lfo::new(&mut ctx);
        assert_eq!(lfo.rate.slew_hz(), FAST_SLEW_HZ);
        assert_eq!(lfo.depth.slew_hz(), FAST_SLEW_HZ);
        assert_eq!(
            ctx.node(lfo.osc).map(|n| n.source),
            Some(SourceState::Started(0.0))
        );
    }

    #[test]
    fn test_rate_clamped() {
        let mut ctx = AudioContext::new(ManualClock::new(0.0), NativeFeatures::default());
        let mut lfo = Lfo::new(&mut ctx);
        lfo.set_rate(&mut ctx, 0.0);
        assert_eq!(lfo.rate.value(), 0.01);
        lfo.set_rate(&mut ctx, 500.0);
        assert_eq!(lfo.rate.value(), 50.0);
    }

    #[test]
    fn test_output_is_depth_scaled() {
        let mut ctx = AudioContext::new(ManualClock::new(0.0), NativeFeatures::default());
        let lfo = Lfo::new(&mut ctx);
        assert_eq!(lfo.output_port(), Some(AudioEndpoint(lfo.depth_gain)));
        assert!(ctx.is_connected(lfo.osc, NativeInput::Node(lfo.depth_gain)));
    }
}
