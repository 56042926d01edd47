use super::{clamp_or, mismatch, ModularNode, ModuleKind, ModuleState, StateError};
use crate::context::{param, AudioContext, NativeId, NativeInput};
use crate::port::AudioEndpoint;
use crate::smooth::{SmoothCv, DEFAULT_SLEW_HZ};
use serde::{Deserialize, Serialize};

/// Longest delay line the node allocates
pub const MAX_DELAY_SECONDS: f64 = 2.0;

const DRY_RAMP_SECONDS: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DelayState {
    pub time: f64,
    pub feedback: f64,
    pub mix: f64,
}

impl Default for DelayState {
    fn default() -> Self {
        Self {
            time: 0.3,
            feedback: 0.4,
            mix: 0.3,
        }
    }
}

/// Feedback Delay
///
/// ```text
/// input ─┬─> delay ─┬─> wet ──┬─> output
///        │    ^     │         │
///        │    └─ fb ┘         │
///        └─> dry ─────────────┘
/// ```
#[derive(Debug)]
pub struct Delay {
    input: NativeId,
    delay: NativeId,
    feedback_gain: NativeId,
    wet_gain: NativeId,
    dry_gain: NativeId,
    output: NativeId,
    time: SmoothCv,
    feedback: SmoothCv,
    wet: SmoothCv,
    state: DelayState,
}

impl Delay {
    pub fn new(ctx: &mut AudioContext) -> Self {
        let state = DelayState::default();

        let input = ctx.create_gain(1.0);
        let delay = ctx.create_delay(MAX_DELAY_SECONDS);
        let feedback_gain = ctx.create_gain(0.0);
        let wet_gain = ctx.create_gain(0.0);
        let dry_gain = ctx.create_gain(1.0 - state.mix);
        let output = ctx.create_gain(1.0);

        ctx.connect(input, NativeInput::Node(delay));
        ctx.connect(delay, NativeInput::Node(feedback_gain));
        ctx.connect(feedback_gain, NativeInput::Node(delay));
        ctx.connect(delay, NativeInput::Node(wet_gain));
        ctx.connect(wet_gain, NativeInput::Node(output));
        ctx.connect(input, NativeInput::Node(dry_gain));
        ctx.connect(dry_gain, NativeInput::Node(output));

        let time = SmoothCv::new(ctx, state.time, DEFAULT_SLEW_HZ);
        time.connect(ctx, NativeInput::Param(delay, param::DELAY_TIME));
        let feedback = SmoothCv::new(ctx, state.feedback, DEFAULT_SLEW_HZ);
        feedback.connect(ctx, NativeInput::Param(feedback_gain, param::GAIN));
        let wet = SmoothCv::new(ctx, state.mix, DEFAULT_SLEW_HZ);
        wet.connect(ctx, NativeInput::Param(wet_gain, param::GAIN));

        Self {
            input,
            delay,
            feedback_gain,
            wet_gain,
            dry_gain,
            output,
            time,
            feedback,
            wet,
            state,
        }
    }

    pub fn set_time(&mut self, ctx: &mut AudioContext, seconds: f64) {
        self.state.time = clamp_or(seconds, 0.0, MAX_DELAY_SECONDS, self.state.time);
        self.time.set_value(ctx, self.state.time);
    }

    pub fn set_feedback(&mut self, ctx: &mut AudioContext, amount: f64) {
        self.state.feedback = clamp_or(amount, 0.0, 0.95, self.state.feedback);
        self.feedback.set_value(ctx, self.state.feedback);
    }

    /// Wet glides; dry follows as `1 - wet` on a short native ramp
    pub fn set_mix(&mut self, ctx: &mut AudioContext, mix: f64) {
        self.state.mix = clamp_or(mix, 0.0, 1.0, self.state.mix);
        self.wet.set_value(ctx, self.state.mix);
        ctx.ramp_param(
            self.dry_gain,
            param::GAIN,
            1.0 - self.state.mix,
            DRY_RAMP_SECONDS,
        );
    }
}

impl ModularNode for Delay {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Delay
    }

    fn input_port(&self, _ctx: &AudioContext) -> Option<AudioEndpoint> {
        Some(AudioEndpoint(self.input))
    }

    fn output_port(&self) -> Option<AudioEndpoint> {
        Some(AudioEndpoint(self.output))
    }

    fn cv_input(&self, port: &str) -> Option<NativeInput> {
        match port {
            "time" => Some(NativeInput::Param(self.delay, param::DELAY_TIME)),
            "feedback" => Some(NativeInput::Param(self.feedback_gain, param::GAIN)),
            "mix" => Some(NativeInput::Param(self.wet_gain, param::GAIN)),
            _ => None,
        }
    }

    fn state(&self) -> ModuleState {
        ModuleState::Delay(self.state.clone())
    }

    fn set_state(&mut self, ctx: &mut AudioContext, state: ModuleState) -> Result<(), StateError> {
        let ModuleState::Delay(state) = state else {
            return Err(mismatch(ModuleKind::Delay, &state));
        };
        self.set_time(ctx, state.time);
        self.set_feedback(ctx, state.feedback);
        self.set_mix(ctx, state.mix);
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut AudioContext) {
        self.time.destroy(ctx);
        self.feedback.destroy(ctx);
        self.wet.destroy(ctx);
        for id in [
            self.input,
            self.delay,
            self.feedback_gain,
            self.wet_gain,
            self.dry_gain,
            self.output,
        ] {
            ctx.release(id);
        }
    }
}
