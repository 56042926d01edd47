//! Slew-limited control values
//!
//! A [`SmoothCv`] turns instantaneous parameter writes into continuous glides.
//! Internally a constant source is stepped to the new value and a fixed
//! low-pass stage (no resonance, cutoff = slew rate) smooths the step, so no
//! ramp ever has to be scheduled explicitly.

use crate::context::{param, AudioContext, FilterType, NativeId, NativeInput};
use libm::Libm;
use std::f64::consts::TAU;

/// Slew rate for general panel controls
pub const DEFAULT_SLEW_HZ: f64 = 15.0;

/// Faster slew for modulation sources
pub const FAST_SLEW_HZ: f64 = 30.0;

/// A slew-limited control value feeding native parameters
#[derive(Debug)]
pub struct SmoothCv {
    raw: NativeId,
    smoother: NativeId,
    slew_hz: f64,
    value: f64,
    anchor_time: f64,
    anchor_output: f64,
}

impl SmoothCv {
    pub fn new(ctx: &mut AudioContext, initial: f64, slew_hz: f64) -> Self {
        let raw = ctx.create_constant_source(initial);
        let smoother = ctx.create_filter(FilterType::Lowpass);
        ctx.set_intrinsic(smoother, param::FREQUENCY, slew_hz);
        ctx.set_intrinsic(smoother, param::Q, 0.0);
        ctx.connect(raw, NativeInput::Node(smoother));
        let now = ctx.now();
        ctx.start(raw, now);

        Self {
            raw,
            smoother,
            slew_hz,
            value: initial,
            anchor_time: now,
            anchor_output: initial,
        }
    }

    /// The smoothed output, attachable to any native parameter
    pub fn target(&self) -> NativeId {
        self.smoother
    }

    pub fn slew_hz(&self) -> f64 {
        self.slew_hz
    }

    /// The most recently written (unsmoothed) value
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Step the raw source; the low-pass stage turns the step into a glide
    pub fn set_value(&mut self, ctx: &mut AudioContext, value: f64) {
        let now = ctx.now();
        self.anchor_output = self.output_at(now);
        self.anchor_time = now;
        self.value = value;
        ctx.set_param_now(self.raw, param::OFFSET, value);
    }

    /// Response of the smoothing stage at `time` (for `time` at or after the last write)
    pub fn output_at(&self, time: f64) -> f64 {
        let elapsed = (time - self.anchor_time).max(0.0);
        let decay = Libm::<f64>::exp(-TAU * self.slew_hz * elapsed);
        self.value + (self.anchor_output - self.value) * decay
    }

    /// Feed the smoothed output into a native parameter or node
    pub fn connect(&self, ctx: &mut AudioContext, to: NativeInput) -> bool {
        ctx.connect(self.smoother, to)
    }

    /// Stop the raw generator and drop both stages
    pub fn destroy(&mut self, ctx: &mut AudioContext) {
        let now = ctx.now();
        ctx.stop(self.raw, now);
        ctx.disconnect_all(self.raw);
        ctx.disconnect_all(self.smoother);
        ctx.release(self.raw);
        ctx.release(self.smoother);
    }
}
