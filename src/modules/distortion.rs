use super::{clamp_or, mismatch, ModularNode, ModuleKind, ModuleState, StateError};
use crate::context::{param, AudioContext, NativeId, NativeInput};
use crate::port::AudioEndpoint;
use crate::smooth::{SmoothCv, DEFAULT_SLEW_HZ};
use libm::Libm;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

/// Resolution of the shaping curve over [-1, 1]
pub const CURVE_POINTS: usize = 1024;

const CURVE_STEEPNESS: f64 = 2.5;

/// The shared transfer curve, `tanh(2.5x) / tanh(2.5)`
pub fn drive_curve() -> Arc<[f32]> {
    static CURVE: OnceLock<Arc<[f32]>> = OnceLock::new();
    CURVE
        .get_or_init(|| {
            let norm = Libm::<f64>::tanh(CURVE_STEEPNESS);
            (0..CURVE_POINTS)
                .map(|i| {
                    let x = 2.0 * i as f64 / (CURVE_POINTS - 1) as f64 - 1.0;
                    (Libm::<f64>::tanh(CURVE_STEEPNESS * x) / norm) as f32
                })
                .collect()
        })
        .clone()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DistortionState {
    pub drive: f64,
    pub level: f64,
}

impl Default for DistortionState {
    fn default() -> Self {
        Self {
            drive: 2.0,
            level: 0.8,
        }
    }
}

/// Waveshaping Distortion
///
/// Pre-gain (`1 + drive`) into a fixed soft-clip curve, then an output level.
#[derive(Debug)]
pub struct Distortion {
    pre: NativeId,
    shaper: NativeId,
    post: NativeId,
    drive: SmoothCv,
    level: SmoothCv,
    state: DistortionState,
}

impl Distortion {
    pub fn new(ctx: &mut AudioContext) -> Self {
        let state = DistortionState::default();

        let pre = ctx.create_gain(1.0);
        let shaper = ctx.create_wave_shaper(drive_curve());
        let post = ctx.create_gain(0.0);
        ctx.connect(pre, NativeInput::Node(shaper));
        ctx.connect(shaper, NativeInput::Node(post));

        let drive = SmoothCv::new(ctx, state.drive, DEFAULT_SLEW_HZ);
        drive.connect(ctx, NativeInput::Param(pre, param::GAIN));
        let level = SmoothCv::new(ctx, state.level, DEFAULT_SLEW_HZ);
        level.connect(ctx, NativeInput::Param(post, param::GAIN));

        Self {
            pre,
            shaper,
            post,
            drive,
            level,
            state,
        }
    }

    pub fn set_drive(&mut self, ctx: &mut AudioContext, drive: f64) {
        self.state.drive = clamp_or(drive, 0.0, 10.0, self.state.drive);
        self.drive.set_value(ctx, self.state.drive);
    }

    pub fn set_level(&mut self, ctx: &mut AudioContext, level: f64) {
        self.state.level = clamp_or(level, 0.0, 2.0, self.state.level);
        self.level.set_value(ctx, self.state.level);
    }
}

impl ModularNode for Distortion {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Distortion
    }

    fn input_port(&self, _ctx: &AudioContext) -> Option<AudioEndpoint> {
        Some(AudioEndpoint(self.pre))
    }

    fn output_port(&self) -> Option<AudioEndpoint> {
        Some(AudioEndpoint(self.post))
    }

    fn cv_input(&self, port: &str) -> Option<NativeInput> {
        (port == "drive").then_some(NativeInput::Param(self.pre, param::GAIN))
    }

    fn state(&self) -> ModuleState {
        ModuleState::Distortion(self.state.clone())
    }

    fn set_state(&mut self, ctx: &mut AudioContext, state: ModuleState) -> Result<(), StateError> {
        let ModuleState::Distortion(state) = state else {
            return Err(mismatch(ModuleKind::Distortion, &state));
        };
        self.set_drive(ctx, state.drive);
        self.set_level(ctx, state.level);
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut AudioContext) {
        self.drive.destroy(ctx);
        self.level.destroy(ctx);
        ctx.release(self.pre);
        ctx.release(self.shaper);
        ctx.release(self.post);
    }
}
