use super::{clamp_or, mismatch, ModularNode, ModuleKind, ModuleState, StateError};
use crate::context::{param, AudioContext, NativeId, NativeInput};
use crate::port::AudioEndpoint;
use crate::smooth::{SmoothCv, DEFAULT_SLEW_HZ};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GainState {
    pub level: f64,
}

impl Default for GainState {
    fn default() -> Self {
        Self { level: 0.8 }
    }
}

/// Voltage-Controlled Amplifier
#[derive(Debug)]
pub struct Gain {
    vca: NativeId,
    level: SmoothCv,
    state: GainState,
}

impl Gain {
    pub fn new(ctx: &mut AudioContext) -> Self {
        let state = GainState::default();
        let vca = ctx.create_gain(0.0);
        let level = SmoothCv::new(ctx, state.level, DEFAULT_SLEW_HZ);
        level.connect(ctx, NativeInput::Param(vca, param::GAIN));
        Self { vca, level, state }
    }

    pub fn set_level(&mut self, ctx: &mut AudioContext, level: f64) {
        self.state.level = clamp_or(level, 0.0, 2.0, self.state.level);
        self.level.set_value(ctx, self.state.level);
    }
}

impl ModularNode for Gain {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Gain
    }

    fn input_port(&self, _ctx: &AudioContext) -> Option<AudioEndpoint> {
        Some(AudioEndpoint(self.vca))
    }

    fn output_port(&self) -> Option<AudioEndpoint> {
        Some(AudioEndpoint(self.vca))
    }

    fn cv_input(&self, port: &str) -> Option<NativeInput> {
        (port == "level").then_some(NativeInput::Param(self.vca, param::GAIN))
    }

    fn state(&self) -> ModuleState {
        ModuleState::Gain(self.state.clone())
    }

    fn set_state(&mut self, ctx: &mut AudioContext, state: ModuleState) -> Result<(), StateError> {
        let ModuleState::Gain(state) = state else {
            return Err(mismatch(ModuleKind::Gain, &state));
        };
        self.set_level(ctx, state.level);
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut AudioContext) {
        self.level.destroy(ctx);
        ctx.release(self.vca);
    }
}
