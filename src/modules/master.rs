use super::{clamp_or, mismatch, ModularNode, ModuleKind, ModuleState, StateError};
use crate::context::AudioContext;
use crate::port::AudioEndpoint;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MasterState {
    pub volume: f64,
}

impl Default for MasterState {
    fn default() -> Self {
        Self { volume: 0.8 }
    }
}

/// Output sink
///
/// The input resolves to the context destination on every call, so it is
/// `None` until the audio subsystem is initialized.
#[derive(Debug, Default)]
pub struct Master {
    state: MasterState,
}

impl Master {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModularNode for Master {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Master
    }

    fn input_port(&self, ctx: &AudioContext) -> Option<AudioEndpoint> {
        ctx.destination().map(AudioEndpoint)
    }

    fn output_port(&self) -> Option<AudioEndpoint> {
        None
    }

    fn state(&self) -> ModuleState {
        ModuleState::Master(self.state.clone())
    }

    fn set_state(&mut self, _ctx: &mut AudioContext, state: ModuleState) -> Result<(), StateError> {
        let ModuleState::Master(state) = state else {
            return Err(mismatch(ModuleKind::Master, &state));
        };
        self.state.volume = clamp_or(state.volume, 0.0, 1.0, self.state.volume);
        Ok(())
    }

    fn destroy(&mut self, _ctx: &mut AudioContext) {}
}
