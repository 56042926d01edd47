use super::{mismatch, GateTargets, ModularNode, ModuleKind, ModuleState, StateError};
use crate::context::{param, AudioContext, NativeId};
use crate::port::{AudioEndpoint, GATE_PORT};
use serde::{Deserialize, Serialize};

/// Ramp applied to note and gate CV on every key event
pub const NOTE_RAMP_SECONDS: f64 = 0.005;

/// Convert a MIDI note to 1 V/oct CV, 0.0 at middle C
pub(crate) fn note_cv(midi: u8) -> f64 {
    (f64::from(midi) - 60.0) / 12.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeyboardState {
    pub octave: i32,
}

impl Default for KeyboardState {
    fn default() -> Self {
        Self { octave: 0 }
    }
}

/// Interactive note source
///
/// Outputs note CV on `audio` and gate CV on `gate`, and notifies gate
/// listeners on every key event.
#[derive(Debug)]
pub struct Keyboard {
    note: NativeId,
    gate: NativeId,
    targets: GateTargets,
    active: Option<u8>,
    state: KeyboardState,
}

fn ramp_offset(ctx: &mut AudioContext, id: NativeId, value: f64, time: f64) {
    ctx.with_param(id, param::OFFSET, |p| {
        let current = p.value_at(time);
        p.cancel_scheduled_values(time);
        p.set_value_at_time(current, time);
        p.linear_ramp_to_value_at_time(value, time + NOTE_RAMP_SECONDS);
    });
}

impl Keyboard {
    pub fn new(ctx: &mut AudioContext) -> Self {
        let note = ctx.create_constant_source(0.0);
        let gate = ctx.create_constant_source(0.0);
        let now = ctx.now();
        ctx.start(note, now);
        ctx.start(gate, now);
        Self {
            note,
            gate,
            targets: GateTargets::default(),
            active: None,
            state: KeyboardState::default(),
        }
    }

    pub fn set_octave(&mut self, octave: i32) {
        self.state.octave = octave.clamp(-2, 3);
    }

    /// Currently held note after octave transposition
    pub fn active_note(&self) -> Option<u8> {
        self.active
    }

    pub fn note_on(&mut self, ctx: &mut AudioContext, midi: i32, time: f64) {
        let shifted = (midi + self.state.octave * 12).clamp(0, 127) as u8;
        self.active = Some(shifted);
        ramp_offset(ctx, self.note, note_cv(shifted), time);
        ramp_offset(ctx, self.gate, 1.0, time);
        self.targets.notify(ctx, true, time);
    }

    pub fn note_off(&mut self, ctx: &mut AudioContext, time: f64) {
        self.active = None;
        ramp_offset(ctx, self.gate, 0.0, time);
        self.targets.notify(ctx, false, time);
    }

    pub fn gate_targets(&self) -> &GateTargets {
        &self.targets
    }

    pub fn gate_targets_mut(&mut self) -> &mut GateTargets {
        &mut self.targets
    }
}

impl ModularNode for Keyboard {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Keyboard
    }

    fn input_port(&self, _ctx: &AudioContext) -> Option<AudioEndpoint> {
        None
    }

    fn output_port(&self) -> Option<AudioEndpoint> {
        Some(AudioEndpoint(self.note))
    }

    fn output(&self, port: &str) -> Option<NativeId> {
        match port {
            GATE_PORT => Some(self.gate),
            crate::port::DEFAULT_PORT => Some(self.note),
            _ => None,
        }
    }

    fn state(&self) -> ModuleState {
        ModuleState::Keyboard(self.state.clone())
    }

    fn set_state(&mut self, _ctx: &mut AudioContext, state: ModuleState) -> Result<(), StateError> {
        let ModuleState::Keyboard(state) = state else {
            return Err(mismatch(ModuleKind::Keyboard, &state));
        };
        self.set_octave(state.octave);
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut AudioContext) {
        let now = ctx.now();
        self.targets.clear();
        for id in [self.note, self.gate] {
            ctx.stop(id, now);
            ctx.release(id);
        }
    }
}
