use super::{clamp_or, mismatch, ModularNode, ModuleKind, ModuleState, StateError};
use crate::context::{param, AudioContext, NativeId};
use crate::port::AudioEndpoint;
use serde::{Deserialize, Serialize};

/// Shortest allowed attack, decay or release
pub const MIN_STAGE_SECONDS: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdsrState {
    pub attack: f64,
    pub decay: f64,
    pub sustain: f64,
    pub release: f64,
}

impl Default for AdsrState {
    fn default() -> Self {
        Self {
            attack: 0.01,
            decay: 0.2,
            sustain: 0.6,
            release: 0.4,
        }
    }
}

impl AdsrState {
    fn clamped(self) -> Self {
        let stage = |v: f64, fallback: f64| {
            if v.is_nan() {
                fallback
            } else {
                v.max(MIN_STAGE_SECONDS)
            }
        };
        let defaults = AdsrState::default();
        Self {
            attack: stage(self.attack, defaults.attack),
            decay: stage(self.decay, defaults.decay),
            sustain: clamp_or(self.sustain, 0.0, 1.0, defaults.sustain),
            release: stage(self.release, defaults.release),
        }
    }
}

/// ADSR Envelope
///
/// A VCA whose gain follows the envelope. Gate transitions arrive through
/// [`ModularNode::on_gate_signal`] and are scheduled at their exact time.
#[derive(Debug)]
pub struct Adsr {
    vca: NativeId,
    state: AdsrState,
}

impl Adsr {
    pub fn new(ctx: &mut AudioContext) -> Self {
        Self {
            vca: ctx.create_gain(0.0),
            state: AdsrState::default(),
        }
    }

    pub fn set_attack(&mut self, seconds: f64) {
        self.state = AdsrState {
            attack: seconds,
            ..self.state.clone()
        }
        .clamped();
    }

    pub fn set_decay(&mut self, seconds: f64) {
        self.state = AdsrState {
            decay: seconds,
            ..self.state.clone()
        }
        .clamped();
    }

    pub fn set_sustain(&mut self, level: f64) {
        self.state = AdsrState {
            sustain: level,
            ..self.state.clone()
        }
        .clamped();
    }

    pub fn set_release(&mut self, seconds: f64) {
        self.state = AdsrState {
            release: seconds,
            ..self.state.clone()
        }
        .clamped();
    }

    /// Envelope gain scheduled at `time`
    pub fn level_at(&self, ctx: &AudioContext, time: f64) -> f64 {
        ctx.param(self.vca, param::GAIN)
            .map(|p| p.value_at(time))
            .unwrap_or_default()
    }

    /// Ramp to full over `attack`, then settle toward `sustain`
    pub fn trigger_attack_at(&mut self, ctx: &mut AudioContext, time: f64) {
        let AdsrState {
            attack,
            decay,
            sustain,
            ..
        } = self.state;
        ctx.with_param(self.vca, param::GAIN, |gain| {
            let current = gain.value_at(time);
            gain.cancel_scheduled_values(time);
            gain.set_value_at_time(current, time);
            gain.linear_ramp_to_value_at_time(1.0, time + attack);
            gain.set_target_at_time(sustain, time + attack, decay / 3.0);
        });
    }

    /// Freeze wherever the curve is, then decay to silence over `release`
    pub fn trigger_release_at(&mut self, ctx: &mut AudioContext, time: f64) {
        let release = self.state.release;
        let hold = ctx.features().cancel_and_hold;
        let now = ctx.now();
        ctx.with_param(self.vca, param::GAIN, |gain| {
            if hold {
                gain.cancel_and_hold_at_time(time);
            } else {
                let pinned = gain.value_at(now);
                gain.cancel_scheduled_values(time);
                gain.set_value_at_time(pinned, time);
            }
            gain.set_target_at_time(0.0, time, release / 3.0);
        });
    }
}

impl ModularNode for Adsr {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Adsr
    }

    fn input_port(&self, _ctx: &AudioContext) -> Option<AudioEndpoint> {
        Some(AudioEndpoint(self.vca))
    }

    fn output_port(&self) -> Option<AudioEndpoint> {
        Some(AudioEndpoint(self.vca))
    }

    fn state(&self) -> ModuleState {
        ModuleState::Adsr(self.state.clone())
    }

    fn set_state(&mut self, _ctx: &mut AudioContext, state: ModuleState) -> Result<(), StateError> {
        let ModuleState::Adsr(state) = state else {
            return Err(mismatch(ModuleKind::Adsr, &state));
        };
        self.state = state.clamped();
        Ok(())
    }

    fn on_gate_signal(&mut self, ctx: &mut AudioContext, gate_on: bool, time: f64) {
        if gate_on {
            self.trigger_attack_at(ctx, time);
        } else {
            self.trigger_release_at(ctx, time);
        }
    }

    fn destroy(&mut self, ctx: &mut AudioContext) {
        ctx.release(self.vca);
    }
}
