//! Processing Modules
//!
//! Every module wraps native processing primitives and exposes typed
//! parameters. Continuous parameters are written through [`SmoothCv`] so
//! edits glide instead of clicking.
//!
//! The set of module kinds is closed. [`Module`] is the tagged sum over the
//! concrete types and is what the graph stores; [`ModularNode`] is the
//! contract each concrete type implements.
//!
//! [`SmoothCv`]: crate::smooth::SmoothCv

mod delay;
mod distortion;
mod envelope;
mod filter;
mod gain;
mod keyboard;
mod lfo;
mod master;
mod oscillator;
mod sequencer;

pub use delay::{Delay, DelayState, MAX_DELAY_SECONDS};
pub use distortion::{drive_curve, Distortion, DistortionState, CURVE_POINTS};
pub use envelope::{Adsr, AdsrState, MIN_STAGE_SECONDS};
pub use filter::{Filter, FilterState, CUTOFF_CV_HZ_PER_VOLT, RESONANCE_CV_SCALE};
pub use gain::{Gain, GainState};
pub use keyboard::{Keyboard, KeyboardState, NOTE_RAMP_SECONDS};
pub use lfo::{Lfo, LfoState};
pub use master::{Master, MasterState};
pub use oscillator::{
    Oscillator, OscillatorMode, OscillatorState, PITCH_BASE_HZ, PITCH_CV_CENTS_PER_VOLT,
};
pub use sequencer::{
    attach_to_transport, Pattern, Sequencer, SequencerState, Step, MAX_PATTERN_LENGTH,
};

use crate::context::{AudioContext, NativeId, NativeInput};
use crate::port::{AudioEndpoint, Capabilities, PortDef, PortSpec, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::str::FromStr;
use thiserror::Error;

/// Shared handle to a live module
pub type ModuleHandle = Rc<RefCell<Module>>;

/// Clamp into `[min, max]`, mapping NaN to `fallback`
pub(crate) fn clamp_or(value: f64, min: f64, max: f64, fallback: f64) -> f64 {
    if value.is_nan() {
        fallback
    } else {
        value.clamp(min, max)
    }
}

/// The closed set of module types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Oscillator,
    Filter,
    Delay,
    Distortion,
    Gain,
    Adsr,
    Lfo,
    Sequencer,
    Keyboard,
    Master,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 10] = [
        ModuleKind::Oscillator,
        ModuleKind::Filter,
        ModuleKind::Delay,
        ModuleKind::Distortion,
        ModuleKind::Gain,
        ModuleKind::Adsr,
        ModuleKind::Lfo,
        ModuleKind::Sequencer,
        ModuleKind::Keyboard,
        ModuleKind::Master,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Oscillator => "oscillator",
            ModuleKind::Filter => "filter",
            ModuleKind::Delay => "delay",
            ModuleKind::Distortion => "distortion",
            ModuleKind::Gain => "gain",
            ModuleKind::Adsr => "adsr",
            ModuleKind::Lfo => "lfo",
            ModuleKind::Sequencer => "sequencer",
            ModuleKind::Keyboard => "keyboard",
            ModuleKind::Master => "master",
        }
    }

    /// Static port layout, fixed for the lifetime of every instance
    pub fn port_spec(&self) -> PortSpec {
        let (inputs, outputs) = match self {
            ModuleKind::Oscillator => (
                vec![PortDef::cv("freq"), PortDef::cv("pitch")],
                vec![PortDef::audio()],
            ),
            ModuleKind::Filter => (
                vec![PortDef::audio(), PortDef::cv("cutoff"), PortDef::cv("res")],
                vec![PortDef::audio()],
            ),
            ModuleKind::Delay => (
                vec![
                    PortDef::audio(),
                    PortDef::cv("time"),
                    PortDef::cv("feedback"),
                    PortDef::cv("mix"),
                ],
                vec![PortDef::audio()],
            ),
            ModuleKind::Distortion => (
                vec![PortDef::audio(), PortDef::cv("drive")],
                vec![PortDef::audio()],
            ),
            ModuleKind::Gain => (
                vec![PortDef::audio(), PortDef::cv("level")],
                vec![PortDef::audio()],
            ),
            ModuleKind::Adsr => (
                vec![PortDef::audio(), PortDef::gate()],
                vec![PortDef::audio()],
            ),
            ModuleKind::Lfo => (vec![PortDef::cv("freq")], vec![PortDef::audio()]),
            ModuleKind::Sequencer | ModuleKind::Keyboard => {
                (vec![], vec![PortDef::audio(), PortDef::gate()])
            }
            ModuleKind::Master => (vec![PortDef::audio()], vec![]),
        };
        PortSpec { inputs, outputs }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            ModuleKind::Adsr => Capabilities::GATE_LISTENER,
            ModuleKind::Sequencer | ModuleKind::Keyboard => Capabilities::GATE_SOURCE,
            ModuleKind::Master => Capabilities::NONE,
            _ => Capabilities::CV_TARGET,
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleKind {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModuleKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| StateError::UnknownKind(s.to_string()))
    }
}

/// Errors raised while reading or applying module state
#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown module type: {0}")]
    UnknownKind(String),

    #[error("invalid {kind} state: {source}")]
    Invalid {
        kind: ModuleKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("{found} state given to a {expected} module")]
    KindMismatch {
        expected: ModuleKind,
        found: ModuleKind,
    },
}

/// Typed per-kind parameter snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleState {
    Oscillator(OscillatorState),
    Filter(FilterState),
    Delay(DelayState),
    Distortion(DistortionState),
    Gain(GainState),
    Adsr(AdsrState),
    Lfo(LfoState),
    Sequencer(SequencerState),
    Keyboard(KeyboardState),
    Master(MasterState),
}

impl ModuleState {
    pub fn kind(&self) -> ModuleKind {
        match self {
            ModuleState::Oscillator(_) => ModuleKind::Oscillator,
            ModuleState::Filter(_) => ModuleKind::Filter,
            ModuleState::Delay(_) => ModuleKind::Delay,
            ModuleState::Distortion(_) => ModuleKind::Distortion,
            ModuleState::Gain(_) => ModuleKind::Gain,
            ModuleState::Adsr(_) => ModuleKind::Adsr,
            ModuleState::Lfo(_) => ModuleKind::Lfo,
            ModuleState::Sequencer(_) => ModuleKind::Sequencer,
            ModuleState::Keyboard(_) => ModuleKind::Keyboard,
            ModuleState::Master(_) => ModuleKind::Master,
        }
    }

    /// Default state for a kind
    pub fn default_for(kind: ModuleKind) -> Self {
        match kind {
            ModuleKind::Oscillator => ModuleState::Oscillator(Default::default()),
            ModuleKind::Filter => ModuleState::Filter(Default::default()),
            ModuleKind::Delay => ModuleState::Delay(Default::default()),
            ModuleKind::Distortion => ModuleState::Distortion(Default::default()),
            ModuleKind::Gain => ModuleState::Gain(Default::default()),
            ModuleKind::Adsr => ModuleState::Adsr(Default::default()),
            ModuleKind::Lfo => ModuleState::Lfo(Default::default()),
            ModuleKind::Sequencer => ModuleState::Sequencer(Default::default()),
            ModuleKind::Keyboard => ModuleState::Keyboard(Default::default()),
            ModuleKind::Master => ModuleState::Master(Default::default()),
        }
    }

    /// Serialize to the JSON blob stored in patch documents
    pub fn to_value(&self) -> serde_json::Value {
        let result = match self {
            ModuleState::Oscillator(s) => serde_json::to_value(s),
            ModuleState::Filter(s) => serde_json::to_value(s),
            ModuleState::Delay(s) => serde_json::to_value(s),
            ModuleState::Distortion(s) => serde_json::to_value(s),
            ModuleState::Gain(s) => serde_json::to_value(s),
            ModuleState::Adsr(s) => serde_json::to_value(s),
            ModuleState::Lfo(s) => serde_json::to_value(s),
            ModuleState::Sequencer(s) => serde_json::to_value(s),
            ModuleState::Keyboard(s) => serde_json::to_value(s),
            ModuleState::Master(s) => serde_json::to_value(s),
        };
        result.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "state serialization failed");
            serde_json::Value::Object(Default::default())
        })
    }

    /// Parse a JSON blob for `kind`. Missing fields take their defaults.
    pub fn from_value(kind: ModuleKind, value: &serde_json::Value) -> Result<Self, StateError> {
        if value.is_null() {
            return Ok(Self::default_for(kind));
        }
        fn parse<T: serde::de::DeserializeOwned>(
            kind: ModuleKind,
            value: &serde_json::Value,
        ) -> Result<T, StateError> {
            T::deserialize(value).map_err(|source| StateError::Invalid { kind, source })
        }
        Ok(match kind {
            ModuleKind::Oscillator => ModuleState::Oscillator(parse(kind, value)?),
            ModuleKind::Filter => ModuleState::Filter(parse(kind, value)?),
            ModuleKind::Delay => ModuleState::Delay(parse(kind, value)?),
            ModuleKind::Distortion => ModuleState::Distortion(parse(kind, value)?),
            ModuleKind::Gain => ModuleState::Gain(parse(kind, value)?),
            ModuleKind::Adsr => ModuleState::Adsr(parse(kind, value)?),
            ModuleKind::Lfo => ModuleState::Lfo(parse(kind, value)?),
            ModuleKind::Sequencer => ModuleState::Sequencer(parse(kind, value)?),
            ModuleKind::Keyboard => ModuleState::Keyboard(parse(kind, value)?),
            ModuleKind::Master => ModuleState::Master(parse(kind, value)?),
        })
    }
}

/// Contract shared by every processing module
pub trait ModularNode {
    fn kind(&self) -> ModuleKind;

    fn capabilities(&self) -> Capabilities {
        self.kind().capabilities()
    }

    /// Audio input endpoint. `None` when the node has none, or when it is not
    /// available yet.
    fn input_port(&self, ctx: &AudioContext) -> Option<AudioEndpoint>;

    fn output_port(&self) -> Option<AudioEndpoint>;

    /// Native source behind an output port id
    fn output(&self, port: &str) -> Option<NativeId> {
        if port == DEFAULT_PORT {
            self.output_port().map(|e| e.id())
        } else {
            None
        }
    }

    /// Native landing point of a CV input port
    fn cv_input(&self, _port: &str) -> Option<NativeInput> {
        None
    }

    fn state(&self) -> ModuleState;

    fn set_state(&mut self, ctx: &mut AudioContext, state: ModuleState) -> Result<(), StateError>;

    /// Gate transition notification (gate listeners only)
    fn on_gate_signal(&mut self, _ctx: &mut AudioContext, _gate_on: bool, _time: f64) {}

    /// Stop owned sources and release every native resource
    fn destroy(&mut self, ctx: &mut AudioContext);

    /// Route this node's audio output into `other`'s audio input
    fn connect(&self, ctx: &mut AudioContext, other: &dyn ModularNode) -> bool {
        match (self.output_port(), other.input_port(ctx)) {
            (Some(out), Some(input)) => ctx.connect(out.id(), input.as_input()),
            _ => {
                tracing::warn!(
                    from = %self.kind(),
                    to = %other.kind(),
                    "connect ignored: missing audio port"
                );
                false
            }
        }
    }

    fn disconnect(&self, ctx: &mut AudioContext, other: &dyn ModularNode) -> bool {
        match (self.output_port(), other.input_port(ctx)) {
            (Some(out), Some(input)) => ctx.disconnect(out.id(), input.as_input()),
            _ => false,
        }
    }
}

pub(crate) fn mismatch(expected: ModuleKind, found: &ModuleState) -> StateError {
    StateError::KindMismatch {
        expected,
        found: found.kind(),
    }
}

/// Gate listeners registered on a gate source
#[derive(Debug, Default)]
pub struct GateTargets {
    targets: Vec<(String, Weak<RefCell<Module>>)>,
}

impl GateTargets {
    pub fn add(&mut self, id: impl Into<String>, handle: &ModuleHandle) -> bool {
        let id = id.into();
        if self.targets.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        self.targets.push((id, Rc::downgrade(handle)));
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.targets.len();
        self.targets.retain(|(existing, _)| existing != id);
        before != self.targets.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|(id, _)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn clear(&mut self) {
        self.targets.clear();
    }

    /// Deliver a gate transition to every live target
    pub fn notify(&self, ctx: &mut AudioContext, gate_on: bool, time: f64) {
        for (id, target) in &self.targets {
            let Some(handle) = target.upgrade() else {
                continue;
            };
            match handle.try_borrow_mut() {
                Ok(mut module) => module.on_gate_signal(ctx, gate_on, time),
                Err(_) => tracing::warn!(target = %id, "gate target busy; transition dropped"),
            };
        }
    }
}

/// A live module of any kind
#[derive(Debug)]
pub enum Module {
    Oscillator(Oscillator),
    Filter(Filter),
    Delay(Delay),
    Distortion(Distortion),
    Gain(Gain),
    Adsr(Adsr),
    Lfo(Lfo),
    Sequencer(Sequencer),
    Keyboard(Keyboard),
    Master(Master),
}

macro_rules! dispatch {
    ($self:expr, $node:ident => $body:expr) => {
        match $self {
            Module::Oscillator($node) => $body,
            Module::Filter($node) => $body,
            Module::Delay($node) => $body,
            Module::Distortion($node) => $body,
            Module::Gain($node) => $body,
            Module::Adsr($node) => $body,
            Module::Lfo($node) => $body,
            Module::Sequencer($node) => $body,
            Module::Keyboard($node) => $body,
            Module::Master($node) => $body,
        }
    };
}

impl Module {
    /// Build a module of `kind` with default parameters
    pub fn new(ctx: &mut AudioContext, kind: ModuleKind) -> Self {
        match kind {
            ModuleKind::Oscillator => Module::Oscillator(Oscillator::new(ctx)),
            ModuleKind::Filter => Module::Filter(Filter::new(ctx)),
            ModuleKind::Delay => Module::Delay(Delay::new(ctx)),
            ModuleKind::Distortion => Module::Distortion(Distortion::new(ctx)),
            ModuleKind::Gain => Module::Gain(Gain::new(ctx)),
            ModuleKind::Adsr => Module::Adsr(Adsr::new(ctx)),
            ModuleKind::Lfo => Module::Lfo(Lfo::new(ctx)),
            ModuleKind::Sequencer => Module::Sequencer(Sequencer::new(ctx)),
            ModuleKind::Keyboard => Module::Keyboard(Keyboard::new(ctx)),
            ModuleKind::Master => Module::Master(Master::new()),
        }
    }

    /// Apply a JSON state blob
    pub fn set_state_value(
        &mut self,
        ctx: &mut AudioContext,
        value: &serde_json::Value,
    ) -> Result<(), StateError> {
        let state = ModuleState::from_value(self.kind(), value)?;
        self.set_state(ctx, state)
    }

    /// Gate listeners, for gate sources
    pub fn gate_targets(&self) -> Option<&GateTargets> {
        match self {
            Module::Sequencer(seq) => Some(seq.gate_targets()),
            Module::Keyboard(kb) => Some(kb.gate_targets()),
            _ => None,
        }
    }

    pub fn gate_targets_mut(&mut self) -> Option<&mut GateTargets> {
        match self {
            Module::Sequencer(seq) => Some(seq.gate_targets_mut()),
            Module::Keyboard(kb) => Some(kb.gate_targets_mut()),
            _ => None,
        }
    }

    pub fn as_sequencer(&self) -> Option<&Sequencer> {
        match self {
            Module::Sequencer(seq) => Some(seq),
            _ => None,
        }
    }

    pub fn as_sequencer_mut(&mut self) -> Option<&mut Sequencer> {
        match self {
            Module::Sequencer(seq) => Some(seq),
            _ => None,
        }
    }

    pub fn as_keyboard_mut(&mut self) -> Option<&mut Keyboard> {
        match self {
            Module::Keyboard(kb) => Some(kb),
            _ => None,
        }
    }

    pub fn as_adsr(&self) -> Option<&Adsr> {
        match self {
            Module::Adsr(env) => Some(env),
            _ => None,
        }
    }
}

impl ModularNode for Module {
    fn kind(&self) -> ModuleKind {
        dispatch!(self, node => node.kind())
    }

    fn capabilities(&self) -> Capabilities {
        dispatch!(self, node => node.capabilities())
    }

    fn input_port(&self, ctx: &AudioContext) -> Option<AudioEndpoint> {
        dispatch!(self, node => node.input_port(ctx))
    }

    fn output_port(&self) -> Option<AudioEndpoint> {
        dispatch!(self, node => node.output_port())
    }

    fn output(&self, port: &str) -> Option<NativeId> {
        dispatch!(self, node => node.output(port))
    }

    fn cv_input(&self, port: &str) -> Option<NativeInput> {
        dispatch!(self, node => node.cv_input(port))
    }

    fn state(&self) -> ModuleState {
        dispatch!(self, node => node.state())
    }

    fn set_state(&mut self, ctx: &mut AudioContext, state: ModuleState) -> Result<(), StateError> {
        dispatch!(self, node => node.set_state(ctx, state))
    }

    fn on_gate_signal(&mut self, ctx: &mut AudioContext, gate_on: bool, time: f64) {
        if self.capabilities().contains(Capabilities::GATE_LISTENER) {
            dispatch!(self, node => node.on_gate_signal(ctx, gate_on, time))
        }
    }

    fn destroy(&mut self, ctx: &mut AudioContext) {
        dispatch!(self, node => node.destroy(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ManualClock, NativeFeatures};
    use crate::port::PortKind;

    fn context() -> AudioContext {
        let mut ctx = AudioContext::new(ManualClock::new(0.0), NativeFeatures::default());
        ctx.initialize();
        ctx
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in ModuleKind::ALL {
            assert_eq!(kind.as_str().parse::<ModuleKind>().ok(), Some(kind));
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
        }
        assert!("theremin".parse::<ModuleKind>().is_err());
    }

    #[test]
    fn test_port_presence() {
        assert!(!ModuleKind::Oscillator.port_spec().has_audio_input());
        assert!(ModuleKind::Oscillator.port_spec().has_audio_output());
        assert!(ModuleKind::Master.port_spec().has_audio_input());
        assert!(!ModuleKind::Master.port_spec().has_audio_output());
        let adsr = ModuleKind::Adsr.port_spec();
        assert_eq!(adsr.input("gate").map(|p| p.kind), Some(PortKind::Gate));
    }

    #[test]
    fn test_every_kind_builds_and_reports_its_state() {
        let mut ctx = context();
        for kind in ModuleKind::ALL {
            let mut module = Module::new(&mut ctx, kind);
            assert_eq!(module.kind(), kind);
            assert_eq!(module.state().kind(), kind);
            assert_eq!(
                module.output_port().is_some(),
                kind.port_spec().has_audio_output()
            );
            assert_eq!(
                module.input_port(&ctx).is_some(),
                kind.port_spec().has_audio_input()
            );
            for port in kind.port_spec().cv_inputs() {
                assert!(module.cv_input(port).is_some(), "{kind} lacks {port}");
            }
            module.destroy(&mut ctx);
        }
        assert_eq!(ctx.live_node_count(), 0);
    }

    #[test]
    fn test_state_value_round_trip() {
        let mut ctx = context();
        for kind in ModuleKind::ALL {
            let module = Module::new(&mut ctx, kind);
            let value = module.state().to_value();
            let parsed = ModuleState::from_value(kind, &value).unwrap();
            assert_eq!(parsed, module.state());
        }
    }

    #[test]
    fn test_state_kind_mismatch() {
        let mut ctx = context();
        let mut gain = Module::new(&mut ctx, ModuleKind::Gain);
        let result = gain.set_state(&mut ctx, ModuleState::default_for(ModuleKind::Filter));
        assert!(matches!(result, Err(StateError::KindMismatch { .. })));
    }

    #[test]
    fn test_invalid_state_blob() {
        let value = serde_json::json!({ "level": "loud" });
        let result = ModuleState::from_value(ModuleKind::Gain, &value);
        assert!(matches!(result, Err(StateError::Invalid { .. })));
    }

    #[test]
    fn test_connect_without_ports_is_noop() {
        let mut ctx = context();
        let osc = Module::new(&mut ctx, ModuleKind::Oscillator);
        let other = Module::new(&mut ctx, ModuleKind::Oscillator);
        let edges = ctx.edges().len();
        assert!(!osc.connect(&mut ctx, &other));
        assert_eq!(ctx.edges().len(), edges);

        let filter = Module::new(&mut ctx, ModuleKind::Filter);
        assert!(osc.connect(&mut ctx, &filter));
        assert!(osc.disconnect(&mut ctx, &filter));
    }

    #[test]
    fn test_gate_targets_deduplicate() {
        let mut ctx = context();
        let env: ModuleHandle = Rc::new(RefCell::new(Module::new(&mut ctx, ModuleKind::Adsr)));
        let mut targets = GateTargets::default();
        assert!(targets.add("env", &env));
        assert!(!targets.add("env", &env));
        assert_eq!(targets.len(), 1);
        assert!(targets.remove("env"));
        assert!(targets.is_empty());
    }
}
