//! Native Audio Context
//!
//! The host's native audio layer, seen from the control plane: an arena of
//! processing primitives (generators, filters, shapers, delays, gains and
//! constant sources), the edges between them, their automatable parameters,
//! and a monotonic clock. Sample-level rendering happens elsewhere; this
//! context only records what the control plane asked for.
//!
//! The context is an explicit object constructed once by the host and passed
//! by reference to every component that needs it.

use crate::automation::AudioParam;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

new_key_type! {
    /// Handle to a native processing node
    pub struct NativeId;
}

/// Parameter names used by the native primitives
pub mod param {
    pub const FREQUENCY: &str = "frequency";
    pub const DETUNE: &str = "detune";
    pub const Q: &str = "q";
    pub const GAIN: &str = "gain";
    pub const DELAY_TIME: &str = "delay_time";
    pub const OFFSET: &str = "offset";
}

/// Monotonic time source in the audio-clock domain (seconds)
pub trait Clock {
    fn now(&self) -> f64;
}

/// Wall-clock time elapsed since construction
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Manually driven clock; clones share the same time
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    time: Rc<Cell<f64>>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            time: Rc::new(Cell::new(start)),
        }
    }

    pub fn set(&self, time: f64) {
        // Time never runs backwards
        if time > self.time.get() {
            self.time.set(time);
        }
    }

    pub fn advance(&self, seconds: f64) {
        self.set(self.time.get() + seconds.max(0.0));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.time.get()
    }
}

/// Optional capabilities of the native layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeFeatures {
    /// Whether parameters support hold-and-cancel of in-flight automation
    pub cancel_and_hold: bool,
}

impl Default for NativeFeatures {
    fn default() -> Self {
        Self {
            cancel_and_hold: true,
        }
    }
}

/// Periodic waveform of a native oscillator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    #[default]
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

/// Response type of a native biquad filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    #[default]
    Lowpass,
    Highpass,
    Bandpass,
    Notch,
}

/// The kind of primitive a native node is
#[derive(Debug, Clone, PartialEq)]
pub enum NativeKind {
    Oscillator { waveform: Waveform },
    Filter { filter_type: FilterType },
    Gain,
    Delay { max_delay: f64 },
    ConstantSource,
    WaveShaper { curve: Arc<[f32]> },
    Destination,
}

impl NativeKind {
    fn default_params(&self) -> BTreeMap<&'static str, AudioParam> {
        let mut params = BTreeMap::new();
        match self {
            NativeKind::Oscillator { .. } => {
                params.insert(param::FREQUENCY, AudioParam::new(440.0));
                params.insert(param::DETUNE, AudioParam::new(0.0));
            }
            NativeKind::Filter { .. } => {
                params.insert(param::FREQUENCY, AudioParam::new(350.0));
                params.insert(param::Q, AudioParam::new(1.0));
            }
            NativeKind::Gain => {
                params.insert(param::GAIN, AudioParam::new(1.0));
            }
            NativeKind::Delay { .. } => {
                params.insert(param::DELAY_TIME, AudioParam::new(0.0));
            }
            NativeKind::ConstantSource => {
                params.insert(param::OFFSET, AudioParam::new(1.0));
            }
            NativeKind::WaveShaper { .. } | NativeKind::Destination => {}
        }
        params
    }

    fn is_source(&self) -> bool {
        matches!(
            self,
            NativeKind::Oscillator { .. } | NativeKind::ConstantSource
        )
    }
}

/// Lifecycle of a generator source
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceState {
    Idle,
    Started(f64),
    Stopped(f64),
}

/// A native processing node
#[derive(Debug, Clone)]
pub struct NativeNode {
    pub kind: NativeKind,
    pub params: BTreeMap<&'static str, AudioParam>,
    pub source: SourceState,
}

/// Where a native edge lands: a node's signal input or one of its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeInput {
    Node(NativeId),
    Param(NativeId, &'static str),
}

impl NativeInput {
    pub fn node(&self) -> NativeId {
        match *self {
            NativeInput::Node(id) | NativeInput::Param(id, _) => id,
        }
    }
}

/// A signal route between native nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeEdge {
    pub from: NativeId,
    pub to: NativeInput,
}

/// The native audio layer
pub struct AudioContext {
    clock: Box<dyn Clock>,
    nodes: SlotMap<NativeId, NativeNode>,
    edges: Vec<NativeEdge>,
    destination: Option<NativeId>,
    features: NativeFeatures,
}

impl std::fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioContext")
            .field("nodes", &self.nodes)
            .field("edges", &self.edges)
            .field("destination", &self.destination)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

impl AudioContext {
    /// Create a context whose output destination is not yet available
    pub fn new(clock: impl Clock + 'static, features: NativeFeatures) -> Self {
        Self {
            clock: Box::new(clock),
            nodes: SlotMap::with_key(),
            edges: Vec::new(),
            destination: None,
            features,
        }
    }

    /// Bring up the output destination. Idempotent.
    pub fn initialize(&mut self) -> NativeId {
        if let Some(dest) = self.destination {
            return dest;
        }
        let dest = self.create(NativeKind::Destination);
        self.destination = Some(dest);
        tracing::debug!("audio context initialized");
        dest
    }

    pub fn is_initialized(&self) -> bool {
        self.destination.is_some()
    }

    /// The output destination, if the audio subsystem is up
    pub fn destination(&self) -> Option<NativeId> {
        self.destination
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn features(&self) -> NativeFeatures {
        self.features
    }

    pub fn create(&mut self, kind: NativeKind) -> NativeId {
        let params = kind.default_params();
        self.nodes.insert(NativeNode {
            kind,
            params,
            source: SourceState::Idle,
        })
    }

    pub fn create_oscillator(&mut self, waveform: Waveform) -> NativeId {
        self.create(NativeKind::Oscillator { waveform })
    }

    pub fn create_filter(&mut self, filter_type: FilterType) -> NativeId {
        self.create(NativeKind::Filter { filter_type })
    }

    pub fn create_gain(&mut self, gain: f64) -> NativeId {
        let id = self.create(NativeKind::Gain);
        self.set_intrinsic(id, param::GAIN, gain);
        id
    }

    pub fn create_delay(&mut self, max_delay: f64) -> NativeId {
        self.create(NativeKind::Delay { max_delay })
    }

    pub fn create_constant_source(&mut self, offset: f64) -> NativeId {
        let id = self.create(NativeKind::ConstantSource);
        self.set_intrinsic(id, param::OFFSET, offset);
        id
    }

    pub fn create_wave_shaper(&mut self, curve: Arc<[f32]>) -> NativeId {
        self.create(NativeKind::WaveShaper { curve })
    }

    pub fn node(&self, id: NativeId) -> Option<&NativeNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NativeId) -> Option<&mut NativeNode> {
        self.nodes.get_mut(id)
    }

    pub fn param(&self, id: NativeId, name: &str) -> Option<&AudioParam> {
        self.nodes.get(id).and_then(|n| n.params.get(name))
    }

    pub fn param_mut(&mut self, id: NativeId, name: &str) -> Option<&mut AudioParam> {
        self.nodes.get_mut(id).and_then(|n| n.params.get_mut(name))
    }

    /// Run `f` against a parameter, logging when it does not exist.
    ///
    /// Automation already behind the clock is folded first, so timelines stay
    /// bounded whether or not the transport is running.
    pub fn with_param(&mut self, id: NativeId, name: &str, f: impl FnOnce(&mut AudioParam)) {
        let now = self.now();
        match self.param_mut(id, name) {
            Some(p) => {
                p.prune(now);
                f(p)
            }
            None => tracing::warn!(param = name, "write to unknown native parameter ignored"),
        }
    }

    /// Replace a parameter's whole timeline with a constant
    pub fn set_intrinsic(&mut self, id: NativeId, name: &str, value: f64) {
        self.with_param(id, name, |p| *p = AudioParam::new(value));
    }

    /// Schedule an immediate value at the current clock time
    pub fn set_param_now(&mut self, id: NativeId, name: &str, value: f64) {
        let now = self.now();
        self.with_param(id, name, |p| p.set_value_at_time(value, now));
    }

    /// Ramp a parameter linearly from its current value over `duration` seconds
    pub fn ramp_param(&mut self, id: NativeId, name: &str, value: f64, duration: f64) {
        let now = self.now();
        self.with_param(id, name, |p| {
            let current = p.value_at(now);
            p.cancel_scheduled_values(now);
            p.set_value_at_time(current, now);
            p.linear_ramp_to_value_at_time(value, now + duration);
        });
    }

    pub fn connect(&mut self, from: NativeId, to: NativeInput) -> bool {
        if !self.nodes.contains_key(from) || !self.nodes.contains_key(to.node()) {
            tracing::warn!("native connect between released nodes ignored");
            return false;
        }
        if let NativeInput::Param(id, name) = to {
            if self.param(id, name).is_none() {
                tracing::warn!(param = name, "native connect to unknown parameter ignored");
                return false;
            }
        }
        let edge = NativeEdge { from, to };
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
        true
    }

    pub fn disconnect(&mut self, from: NativeId, to: NativeInput) -> bool {
        let before = self.edges.len();
        self.edges.retain(|e| !(e.from == from && e.to == to));
        self.edges.len() != before
    }

    /// Remove every outgoing edge of `from`
    pub fn disconnect_all(&mut self, from: NativeId) {
        self.edges.retain(|e| e.from != from);
    }

    pub fn is_connected(&self, from: NativeId, to: NativeInput) -> bool {
        self.edges.iter().any(|e| e.from == from && e.to == to)
    }

    pub fn edges(&self) -> &[NativeEdge] {
        &self.edges
    }

    pub fn start(&mut self, id: NativeId, when: f64) {
        if let Some(node) = self.nodes.get_mut(id) {
            if node.kind.is_source() && node.source == SourceState::Idle {
                node.source = SourceState::Started(when);
            }
        }
    }

    pub fn stop(&mut self, id: NativeId, when: f64) {
        if let Some(node) = self.nodes.get_mut(id) {
            if let SourceState::Started(_) = node.source {
                node.source = SourceState::Stopped(when);
            }
        }
    }

    /// Drop a node together with every edge touching it
    pub fn release(&mut self, id: NativeId) {
        if self.destination == Some(id) {
            return;
        }
        self.edges.retain(|e| e.from != id && e.to.node() != id);
        self.nodes.remove(id);
    }

    pub fn contains(&self, id: NativeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Live native nodes, excluding the destination
    pub fn live_node_count(&self) -> usize {
        self.nodes.len() - usize::from(self.destination.is_some())
    }

    /// Fold completed automation on every parameter
    pub fn prune_automation(&mut self, now: f64) {
        for node in self.nodes.values_mut() {
            for p in node.params.values_mut() {
                p.prune(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn context() -> (AudioContext, ManualClock) {
        let clock = ManualClock::new(0.0);
        let ctx = AudioContext::new(clock.clone(), NativeFeatures::default());
        (ctx, clock)
    }

    #[test]
    fn test_manual_clock_is_monotonic() {
        let clock = ManualClock::new(1.0);
        clock.set(0.5);
        assert_eq!(clock.now(), 1.0);
        clock.advance(0.25);
        assert_eq!(clock.now(), 1.25);
    }

    #[test]
    fn test_destination_is_lazy() {
        let (mut ctx, _) = context();
        assert!(ctx.destination().is_none());
        let dest = ctx.initialize();
        assert_eq!(ctx.destination(), Some(dest));
        assert_eq!(ctx.initialize(), dest);
        assert_eq!(ctx.live_node_count(), 0);
    }

    #[test]
    fn test_connect_and_release() {
        let (mut ctx, _) = context();
        let osc = ctx.create_oscillator(Waveform::Sine);
        let gain = ctx.create_gain(0.5);

        assert!(ctx.connect(osc, NativeInput::Node(gain)));
        assert!(ctx.connect(osc, NativeInput::Param(gain, param::GAIN)));
        assert!(!ctx.connect(osc, NativeInput::Param(gain, "bogus")));
        assert_eq!(ctx.edges().len(), 2);

        ctx.release(gain);
        assert!(ctx.edges().is_empty());
        assert!(!ctx.contains(gain));
    }

    #[test]
    fn test_duplicate_native_edges_collapse() {
        let (mut ctx, _) = context();
        let a = ctx.create_gain(1.0);
        let b = ctx.create_gain(1.0);
        ctx.connect(a, NativeInput::Node(b));
        ctx.connect(a, NativeInput::Node(b));
        assert_eq!(ctx.edges().len(), 1);
        assert!(ctx.disconnect(a, NativeInput::Node(b)));
        assert!(!ctx.disconnect(a, NativeInput::Node(b)));
    }

    #[test]
    fn test_source_lifecycle() {
        let (mut ctx, _) = context();
        let src = ctx.create_constant_source(0.0);
        ctx.start(src, 0.0);
        ctx.stop(src, 1.0);
        assert_eq!(ctx.node(src).map(|n| n.source), Some(SourceState::Stopped(1.0)));
    }

    #[test]
    fn test_ramp_param_from_current_value() {
        let (mut ctx, clock) = context();
        let gain = ctx.create_gain(0.0);
        clock.set(1.0);
        ctx.ramp_param(gain, param::GAIN, 1.0, 0.05);
        let p = ctx.param(gain, param::GAIN).map(|p| p.value_at(1.025));
        assert_abs_diff_eq!(p.unwrap_or_default(), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_writes_fold_elapsed_automation() {
        let (mut ctx, clock) = context();
        let gain = ctx.create_gain(0.0);
        for i in 0..1000 {
            clock.advance(0.01);
            ctx.ramp_param(gain, param::GAIN, f64::from(i % 2), 0.005);
        }
        let pending = ctx.param(gain, param::GAIN).map(|p| p.events().len());
        assert!(pending.unwrap_or_default() <= 2, "{pending:?}");

        let now = ctx.now();
        let value = ctx.param(gain, param::GAIN).map(|p| p.value_at(now + 0.005));
        assert_abs_diff_eq!(value.unwrap_or_default(), 1.0, epsilon = 1e-9);
    }
}
