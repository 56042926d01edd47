use super::keyboard::note_cv;
use super::{
    clamp_or, mismatch, GateTargets, ModularNode, ModuleHandle, ModuleKind, ModuleState,
    StateError,
};
use crate::context::{param, AudioContext, NativeId};
use crate::observer::{EventQueue, SequencerEvent};
use crate::port::{AudioEndpoint, DEFAULT_PORT, GATE_PORT};
use crate::transport::{StopEvent, SubscriptionId, Subscriptions, Tick};
use serde::{Deserialize, Serialize};
use std::rc::Rc;

/// Longest pattern a sequencer holds
pub const MAX_PATTERN_LENGTH: usize = 64;

const DEFAULT_PATTERN_LENGTH: usize = 16;

/// One pattern step
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Step {
    /// MIDI note, unset when `None`
    pub note: Option<u8>,
    /// 0..=1, full velocity when `None`
    pub velocity: Option<f64>,
    pub gate: bool,
}

impl Step {
    pub fn note(note: u8) -> Self {
        Self {
            note: Some(note.min(127)),
            velocity: None,
            gate: true,
        }
    }
}

/// An ordered list of steps; length is always within 1..=64
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    steps: Vec<Step>,
}

impl Pattern {
    pub fn new(length: usize) -> Self {
        let mut pattern = Self { steps: Vec::new() };
        pattern.set_length(length);
        pattern
    }

    pub fn from_steps(steps: Vec<Step>, length: usize) -> Self {
        let mut pattern = Self { steps };
        pattern.set_length(length);
        pattern
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Resize, keeping the steps below the new length
    pub fn set_length(&mut self, length: usize) {
        let length = length.clamp(1, MAX_PATTERN_LENGTH);
        self.steps.resize(length, Step::default());
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn set_step(&mut self, index: usize, step: Step) -> bool {
        match self.steps.get_mut(index) {
            Some(slot) => {
                *slot = step;
                true
            }
            None => false,
        }
    }
}

impl Default for Pattern {
    fn default() -> Self {
        Self::new(DEFAULT_PATTERN_LENGTH)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SequencerState {
    pub length: usize,
    pub steps: Vec<Step>,
    pub octave: i32,
    /// Fraction of a tick the gate stays open
    pub gate_length: f64,
}

impl Default for SequencerState {
    fn default() -> Self {
        Self {
            length: DEFAULT_PATTERN_LENGTH,
            steps: vec![Step::default(); DEFAULT_PATTERN_LENGTH],
            octave: 0,
            gate_length: 0.5,
        }
    }
}

#[derive(Debug)]
struct Attachment {
    module_id: String,
    subscriptions: Subscriptions,
    tick: SubscriptionId,
    stop: SubscriptionId,
    events: EventQueue,
}

/// Step Sequencer
///
/// Driven by transport ticks. Each tick plays `index mod length`: note CV and
/// a velocity-valued gate are scheduled at the tick's exact time, and gate
/// listeners are notified of both edges.
#[derive(Debug)]
pub struct Sequencer {
    note: NativeId,
    gate: NativeId,
    pattern: Pattern,
    octave: i32,
    gate_length: f64,
    current_step: Option<usize>,
    targets: GateTargets,
    attachment: Option<Attachment>,
}

impl Sequencer {
    pub fn new(ctx: &mut AudioContext) -> Self {
        let note = ctx.create_constant_source(0.0);
        let gate = ctx.create_constant_source(0.0);
        let now = ctx.now();
        ctx.start(note, now);
        ctx.start(gate, now);
        let defaults = SequencerState::default();
        Self {
            note,
            gate,
            pattern: Pattern::new(defaults.length),
            octave: defaults.octave,
            gate_length: defaults.gate_length,
            current_step: None,
            targets: GateTargets::default(),
            attachment: None,
        }
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn set_pattern_length(&mut self, length: usize) {
        self.pattern.set_length(length);
    }

    pub fn set_step(&mut self, index: usize, step: Step) -> bool {
        self.pattern.set_step(index, step)
    }

    pub fn toggle_step(&mut self, index: usize) -> bool {
        match self.pattern.step(index).copied() {
            Some(step) => self.pattern.set_step(
                index,
                Step {
                    gate: !step.gate,
                    ..step
                },
            ),
            None => false,
        }
    }

    pub fn set_octave(&mut self, octave: i32) {
        self.octave = octave.clamp(-2, 3);
    }

    pub fn set_gate_length(&mut self, fraction: f64) {
        self.gate_length = clamp_or(fraction, 0.01, 1.0, self.gate_length);
    }

    /// The step played by the most recent tick
    pub fn current_step(&self) -> Option<usize> {
        self.current_step
    }

    pub fn gate_targets(&self) -> &GateTargets {
        &self.targets
    }

    pub fn gate_targets_mut(&mut self) -> &mut GateTargets {
        &mut self.targets
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    /// Schedule the step for `tick`. Returns the step index played.
    pub fn on_tick(&mut self, ctx: &mut AudioContext, tick: &Tick) -> usize {
        let index = (tick.index % self.pattern.len() as u64) as usize;
        self.current_step = Some(index);
        let step = self.pattern.step(index).copied().unwrap_or_default();

        match step.note.filter(|_| step.gate) {
            Some(note) => {
                let midi = (i32::from(note) + self.octave * 12).clamp(0, 127) as u8;
                let velocity = clamp_or(step.velocity.unwrap_or(1.0), 0.0, 1.0, 1.0);
                let off = tick.time + self.gate_length * tick.seconds_per_tick;

                ctx.with_param(self.note, param::OFFSET, |p| {
                    p.set_value_at_time(note_cv(midi), tick.time)
                });
                ctx.with_param(self.gate, param::OFFSET, |p| {
                    p.set_value_at_time(velocity, tick.time);
                    p.set_value_at_time(0.0, off);
                });
                self.targets.notify(ctx, true, tick.time);
                self.targets.notify(ctx, false, off);
            }
            None => {
                ctx.with_param(self.gate, param::OFFSET, |p| {
                    p.set_value_at_time(0.0, tick.time)
                });
            }
        }

        if let Some(attachment) = &self.attachment {
            attachment.events.publish(SequencerEvent::Step {
                module_id: attachment.module_id.clone(),
                step: index,
                time: tick.time,
            });
        }
        index
    }

    /// Drop everything scheduled from `event.time` on and close every gate
    pub fn on_stop(&mut self, ctx: &mut AudioContext, event: &StopEvent) {
        for id in [self.note, self.gate] {
            ctx.with_param(id, param::OFFSET, |p| p.cancel_scheduled_values(event.time));
        }
        ctx.with_param(self.gate, param::OFFSET, |p| {
            p.set_value_at_time(0.0, event.time)
        });
        self.targets.notify(ctx, false, event.time);
        self.current_step = None;

        if let Some(attachment) = &self.attachment {
            attachment.events.publish(SequencerEvent::Released {
                module_id: attachment.module_id.clone(),
                time: event.time,
            });
        }
    }

    fn detach(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            attachment.subscriptions.unsubscribe(attachment.tick);
            attachment.subscriptions.unsubscribe(attachment.stop);
        }
    }
}

/// Subscribe a sequencer handle to transport ticks and stops. The listeners
/// hold the module weakly; destroying the sequencer unsubscribes them.
pub fn attach_to_transport(
    handle: &ModuleHandle,
    module_id: &str,
    subscriptions: &Subscriptions,
    events: &EventQueue,
) -> bool {
    let weak = Rc::downgrade(handle);
    let tick = subscriptions.on_tick(move |ctx, tick| {
        if let Some(module) = weak.upgrade() {
            let mut module = module.try_borrow_mut()?;
            if let Some(seq) = module.as_sequencer_mut() {
                seq.on_tick(ctx, tick);
            }
        }
        Ok(())
    });

    let weak = Rc::downgrade(handle);
    let stop = subscriptions.on_stop(move |ctx, event| {
        if let Some(module) = weak.upgrade() {
            let mut module = module.try_borrow_mut()?;
            if let Some(seq) = module.as_sequencer_mut() {
                seq.on_stop(ctx, event);
            }
        }
        Ok(())
    });

    let mut module = handle.borrow_mut();
    match module.as_sequencer_mut() {
        Some(seq) => {
            seq.detach();
            seq.attachment = Some(Attachment {
                module_id: module_id.to_string(),
                subscriptions: subscriptions.clone(),
                tick,
                stop,
                events: events.clone(),
            });
            true
        }
        None => {
            subscriptions.unsubscribe(tick);
            subscriptions.unsubscribe(stop);
            false
        }
    }
}

impl ModularNode for Sequencer {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Sequencer
    }

    fn input_port(&self, _ctx: &AudioContext) -> Option<AudioEndpoint> {
        None
    }

    fn output_port(&self) -> Option<AudioEndpoint> {
        Some(AudioEndpoint(self.note))
    }

    fn output(&self, port: &str) -> Option<NativeId> {
        match port {
            DEFAULT_PORT => Some(self.note),
            GATE_PORT => Some(self.gate),
            _ => None,
        }
    }

    fn state(&self) -> ModuleState {
        ModuleState::Sequencer(SequencerState {
            length: self.pattern.len(),
            steps: self.pattern.steps().to_vec(),
            octave: self.octave,
            gate_length: self.gate_length,
        })
    }

    fn set_state(&mut self, _ctx: &mut AudioContext, state: ModuleState) -> Result<(), StateError> {
        let ModuleState::Sequencer(state) = state else {
            return Err(mismatch(ModuleKind::Sequencer, &state));
        };
        let steps = state
            .steps
            .into_iter()
            .map(|s| Step {
                note: s.note.map(|n| n.min(127)),
                velocity: s.velocity.map(|v| clamp_or(v, 0.0, 1.0, 1.0)),
                gate: s.gate,
            })
            .collect();
        self.pattern = Pattern::from_steps(steps, state.length);
        self.set_octave(state.octave);
        self.set_gate_length(state.gate_length);
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut AudioContext) {
        self.detach();
        self.targets.clear();
        let now = ctx.now();
        for id in [self.note, self.gate] {
            ctx.stop(id, now);
            ctx.release(id);
        }
    }
}
