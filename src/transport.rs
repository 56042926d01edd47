//! Transport: the lookahead tick scheduler
//!
//! The transport never fires events "now". Each scheduling pass (run every
//! `scheduler_interval` of wall-clock time) emits every tick whose time falls
//! inside the `schedule_ahead` window, stamped with its exact audio-clock
//! time. Listeners schedule native automation against those stamps, so timer
//! jitter in the pass itself never reaches the audio.
//!
//! Everything runs on one cooperative thread. Listeners are invoked
//! synchronously from a snapshot of the registry, so a listener may
//! unsubscribe itself or others mid-dispatch.

use crate::context::AudioContext;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

/// Error type listeners may return; it is logged and never propagated
pub type ListenerError = Box<dyn std::error::Error>;

/// Result of a listener invocation
pub type ListenerResult = Result<(), ListenerError>;

type TickCallback = dyn FnMut(&mut AudioContext, &Tick) -> ListenerResult;
type StopCallback = dyn FnMut(&mut AudioContext, &StopEvent) -> ListenerResult;

pub const MIN_BPM: f64 = 20.0;
pub const MAX_BPM: f64 = 300.0;
pub const MIN_TICKS_PER_BEAT: u32 = 1;
pub const MAX_TICKS_PER_BEAT: u32 = 16;

/// Smallest gap enforced between two emitted ticks
const MIN_TICK_SPACING: f64 = 1e-4;

/// A scheduled musical tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub index: u64,
    /// Absolute audio-clock time of the tick, swing included
    pub time: f64,
    pub seconds_per_tick: f64,
}

/// Emitted when the transport stops
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopEvent {
    pub time: f64,
}

/// Transport configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub bpm: f64,
    pub ticks_per_beat: u32,
    /// 0.5 is straight time; odd ticks shift by `(swing - 0.5) * seconds_per_tick`
    pub swing: f64,
    /// Wall-clock period of the scheduling pass (seconds)
    pub scheduler_interval: f64,
    /// Lookahead window (seconds)
    pub schedule_ahead: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            ticks_per_beat: 4,
            swing: 0.5,
            scheduler_interval: 0.025,
            schedule_ahead: 0.1,
        }
    }
}

impl TransportConfig {
    /// Clamp every field into its legal range
    pub fn clamped(self) -> Self {
        Self {
            bpm: clamp_bpm(self.bpm),
            ticks_per_beat: self.ticks_per_beat.clamp(MIN_TICKS_PER_BEAT, MAX_TICKS_PER_BEAT),
            swing: clamp_unit(self.swing),
            scheduler_interval: self.scheduler_interval.max(0.001),
            schedule_ahead: self.schedule_ahead.max(0.0),
        }
    }
}

fn clamp_bpm(bpm: f64) -> f64 {
    if bpm.is_nan() {
        return TransportConfig::default().bpm;
    }
    bpm.clamp(MIN_BPM, MAX_BPM)
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.5;
    }
    value.clamp(0.0, 1.0)
}

/// Handle identifying a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    ticks: Vec<(SubscriptionId, Rc<RefCell<Box<TickCallback>>>)>,
    stops: Vec<(SubscriptionId, Rc<RefCell<Box<StopCallback>>>)>,
}

impl Registry {
    fn allocate(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }
}

/// Shared handle to the transport's listener registry
#[derive(Clone, Default)]
pub struct Subscriptions {
    registry: Rc<RefCell<Registry>>,
}

impl std::fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriptions")
            .field("ticks", &self.tick_listener_count())
            .field("stops", &self.stop_listener_count())
            .finish()
    }
}

impl Subscriptions {
    pub fn on_tick(
        &self,
        listener: impl FnMut(&mut AudioContext, &Tick) -> ListenerResult + 'static,
    ) -> SubscriptionId {
        let mut registry = self.registry.borrow_mut();
        let id = registry.allocate();
        let callback: Box<TickCallback> = Box::new(listener);
        registry.ticks.push((id, Rc::new(RefCell::new(callback))));
        id
    }

    pub fn on_stop(
        &self,
        listener: impl FnMut(&mut AudioContext, &StopEvent) -> ListenerResult + 'static,
    ) -> SubscriptionId {
        let mut registry = self.registry.borrow_mut();
        let id = registry.allocate();
        let callback: Box<StopCallback> = Box::new(listener);
        registry.stops.push((id, Rc::new(RefCell::new(callback))));
        id
    }

    /// Remove a tick or stop listener. Returns whether anything was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.borrow_mut();
        let before = registry.ticks.len() + registry.stops.len();
        registry.ticks.retain(|(i, _)| *i != id);
        registry.stops.retain(|(i, _)| *i != id);
        before != registry.ticks.len() + registry.stops.len()
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        let registry = self.registry.borrow();
        registry.ticks.iter().any(|(i, _)| *i == id) || registry.stops.iter().any(|(i, _)| *i == id)
    }

    pub fn tick_listener_count(&self) -> usize {
        self.registry.borrow().ticks.len()
    }

    pub fn stop_listener_count(&self) -> usize {
        self.registry.borrow().stops.len()
    }

    fn dispatch_tick(&self, ctx: &mut AudioContext, tick: &Tick) {
        let snapshot = self.registry.borrow().ticks.clone();
        for (id, listener) in snapshot {
            if !self.is_subscribed(id) {
                continue;
            }
            let Ok(mut callback) = listener.try_borrow_mut() else {
                tracing::warn!(listener = ?id, "re-entrant tick dispatch skipped");
                continue;
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| (callback)(ctx, tick)));
            report(id, "tick", outcome);
        }
    }

    fn dispatch_stop(&self, ctx: &mut AudioContext, event: &StopEvent) {
        let snapshot = self.registry.borrow().stops.clone();
        for (id, listener) in snapshot {
            if !self.is_subscribed(id) {
                continue;
            }
            let Ok(mut callback) = listener.try_borrow_mut() else {
                tracing::warn!(listener = ?id, "re-entrant stop dispatch skipped");
                continue;
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| (callback)(ctx, event)));
            report(id, "stop", outcome);
        }
    }
}

fn report(id: SubscriptionId, what: &str, outcome: std::thread::Result<ListenerResult>) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(listener = ?id, error = %err, "{what} listener failed"),
        Err(_) => tracing::warn!(listener = ?id, "{what} listener panicked"),
    }
}

/// The global musical clock
#[derive(Debug)]
pub struct Transport {
    config: TransportConfig,
    playing: bool,
    tick_index: u64,
    next_tick_time: f64,
    last_tick_time: Option<f64>,
    last_pass_time: f64,
    subscriptions: Subscriptions,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config: config.clamped(),
            playing: false,
            tick_index: 0,
            next_tick_time: 0.0,
            last_tick_time: None,
            last_pass_time: f64::NEG_INFINITY,
            subscriptions: Subscriptions::default(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn bpm(&self) -> f64 {
        self.config.bpm
    }

    pub fn ticks_per_beat(&self) -> u32 {
        self.config.ticks_per_beat
    }

    pub fn swing(&self) -> f64 {
        self.config.swing
    }

    pub fn seconds_per_tick(&self) -> f64 {
        60.0 / (self.config.bpm * self.config.ticks_per_beat as f64)
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Index of the next tick to be scheduled
    pub fn tick_index(&self) -> u64 {
        self.tick_index
    }

    pub fn next_tick_time(&self) -> f64 {
        self.next_tick_time
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    pub fn on_tick(
        &self,
        listener: impl FnMut(&mut AudioContext, &Tick) -> ListenerResult + 'static,
    ) -> SubscriptionId {
        self.subscriptions.on_tick(listener)
    }

    pub fn on_stop(
        &self,
        listener: impl FnMut(&mut AudioContext, &StopEvent) -> ListenerResult + 'static,
    ) -> SubscriptionId {
        self.subscriptions.on_stop(listener)
    }

    pub fn set_bpm(&mut self, ctx: &AudioContext, bpm: f64) {
        let old = self.seconds_per_tick();
        self.config.bpm = clamp_bpm(bpm);
        self.retime(ctx, old);
        tracing::debug!(bpm = self.config.bpm, "tempo changed");
    }

    pub fn set_ticks_per_beat(&mut self, ctx: &AudioContext, ticks_per_beat: u32) {
        let old = self.seconds_per_tick();
        self.config.ticks_per_beat = ticks_per_beat.clamp(MIN_TICKS_PER_BEAT, MAX_TICKS_PER_BEAT);
        self.retime(ctx, old);
    }

    pub fn set_swing(&mut self, swing: f64) {
        self.config.swing = clamp_unit(swing);
    }

    /// Keep the fractional phase within the current tick interval when the
    /// tick length changes, so the next tick never jumps.
    fn retime(&mut self, ctx: &AudioContext, old_seconds_per_tick: f64) {
        if !self.playing {
            return;
        }
        let new_seconds_per_tick = self.seconds_per_tick();
        let now = ctx.now();
        let interval_start = self.next_tick_time - old_seconds_per_tick;
        let phase = ((now - interval_start) / old_seconds_per_tick).clamp(0.0, 1.0);
        self.next_tick_time = now.max(interval_start) + (1.0 - phase) * new_seconds_per_tick;
    }

    pub fn play(&mut self, ctx: &mut AudioContext) {
        if self.playing {
            return;
        }
        self.playing = true;
        self.tick_index = 0;
        self.next_tick_time = ctx.now();
        self.last_tick_time = None;
        tracing::debug!(bpm = self.config.bpm, at = self.next_tick_time, "transport started");
        self.run_pass(ctx);
    }

    /// Halt scheduling and notify stop listeners so they can release
    /// anything still gated.
    pub fn stop(&mut self, ctx: &mut AudioContext) {
        self.playing = false;
        let event = StopEvent { time: ctx.now() };
        self.subscriptions.dispatch_stop(ctx, &event);
        self.tick_index = 0;
        self.last_tick_time = None;
        tracing::debug!(at = event.time, "transport stopped");
    }

    /// Run a scheduling pass if one is due. Returns the number of ticks fired.
    pub fn pump(&mut self, ctx: &mut AudioContext) -> usize {
        if !self.playing {
            return 0;
        }
        if ctx.now() - self.last_pass_time + 1e-9 < self.config.scheduler_interval {
            return 0;
        }
        self.run_pass(ctx)
    }

    /// Emit every tick inside the lookahead window. Returns the number fired.
    pub fn run_pass(&mut self, ctx: &mut AudioContext) -> usize {
        if !self.playing {
            return 0;
        }
        let now = ctx.now();
        let horizon = now + self.config.schedule_ahead;
        let mut fired = 0;

        while self.next_tick_time < horizon {
            let seconds_per_tick = self.seconds_per_tick();
            let mut time = self.next_tick_time;
            if self.tick_index % 2 == 1 && (self.config.swing - 0.5).abs() > f64::EPSILON {
                time += (self.config.swing - 0.5) * seconds_per_tick;
            }
            if let Some(last) = self.last_tick_time {
                if time <= last {
                    time = last + MIN_TICK_SPACING;
                }
            }

            let tick = Tick {
                index: self.tick_index,
                time,
                seconds_per_tick,
            };
            tracing::trace!(index = tick.index, time = tick.time, "tick");
            self.subscriptions.dispatch_tick(ctx, &tick);

            self.last_tick_time = Some(time);
            self.tick_index += 1;
            self.next_tick_time += seconds_per_tick;
            fired += 1;
        }

        self.last_pass_time = now;
        ctx.prune_automation(now);
        fired
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}
