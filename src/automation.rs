//! Parameter Automation Timeline
//!
//! Every native parameter carries a timeline of scheduled value changes.
//! Writes are fire-and-forget: the control plane schedules events against the
//! audio clock and the native renderer evaluates them independently. The
//! timeline here is the bookkeeping half of that contract, so the scheduled
//! curve can be evaluated at any time with [`AudioParam::value_at`].

use libm::Libm;
use serde::{Deserialize, Serialize};

/// A scheduled change on a parameter timeline
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AutomationEvent {
    /// Jump to `value` at `time`
    SetValue { time: f64, value: f64 },

    /// Ramp linearly from the previous event's value, arriving at `value` at `time`
    LinearRampTo { time: f64, value: f64 },

    /// Approach `target` exponentially from `time` on, with the given time constant
    SetTarget {
        time: f64,
        target: f64,
        time_constant: f64,
    },
}

impl AutomationEvent {
    /// The time that orders this event on the timeline
    pub fn time(&self) -> f64 {
        match *self {
            AutomationEvent::SetValue { time, .. }
            | AutomationEvent::LinearRampTo { time, .. }
            | AutomationEvent::SetTarget { time, .. } => time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Anchor {
    time: f64,
    value: f64,
}

fn approach(from: f64, target: f64, elapsed: f64, time_constant: f64) -> f64 {
    if time_constant <= 0.0 {
        return target;
    }
    target + (from - target) * Libm::<f64>::exp(-elapsed / time_constant)
}

/// A native parameter with its automation timeline
#[derive(Debug, Clone)]
pub struct AudioParam {
    anchor: Anchor,
    events: Vec<AutomationEvent>,
}

impl AudioParam {
    pub fn new(value: f64) -> Self {
        Self {
            anchor: Anchor {
                time: f64::NEG_INFINITY,
                value,
            },
            events: Vec::new(),
        }
    }

    /// Scheduled events, ordered by time
    pub fn events(&self) -> &[AutomationEvent] {
        &self.events
    }

    /// Number of events scheduled strictly after `time`
    pub fn pending_after(&self, time: f64) -> usize {
        self.events.iter().filter(|e| e.time() > time).count()
    }

    fn insert(&mut self, event: AutomationEvent) {
        let time = event.time();
        let at = self
            .events
            .iter()
            .position(|e| e.time() > time)
            .unwrap_or(self.events.len());
        self.events.insert(at, event);
    }

    pub fn set_value_at_time(&mut self, value: f64, time: f64) {
        self.insert(AutomationEvent::SetValue { time, value });
    }

    /// Ramp from the previous event's value and time, arriving at `value` at
    /// `time`. A ramp with no earlier event holds the intrinsic value until
    /// `time`, so schedule a set-value first to pin the start.
    pub fn linear_ramp_to_value_at_time(&mut self, value: f64, time: f64) {
        self.insert(AutomationEvent::LinearRampTo { time, value });
    }

    pub fn set_target_at_time(&mut self, target: f64, time: f64, time_constant: f64) {
        self.insert(AutomationEvent::SetTarget {
            time,
            target,
            time_constant,
        });
    }

    /// Drop every event at or after `time`
    pub fn cancel_scheduled_values(&mut self, time: f64) {
        self.events.retain(|e| e.time() < time);
    }

    /// Freeze the curve at `time`: everything after is dropped and the value
    /// the curve had at `time` is pinned there.
    pub fn cancel_and_hold_at_time(&mut self, time: f64) {
        let held = self.value_at(time);
        self.cancel_scheduled_values(time);
        self.set_value_at_time(held, time);
    }

    /// Evaluate the scheduled curve at `t`
    pub fn value_at(&self, t: f64) -> f64 {
        let mut anchor = self.anchor;

        for (i, event) in self.events.iter().enumerate() {
            match *event {
                AutomationEvent::SetValue { time, value } => {
                    if time > t {
                        return anchor.value;
                    }
                    anchor = Anchor { time, value };
                }
                AutomationEvent::LinearRampTo { time, value } => {
                    if time > t {
                        if t <= anchor.time || !anchor.time.is_finite() {
                            return anchor.value;
                        }
                        let frac = (t - anchor.time) / (time - anchor.time);
                        return anchor.value + (value - anchor.value) * frac;
                    }
                    anchor = Anchor { time, value };
                }
                AutomationEvent::SetTarget {
                    time,
                    target,
                    time_constant,
                } => {
                    if time > t {
                        return anchor.value;
                    }
                    if let Some(AutomationEvent::LinearRampTo { .. }) = self.events.get(i + 1) {
                        // The ramp takes over from where the approach starts
                        anchor = Anchor {
                            time,
                            value: anchor.value,
                        };
                        continue;
                    }
                    match self.events.get(i + 1).map(|e| e.time()) {
                        Some(next) if next <= t => {
                            anchor = Anchor {
                                time: next,
                                value: approach(anchor.value, target, next - time, time_constant),
                            };
                        }
                        _ => return approach(anchor.value, target, t - time, time_constant),
                    }
                }
            }
        }

        anchor.value
    }

    /// Fold events that can no longer influence the curve after `now` into
    /// the starting anchor.
    pub fn prune(&mut self, now: f64) {
        loop {
            let Some(first) = self.events.first().copied() else {
                return;
            };
            match first {
                AutomationEvent::SetValue { time, value }
                | AutomationEvent::LinearRampTo { time, value } => {
                    if time > now {
                        return;
                    }
                    self.anchor = Anchor { time, value };
                }
                AutomationEvent::SetTarget {
                    time,
                    target,
                    time_constant,
                } => {
                    self.anchor = match self.events.get(1) {
                        Some(AutomationEvent::LinearRampTo { .. }) if time <= now => Anchor {
                            time,
                            value: self.anchor.value,
                        },
                        Some(e) if e.time() <= now => Anchor {
                            time: e.time(),
                            value: approach(self.anchor.value, target, e.time() - time, time_constant),
                        },
                        _ => return,
                    };
                }
            }
            self.events.remove(0);
        }
    }
}

impl Default for AudioParam {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_intrinsic_value_without_events() {
        let param = AudioParam::new(0.5);
        assert_abs_diff_eq!(param.value_at(10.0), 0.5);
    }

    #[test]
    fn test_set_value_at_time() {
        let mut param = AudioParam::new(0.0);
        param.set_value_at_time(1.0, 2.0);
        assert_abs_diff_eq!(param.value_at(1.999), 0.0);
        assert_abs_diff_eq!(param.value_at(2.0), 1.0);
    }

    #[test]
    fn test_linear_ramp() {
        let mut param = AudioParam::new(0.0);
        param.set_value_at_time(0.0, 1.0);
        param.linear_ramp_to_value_at_time(1.0, 2.0);
        assert_abs_diff_eq!(param.value_at(1.5), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(param.value_at(3.0), 1.0);
    }

    #[test]
    fn test_set_target_approaches_exponentially() {
        let mut param = AudioParam::new(1.0);
        param.set_value_at_time(1.0, 0.0);
        param.set_target_at_time(0.0, 0.0, 0.5);
        let one_tau = param.value_at(0.5);
        assert_abs_diff_eq!(one_tau, (-1.0f64).exp(), epsilon = 1e-9);
        assert!(param.value_at(5.0) < 1e-4);
    }

    #[test]
    fn test_set_target_is_interrupted_by_next_event() {
        let mut param = AudioParam::new(1.0);
        param.set_target_at_time(0.0, 0.0, 1.0);
        param.set_value_at_time(0.25, 1.0);
        assert_abs_diff_eq!(param.value_at(2.0), 0.25);
    }

    #[test]
    fn test_cancel_scheduled_values() {
        let mut param = AudioParam::new(0.0);
        param.set_value_at_time(1.0, 1.0);
        param.set_value_at_time(2.0, 2.0);
        param.cancel_scheduled_values(1.5);
        assert_eq!(param.events().len(), 1);
        assert_abs_diff_eq!(param.value_at(3.0), 1.0);
    }

    #[test]
    fn test_cancel_and_hold_freezes_ramp() {
        let mut param = AudioParam::new(0.0);
        param.set_value_at_time(0.0, 0.0);
        param.linear_ramp_to_value_at_time(1.0, 1.0);
        param.cancel_and_hold_at_time(0.25);
        assert_abs_diff_eq!(param.value_at(0.25), 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(param.value_at(0.9), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_prune_keeps_curve_after_now() {
        let mut param = AudioParam::new(0.0);
        param.set_value_at_time(1.0, 0.0);
        param.set_target_at_time(0.0, 0.5, 0.2);
        param.set_value_at_time(0.3, 1.0);
        param.linear_ramp_to_value_at_time(0.9, 2.0);

        let before = param.value_at(1.5);
        param.prune(1.2);
        assert_eq!(param.events().len(), 1);
        assert_abs_diff_eq!(param.value_at(1.5), before, epsilon = 1e-12);
    }

    #[test]
    fn test_ramp_after_set_target_starts_at_its_start() {
        let mut param = AudioParam::new(0.0);
        param.set_value_at_time(1.0, 0.0);
        param.set_target_at_time(0.0, 1.0, 0.1);
        param.linear_ramp_to_value_at_time(2.0, 3.0);

        assert_abs_diff_eq!(param.value_at(0.0), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(param.value_at(1.5), 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(param.value_at(3.0), 2.0, epsilon = 1e-12);

        param.prune(1.5);
        assert_eq!(param.events().len(), 1);
        assert_abs_diff_eq!(param.value_at(1.5), 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(param.value_at(2.25), 1.75, epsilon = 1e-12);
    }

    #[test]
    fn test_ramp_without_earlier_event_holds_until_its_time() {
        let mut param = AudioParam::new(0.25);
        param.linear_ramp_to_value_at_time(1.0, 2.0);
        assert_abs_diff_eq!(param.value_at(1.0), 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(param.value_at(2.0), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_events_stay_ordered() {
        let mut param = AudioParam::new(0.0);
        param.set_value_at_time(3.0, 3.0);
        param.set_value_at_time(1.0, 1.0);
        param.set_value_at_time(2.0, 2.0);
        let times: Vec<f64> = param.events().iter().map(|e| e.time()).collect();
        assert_eq!(times, vec![1.0, 2.0, 3.0]);
        assert_eq!(param.pending_after(1.5), 2);
    }
}
