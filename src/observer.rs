//! Engine-to-UI event bridge
//!
//! Nodes never call into a presentation layer. They publish events into a
//! shared queue that the UI drains at its own pace (polling, like an
//! animation-frame loop). The queue is bounded; when full the oldest events
//! are dropped.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Default bound on undrained events
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Observable sequencer activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SequencerEvent {
    /// A step was scheduled to play at `time`
    Step {
        module_id: String,
        step: usize,
        time: f64,
    },

    /// The sequencer was force-released by a transport stop
    Released { module_id: String, time: f64 },
}

impl SequencerEvent {
    pub fn module_id(&self) -> &str {
        match self {
            SequencerEvent::Step { module_id, .. } | SequencerEvent::Released { module_id, .. } => {
                module_id
            }
        }
    }
}

#[derive(Debug)]
struct Queue {
    events: VecDeque<SequencerEvent>,
    max_pending: usize,
}

/// Shared, bounded event queue; clones publish into the same queue
#[derive(Debug, Clone)]
pub struct EventQueue {
    inner: Rc<RefCell<Queue>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_PENDING)
    }

    pub fn with_capacity(max_pending: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Queue {
                events: VecDeque::new(),
                max_pending: max_pending.max(1),
            })),
        }
    }

    pub fn publish(&self, event: SequencerEvent) {
        let mut queue = self.inner.borrow_mut();
        queue.events.push_back(event);
        while queue.events.len() > queue.max_pending {
            queue.events.pop_front();
        }
    }

    /// Take every pending event, oldest first
    pub fn drain(&self) -> Vec<SequencerEvent> {
        self.inner.borrow_mut().events.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.borrow().events.len()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(n: usize) -> SequencerEvent {
        SequencerEvent::Step {
            module_id: "seq".into(),
            step: n,
            time: n as f64,
        }
    }

    #[test]
    fn test_publish_and_drain() {
        let queue = EventQueue::new();
        let publisher = queue.clone();
        publisher.publish(step(0));
        publisher.publish(step(1));

        assert_eq!(queue.pending_count(), 2);
        let events = queue.drain();
        assert_eq!(events, vec![step(0), step(1)]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_oldest_dropped_when_full() {
        let queue = EventQueue::with_capacity(2);
        queue.publish(step(0));
        queue.publish(step(1));
        queue.publish(step(2));
        assert_eq!(queue.drain(), vec![step(1), step(2)]);
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(step(3)).unwrap();
        assert_eq!(json["type"], "step");
        assert_eq!(json["module_id"], "seq");
        assert_eq!(step(3).module_id(), "seq");
    }
}
