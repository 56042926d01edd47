//! Signal Conventions and Port System
//!
//! Ports are typed by transport kind. Audio and CV ports are routed through
//! the native primitive graph; gate ports never are: a gate connection
//! registers the target as a listener on the source and transitions are
//! delivered by direct call.

use crate::context::{NativeId, NativeInput};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Port id used when a connection omits one
pub const DEFAULT_PORT: &str = "audio";

/// Gate port id on sources and listeners
pub const GATE_PORT: &str = "gate";

/// Transport kind of a port (and of the connections landing on it)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    /// Audible signal
    Audio,

    /// Continuously varying control voltage
    Cv,

    /// Binary on/off transitions, delivered by notification
    Gate,
}

impl PortKind {
    /// Whether the connection travels through the native signal graph
    pub fn is_routed(&self) -> bool {
        !matches!(self, PortKind::Gate)
    }

    /// Resolve the kind of a connection from `source` into `target`
    pub fn connection_kind(source: PortKind, target: PortKind) -> Option<PortKind> {
        match (source, target) {
            (PortKind::Gate, PortKind::Gate) => Some(PortKind::Gate),
            (_, PortKind::Gate) => None,
            (PortKind::Gate, PortKind::Cv) => Some(PortKind::Cv),
            (PortKind::Gate, PortKind::Audio) => None,
            (_, kind) => Some(kind),
        }
    }
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Audio => write!(f, "audio"),
            PortKind::Cv => write!(f, "cv"),
            PortKind::Gate => write!(f, "gate"),
        }
    }
}

/// Definition of a single port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortDef {
    pub id: &'static str,
    pub kind: PortKind,
}

impl PortDef {
    pub const fn new(id: &'static str, kind: PortKind) -> Self {
        Self { id, kind }
    }

    pub const fn audio() -> Self {
        Self::new(DEFAULT_PORT, PortKind::Audio)
    }

    pub const fn cv(id: &'static str) -> Self {
        Self::new(id, PortKind::Cv)
    }

    pub const fn gate() -> Self {
        Self::new(GATE_PORT, PortKind::Gate)
    }
}

/// Port layout of a module kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSpec {
    pub inputs: Vec<PortDef>,
    pub outputs: Vec<PortDef>,
}

impl PortSpec {
    pub fn input(&self, id: &str) -> Option<&PortDef> {
        self.inputs.iter().find(|p| p.id == id)
    }

    pub fn output(&self, id: &str) -> Option<&PortDef> {
        self.outputs.iter().find(|p| p.id == id)
    }

    pub fn has_audio_input(&self) -> bool {
        self.input(DEFAULT_PORT).is_some()
    }

    pub fn has_audio_output(&self) -> bool {
        self.output(DEFAULT_PORT).is_some()
    }

    /// CV input ids, in declaration order
    pub fn cv_inputs(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.inputs
            .iter()
            .filter(|p| p.kind == PortKind::Cv)
            .map(|p| p.id)
    }
}

/// Capability set a node declares at construction
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    /// Reacts to gate transitions (`on_gate_signal`)
    pub const GATE_LISTENER: Capabilities = Capabilities(1);
    /// Emits gate transitions to registered listeners
    pub const GATE_SOURCE: Capabilities = Capabilities(1 << 1);
    /// Exposes CV inputs
    pub const CV_TARGET: Capabilities = Capabilities(1 << 2);

    pub const fn union(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        self.union(rhs)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Capabilities::GATE_LISTENER) {
            names.push("GateListener");
        }
        if self.contains(Capabilities::GATE_SOURCE) {
            names.push("GateSource");
        }
        if self.contains(Capabilities::CV_TARGET) {
            names.push("CvTarget");
        }
        write!(f, "Capabilities({})", names.join(" | "))
    }
}

/// A native endpoint a node exposes as its audio input or output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioEndpoint(pub NativeId);

impl AudioEndpoint {
    pub fn id(&self) -> NativeId {
        self.0
    }

    pub fn as_input(&self) -> NativeInput {
        NativeInput::Node(self.0)
    }
}
