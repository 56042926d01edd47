//! # Patchbay: control plane for a modular synthesizer
//!
//! `patchbay` owns everything in a browser-style modular synth that is not
//! sample processing: the module graph and its typed cables, smoothed control
//! values, a lookahead transport that stamps musical ticks with exact audio
//! times, step sequencers, a JSON patch format and an engine that merges
//! patches into a running graph.
//!
//! Sample processing itself belongs to a native audio layer, modelled here by
//! [`context::AudioContext`]: an arena of native nodes, their edges and their
//! automation timelines.
//!
//! ## Layers
//!
//! - **Native boundary**: [`context`], [`automation`]
//! - **Nodes**: [`smooth`], [`port`], [`modules`]
//! - **Time**: [`transport`], [`observer`]
//! - **Graph and patches**: [`graph`], [`serialize`], [`apply`]
//! - **Facade**: [`rack`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use patchbay::prelude::*;
//!
//! let mut rack = Rack::new(RackConfig::default(), SystemClock::new());
//!
//! rack.add_module("seq", ModuleKind::Sequencer, (0.0, 0.0)).unwrap();
//! rack.add_module("osc", ModuleKind::Oscillator, (200.0, 0.0)).unwrap();
//! rack.add_module("env", ModuleKind::Adsr, (400.0, 0.0)).unwrap();
//!
//! rack.connect(Connection::new("seq", "audio", "osc", "pitch")).unwrap();
//! rack.connect(Connection::new("seq", "gate", "env", "gate")).unwrap();
//! rack.connect(Connection::audio("osc", "env")).unwrap();
//! rack.connect(Connection::audio("env", "master")).unwrap();
//!
//! rack.play();
//! loop {
//!     rack.pump();
//!     for event in rack.drain_events() {
//!         println!("{event:?}");
//!     }
//! #   break;
//! }
//! ```

pub mod apply;
pub mod automation;
pub mod context;
pub mod graph;
pub mod modules;
pub mod observer;
pub mod port;
pub mod rack;
pub mod serialize;
pub mod smooth;
pub mod transport;

/// Prelude module for convenient imports
pub mod prelude {
    // Native boundary
    pub use crate::automation::AudioParam;
    pub use crate::context::{
        AudioContext, Clock, FilterType, ManualClock, NativeFeatures, NativeId, SystemClock,
        Waveform,
    };

    // Nodes
    pub use crate::modules::{
        ModularNode, Module, ModuleHandle, ModuleKind, ModuleState, Pattern, StateError, Step,
    };
    pub use crate::port::{Capabilities, PortDef, PortKind, PortSpec};
    pub use crate::smooth::SmoothCv;

    // Time
    pub use crate::observer::{EventQueue, SequencerEvent};
    pub use crate::transport::{StopEvent, Subscriptions, Tick, Transport, TransportConfig};

    // Graph and patches
    pub use crate::apply::{ApplyMode, ApplyOptions, ApplySummary, TargetType};
    pub use crate::graph::{Connection, GraphError, ModuleGraph, MASTER_ID};
    pub use crate::serialize::{ModuleDef, PatchDocument, PatchError, TransportSettings};

    // Facade
    pub use crate::rack::{ConfigError, Rack, RackConfig};
}
