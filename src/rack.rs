//! Rack: the engine facade
//!
//! Bundles the native context, the transport, the live module graph and the
//! sequencer event queue behind the entry points a UI drives.

use crate::apply::{self, ApplyOptions, ApplySummary};
use crate::context::{AudioContext, Clock, NativeFeatures, NativeId, SystemClock};
use crate::graph::{Connection, GraphError, ModuleGraph};
use crate::modules::{ModuleHandle, ModuleKind, ModuleState};
use crate::observer::{EventQueue, SequencerEvent};
use crate::port::PortKind;
use crate::serialize::{self, ImportReport, PatchDocument, PatchError};
use crate::transport::{Transport, TransportConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid rack configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Construction-time settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RackConfig {
    pub transport: TransportConfig,
    pub native: NativeFeatures,
    /// Create the output destination immediately
    pub initialize_audio: bool,
}

impl Default for RackConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            native: NativeFeatures::default(),
            initialize_audio: true,
        }
    }
}

impl RackConfig {
    /// Parse a configuration; transport values are clamped into range
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(json)?;
        config.transport = config.transport.clamped();
        Ok(config)
    }
}

#[derive(Debug)]
pub struct Rack {
    ctx: AudioContext,
    transport: Transport,
    graph: ModuleGraph,
    events: EventQueue,
}

impl Rack {
    pub fn new(config: RackConfig, clock: impl Clock + 'static) -> Self {
        let mut ctx = AudioContext::new(clock, config.native);
        if config.initialize_audio {
            ctx.initialize();
        }
        let transport = Transport::new(config.transport);
        let events = EventQueue::new();
        let graph = ModuleGraph::new(transport.subscriptions().clone(), events.clone());
        Self {
            ctx,
            transport,
            graph,
            events,
        }
    }

    /// Create the output destination if it does not exist yet
    pub fn initialize_audio(&mut self) -> NativeId {
        self.ctx.initialize()
    }

    pub fn context(&self) -> &AudioContext {
        &self.ctx
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn graph(&self) -> &ModuleGraph {
        &self.graph
    }

    pub fn add_module(
        &mut self,
        id: &str,
        kind: ModuleKind,
        position: (f64, f64),
    ) -> Result<ModuleHandle, GraphError> {
        self.graph.add_module(&mut self.ctx, id, kind, position)
    }

    pub fn remove_module(&mut self, id: &str) -> Result<(), GraphError> {
        self.graph.remove_module(&mut self.ctx, id)
    }

    pub fn connect(&mut self, connection: Connection) -> Result<PortKind, GraphError> {
        self.graph.connect(&mut self.ctx, connection)
    }

    pub fn disconnect(&mut self, connection: &Connection) -> Result<(), GraphError> {
        self.graph.disconnect(&mut self.ctx, connection)
    }

    pub fn set_state(&mut self, id: &str, state: &serde_json::Value) -> Result<(), GraphError> {
        self.graph.set_state(&mut self.ctx, id, state)
    }

    pub fn state(&self, id: &str) -> Option<ModuleState> {
        self.graph.state(id)
    }

    pub fn play(&mut self) {
        self.transport.play(&mut self.ctx);
    }

    pub fn stop(&mut self) {
        self.transport.stop(&mut self.ctx);
    }

    pub fn is_playing(&self) -> bool {
        self.transport.is_playing()
    }

    /// Run a scheduling pass if one is due; returns the ticks fired
    pub fn pump(&mut self) -> usize {
        self.transport.pump(&mut self.ctx)
    }

    pub fn set_bpm(&mut self, bpm: f64) {
        self.transport.set_bpm(&self.ctx, bpm);
    }

    pub fn set_ticks_per_beat(&mut self, ticks_per_beat: u32) {
        self.transport.set_ticks_per_beat(&self.ctx, ticks_per_beat);
    }

    pub fn set_swing(&mut self, swing: f64) {
        self.transport.set_swing(swing);
    }

    /// Play a note on a keyboard module, now
    pub fn note_on(&mut self, id: &str, midi: i32) -> Result<(), GraphError> {
        let keyboard = self.keyboard(id)?;
        let now = self.ctx.now();
        let mut module = keyboard.borrow_mut();
        if let Some(keyboard) = module.as_keyboard_mut() {
            keyboard.note_on(&mut self.ctx, midi, now);
        }
        Ok(())
    }

    pub fn note_off(&mut self, id: &str) -> Result<(), GraphError> {
        let keyboard = self.keyboard(id)?;
        let now = self.ctx.now();
        let mut module = keyboard.borrow_mut();
        if let Some(keyboard) = module.as_keyboard_mut() {
            keyboard.note_off(&mut self.ctx, now);
        }
        Ok(())
    }

    fn keyboard(&self, id: &str) -> Result<ModuleHandle, GraphError> {
        match self.graph.kind_of(id) {
            Some(ModuleKind::Keyboard) => self
                .graph
                .module(id)
                .ok_or_else(|| GraphError::UnknownModule(id.to_string())),
            Some(found) => Err(GraphError::WrongKind {
                module: id.to_string(),
                expected: ModuleKind::Keyboard,
                found,
            }),
            None => Err(GraphError::UnknownModule(id.to_string())),
        }
    }

    pub fn export(&self) -> PatchDocument {
        serialize::export(&self.graph, &self.transport)
    }

    pub fn export_json(&self) -> Result<String, PatchError> {
        self.export().to_json()
    }

    /// Replace the live graph with `document`
    pub fn import(&mut self, document: &PatchDocument) -> ImportReport {
        let (document, warnings) = document.clone().sanitize();
        self.load(&document, warnings)
    }

    /// Lenient import: malformed entries become warnings
    pub fn import_json(&mut self, json: &str) -> Result<ImportReport, PatchError> {
        let (document, warnings) = PatchDocument::parse(json)?;
        Ok(self.load(&document, warnings))
    }

    fn load(&mut self, document: &PatchDocument, mut warnings: Vec<String>) -> ImportReport {
        self.graph.clear(&mut self.ctx);
        if let Some(settings) = document.transport {
            settings.apply(&self.ctx, &mut self.transport);
        }
        let mut report = serialize::load_into(&mut self.ctx, &mut self.graph, document);
        warnings.append(&mut report.warnings);
        report.warnings = warnings;
        report
    }

    pub fn preview(&self, document: &PatchDocument, options: &ApplyOptions) -> ApplySummary {
        apply::preview(&self.graph, document, options)
    }

    pub fn apply(&mut self, document: &PatchDocument, options: &ApplyOptions) -> ApplySummary {
        apply::apply(
            &mut self.ctx,
            &mut self.graph,
            &mut self.transport,
            document,
            options,
        )
    }

    /// Take every sequencer event published since the last drain
    pub fn drain_events(&self) -> Vec<SequencerEvent> {
        self.events.drain()
    }
}

impl Default for Rack {
    fn default() -> Self {
        Self::new(RackConfig::default(), SystemClock::new())
    }
}
