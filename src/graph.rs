//! Live Module Graph
//!
//! The mutable graph of modules and typed connections. Every operation runs
//! to completion before returning, so observers only ever see whole states.
//!
//! Audio and CV connections are mirrored as native edges. Gate connections
//! are not routed: they register the target as a listener on the source.

use crate::context::{AudioContext, NativeInput};
use crate::modules::{
    attach_to_transport, Master, ModularNode, Module, ModuleHandle, ModuleKind, ModuleState,
    StateError,
};
use crate::observer::EventQueue;
use crate::port::{PortKind, DEFAULT_PORT};
use crate::transport::Subscriptions;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Reserved id of the output sink
pub const MASTER_ID: &str = "master";

new_key_type! {
    /// Arena key of a module in the graph
    pub struct ModuleKey;
}

fn default_port() -> String {
    DEFAULT_PORT.to_string()
}

/// A connection between two module ports, by id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub source_module_id: String,
    pub target_module_id: String,
    #[serde(default = "default_port")]
    pub source_port_id: String,
    #[serde(default = "default_port")]
    pub target_port_id: String,
}

impl Connection {
    /// Audio output into audio input
    pub fn audio(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, DEFAULT_PORT, target, DEFAULT_PORT)
    }

    pub fn new(
        source: impl Into<String>,
        source_port: impl Into<String>,
        target: impl Into<String>,
        target_port: impl Into<String>,
    ) -> Self {
        Self {
            source_module_id: source.into(),
            target_module_id: target.into(),
            source_port_id: source_port.into(),
            target_port_id: target_port.into(),
        }
    }

    pub fn touches(&self, id: &str) -> bool {
        self.source_module_id == id || self.target_module_id == id
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.source_module_id, self.source_port_id, self.target_module_id, self.target_port_id
        )
    }
}

/// Resolve the kind a connection would have between two module kinds,
/// using only their static port layouts.
pub fn resolve_kind(
    source: ModuleKind,
    source_port: &str,
    target: ModuleKind,
    target_port: &str,
) -> Result<PortKind, GraphError> {
    let from = source
        .port_spec()
        .output(source_port)
        .map(|p| p.kind)
        .ok_or_else(|| GraphError::UnknownPort {
            module: source.to_string(),
            port: source_port.to_string(),
            direction: "output",
        })?;
    let to = target
        .port_spec()
        .input(target_port)
        .map(|p| p.kind)
        .ok_or_else(|| GraphError::UnknownPort {
            module: target.to_string(),
            port: target_port.to_string(),
            direction: "input",
        })?;
    PortKind::connection_kind(from, to).ok_or(GraphError::IncompatiblePorts { from, to })
}

/// Graph integrity errors
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("module id already in use: {0}")]
    DuplicateId(String),

    #[error("module id is reserved: {0}")]
    ReservedId(String),

    #[error("invalid module id: {0:?}")]
    InvalidId(String),

    #[error("{module} has no {direction} port {port:?}")]
    UnknownPort {
        module: String,
        port: String,
        direction: &'static str,
    },

    #[error("cannot connect a {from} port to a {to} port")]
    IncompatiblePorts { from: PortKind, to: PortKind },

    #[error("connection already exists: {0}")]
    DuplicateConnection(Connection),

    #[error("cannot connect {0} to itself")]
    SelfConnection(String),

    #[error("no such connection: {0}")]
    UnknownConnection(Connection),

    #[error("{module} port {port:?} is not available yet")]
    PortUnavailable { module: String, port: String },

    #[error("{module} is a {found} module, not a {expected}")]
    WrongKind {
        module: String,
        expected: ModuleKind,
        found: ModuleKind,
    },

    #[error("invalid state for {module}: {source}")]
    State {
        module: String,
        #[source]
        source: StateError,
    },
}

/// A live connection with its resolved kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cable {
    pub connection: Connection,
    pub kind: PortKind,
}

struct Node {
    id: String,
    kind: ModuleKind,
    handle: ModuleHandle,
    position: (f64, f64),
}

/// The live module graph
pub struct ModuleGraph {
    nodes: SlotMap<ModuleKey, Node>,
    index: HashMap<String, ModuleKey>,
    order: Vec<ModuleKey>,
    cables: Vec<Cable>,
    subscriptions: Subscriptions,
    events: EventQueue,
}

impl ModuleGraph {
    /// Create a graph holding only the master sink. Sequencers added later
    /// subscribe to `subscriptions` and publish into `events`.
    pub fn new(subscriptions: Subscriptions, events: EventQueue) -> Self {
        let mut graph = Self {
            nodes: SlotMap::with_key(),
            index: HashMap::new(),
            order: Vec::new(),
            cables: Vec::new(),
            subscriptions,
            events,
        };
        let master = graph.nodes.insert(Node {
            id: MASTER_ID.to_string(),
            kind: ModuleKind::Master,
            handle: Rc::new(RefCell::new(Module::Master(Master::new()))),
            position: (0.0, 0.0),
        });
        graph.index.insert(MASTER_ID.to_string(), master);
        graph
    }

    pub fn add_module(
        &mut self,
        ctx: &mut AudioContext,
        id: &str,
        kind: ModuleKind,
        position: (f64, f64),
    ) -> Result<ModuleHandle, GraphError> {
        if id.trim().is_empty() {
            return Err(GraphError::InvalidId(id.to_string()));
        }
        if id == MASTER_ID || kind == ModuleKind::Master {
            return Err(GraphError::ReservedId(id.to_string()));
        }
        if self.index.contains_key(id) {
            return Err(GraphError::DuplicateId(id.to_string()));
        }

        let handle = Rc::new(RefCell::new(Module::new(ctx, kind)));
        if kind == ModuleKind::Sequencer {
            attach_to_transport(&handle, id, &self.subscriptions, &self.events);
        }
        let key = self.nodes.insert(Node {
            id: id.to_string(),
            kind,
            handle: handle.clone(),
            position,
        });
        self.index.insert(id.to_string(), key);
        self.order.push(key);
        tracing::debug!(id, %kind, "module added");
        Ok(handle)
    }

    /// Disconnect every cable touching `id`, then destroy the module
    pub fn remove_module(&mut self, ctx: &mut AudioContext, id: &str) -> Result<(), GraphError> {
        if id == MASTER_ID {
            return Err(GraphError::ReservedId(id.to_string()));
        }
        let key = self
            .index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownModule(id.to_string()))?;

        let attached: Vec<Connection> = self
            .cables
            .iter()
            .filter(|c| c.connection.touches(id))
            .map(|c| c.connection.clone())
            .collect();
        for connection in &attached {
            self.disconnect(ctx, connection)?;
        }

        if let Some(node) = self.nodes.remove(key) {
            node.handle.borrow_mut().destroy(ctx);
        }
        self.index.remove(id);
        self.order.retain(|k| *k != key);
        tracing::debug!(id, "module removed");
        Ok(())
    }

    /// Remove every module except master
    pub fn clear(&mut self, ctx: &mut AudioContext) {
        for id in self.ids() {
            if let Err(err) = self.remove_module(ctx, &id) {
                tracing::warn!(id, error = %err, "module removal failed during clear");
            }
        }
    }

    pub fn connect(
        &mut self,
        ctx: &mut AudioContext,
        connection: Connection,
    ) -> Result<PortKind, GraphError> {
        let source = self.node(&connection.source_module_id)?;
        let target = self.node(&connection.target_module_id)?;
        if connection.source_module_id == connection.target_module_id {
            return Err(GraphError::SelfConnection(connection.source_module_id));
        }
        let kind = resolve_kind(
            source.kind,
            &connection.source_port_id,
            target.kind,
            &connection.target_port_id,
        )?;
        if self.cables.iter().any(|c| c.connection == connection) {
            return Err(GraphError::DuplicateConnection(connection));
        }

        if kind == PortKind::Gate {
            let mut module = source.handle.borrow_mut();
            if let Some(targets) = module.gate_targets_mut() {
                targets.add(connection.target_module_id.clone(), &target.handle);
            }
        } else {
            let (from, to) = Self::native_route(ctx, source, target, &connection)?;
            if !ctx.connect(from, to) {
                return Err(GraphError::PortUnavailable {
                    module: connection.target_module_id.clone(),
                    port: connection.target_port_id.clone(),
                });
            }
        }

        tracing::debug!(%connection, %kind, "connected");
        self.cables.push(Cable { connection, kind });
        Ok(kind)
    }

    pub fn disconnect(
        &mut self,
        ctx: &mut AudioContext,
        connection: &Connection,
    ) -> Result<(), GraphError> {
        let position = self
            .cables
            .iter()
            .position(|c| c.connection == *connection)
            .ok_or_else(|| GraphError::UnknownConnection(connection.clone()))?;
        let cable = self.cables.remove(position);

        let source = self.node(&connection.source_module_id)?;
        if cable.kind == PortKind::Gate {
            if let Some(targets) = source.handle.borrow_mut().gate_targets_mut() {
                targets.remove(&connection.target_module_id);
            }
        } else {
            let target = self.node(&connection.target_module_id)?;
            match Self::native_route(ctx, source, target, connection) {
                Ok((from, to)) => {
                    ctx.disconnect(from, to);
                }
                Err(err) => tracing::warn!(%connection, error = %err, "native route already gone"),
            }
        }
        tracing::debug!(%connection, "disconnected");
        Ok(())
    }

    fn native_route(
        ctx: &AudioContext,
        source: &Node,
        target: &Node,
        connection: &Connection,
    ) -> Result<(crate::context::NativeId, NativeInput), GraphError> {
        let from = source
            .handle
            .borrow()
            .output(&connection.source_port_id)
            .ok_or_else(|| GraphError::PortUnavailable {
                module: connection.source_module_id.clone(),
                port: connection.source_port_id.clone(),
            })?;
        let target_module = target.handle.borrow();
        let to = if connection.target_port_id == DEFAULT_PORT {
            target_module.input_port(ctx).map(|e| e.as_input())
        } else {
            target_module.cv_input(&connection.target_port_id)
        };
        let to = to.ok_or_else(|| GraphError::PortUnavailable {
            module: connection.target_module_id.clone(),
            port: connection.target_port_id.clone(),
        })?;
        Ok((from, to))
    }

    fn node(&self, id: &str) -> Result<&Node, GraphError> {
        self.index
            .get(id)
            .and_then(|key| self.nodes.get(*key))
            .ok_or_else(|| GraphError::UnknownModule(id.to_string()))
    }

    /// Replace a module's parameters from a JSON state blob
    pub fn set_state(
        &mut self,
        ctx: &mut AudioContext,
        id: &str,
        value: &serde_json::Value,
    ) -> Result<(), GraphError> {
        let node = self.node(id)?;
        let result = node.handle.borrow_mut().set_state_value(ctx, value);
        result.map_err(|source| GraphError::State {
            module: id.to_string(),
            source,
        })
    }

    pub fn state(&self, id: &str) -> Option<ModuleState> {
        self.node(id).ok().map(|n| n.handle.borrow().state())
    }

    pub fn module(&self, id: &str) -> Option<ModuleHandle> {
        self.node(id).ok().map(|n| n.handle.clone())
    }

    pub fn kind_of(&self, id: &str) -> Option<ModuleKind> {
        self.node(id).ok().map(|n| n.kind)
    }

    /// Whether `id` names a live module (master included)
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Module ids in insertion order, master excluded
    pub fn ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|key| self.nodes.get(*key))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Number of modules, master excluded
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn set_position(&mut self, id: &str, position: (f64, f64)) -> bool {
        match self.index.get(id).and_then(|key| self.nodes.get_mut(*key)) {
            Some(node) => {
                node.position = position;
                true
            }
            None => false,
        }
    }

    pub fn position(&self, id: &str) -> Option<(f64, f64)> {
        self.node(id).ok().map(|n| n.position)
    }

    pub fn cables(&self) -> &[Cable] {
        &self.cables
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.cables.iter().map(|c| &c.connection)
    }

    pub fn snapshot_connections(&self) -> Vec<Connection> {
        self.connections().cloned().collect()
    }

    pub fn has_connection(&self, connection: &Connection) -> bool {
        self.cables.iter().any(|c| c.connection == *connection)
    }
}

impl fmt::Debug for ModuleGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleGraph")
            .field("modules", &self.ids())
            .field("cables", &self.cables.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ManualClock, NativeFeatures};

    fn setup() -> (AudioContext, ModuleGraph) {
        let mut ctx = AudioContext::new(ManualClock::new(0.0), NativeFeatures::default());
        ctx.initialize();
        let graph = ModuleGraph::new(Subscriptions::default(), EventQueue::new());
        (ctx, graph)
    }

    #[test]
    fn test_master_exists_from_start() {
        let (_, graph) = setup();
        assert!(graph.contains(MASTER_ID));
        assert_eq!(graph.kind_of(MASTER_ID), Some(ModuleKind::Master));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_add_module_rejections() {
        let (mut ctx, mut graph) = setup();
        graph
            .add_module(&mut ctx, "osc", ModuleKind::Oscillator, (0.0, 0.0))
            .unwrap();

        let dup = graph.add_module(&mut ctx, "osc", ModuleKind::Filter, (0.0, 0.0));
        assert!(matches!(dup, Err(GraphError::DuplicateId(_))));
        let reserved = graph.add_module(&mut ctx, MASTER_ID, ModuleKind::Gain, (0.0, 0.0));
        assert!(matches!(reserved, Err(GraphError::ReservedId(_))));
        let empty = graph.add_module(&mut ctx, " ", ModuleKind::Gain, (0.0, 0.0));
        assert!(matches!(empty, Err(GraphError::InvalidId(_))));
        assert_eq!(graph.ids(), vec!["osc".to_string()]);
    }

    #[test]
    fn test_audio_connection_routes_natively() {
        let (mut ctx, mut graph) = setup();
        graph
            .add_module(&mut ctx, "osc", ModuleKind::Oscillator, (0.0, 0.0))
            .unwrap();
        let edges = ctx.edges().len();

        let kind = graph
            .connect(&mut ctx, Connection::audio("osc", MASTER_ID))
            .unwrap();
        assert_eq!(kind, PortKind::Audio);
        assert_eq!(ctx.edges().len(), edges + 1);

        graph
            .disconnect(&mut ctx, &Connection::audio("osc", MASTER_ID))
            .unwrap();
        assert_eq!(ctx.edges().len(), edges);
    }

    #[test]
    fn test_gate_connection_registers_listener() {
        let (mut ctx, mut graph) = setup();
        let seq = graph
            .add_module(&mut ctx, "seq", ModuleKind::Sequencer, (0.0, 0.0))
            .unwrap();
        graph
            .add_module(&mut ctx, "env", ModuleKind::Adsr, (0.0, 0.0))
            .unwrap();
        let edges = ctx.edges().len();

        let kind = graph
            .connect(&mut ctx, Connection::new("seq", "gate", "env", "gate"))
            .unwrap();
        assert_eq!(kind, PortKind::Gate);
        assert_eq!(ctx.edges().len(), edges);
        let listeners = seq.borrow().gate_targets().map(|t| t.len());
        assert_eq!(listeners, Some(1));

        graph.remove_module(&mut ctx, "env").unwrap();
        let listeners = seq.borrow().gate_targets().map(|t| t.len());
        assert_eq!(listeners, Some(0));
    }

    #[test]
    fn test_gate_drives_cv_natively() {
        let (mut ctx, mut graph) = setup();
        graph
            .add_module(&mut ctx, "kb", ModuleKind::Keyboard, (0.0, 0.0))
            .unwrap();
        graph
            .add_module(&mut ctx, "vcf", ModuleKind::Filter, (0.0, 0.0))
            .unwrap();
        let kind = graph
            .connect(&mut ctx, Connection::new("kb", "gate", "vcf", "cutoff"))
            .unwrap();
        assert_eq!(kind, PortKind::Cv);
    }

    #[test]
    fn test_connection_validation() {
        let (mut ctx, mut graph) = setup();
        graph
            .add_module(&mut ctx, "osc", ModuleKind::Oscillator, (0.0, 0.0))
            .unwrap();
        graph
            .add_module(&mut ctx, "env", ModuleKind::Adsr, (0.0, 0.0))
            .unwrap();

        let unknown = graph.connect(&mut ctx, Connection::audio("osc", "nowhere"));
        assert!(matches!(unknown, Err(GraphError::UnknownModule(_))));

        let bad_port = graph.connect(&mut ctx, Connection::new("osc", "audio", "env", "wobble"));
        assert!(matches!(bad_port, Err(GraphError::UnknownPort { .. })));

        let no_input = graph.connect(&mut ctx, Connection::audio("env", "osc"));
        assert!(matches!(no_input, Err(GraphError::UnknownPort { .. })));

        let incompatible = graph.connect(&mut ctx, Connection::new("osc", "audio", "env", "gate"));
        assert!(matches!(
            incompatible,
            Err(GraphError::IncompatiblePorts {
                from: PortKind::Audio,
                to: PortKind::Gate
            })
        ));

        let itself = graph.connect(&mut ctx, Connection::audio("env", "env"));
        assert!(matches!(itself, Err(GraphError::SelfConnection(_))));

        graph
            .connect(&mut ctx, Connection::audio("osc", "env"))
            .unwrap();
        let dup = graph.connect(&mut ctx, Connection::audio("osc", "env"));
        assert!(matches!(dup, Err(GraphError::DuplicateConnection(_))));
        assert_eq!(graph.cables().len(), 1);
    }

    #[test]
    fn test_master_unavailable_before_initialize() {
        let mut ctx = AudioContext::new(ManualClock::new(0.0), NativeFeatures::default());
        let mut graph = ModuleGraph::new(Subscriptions::default(), EventQueue::new());
        graph
            .add_module(&mut ctx, "osc", ModuleKind::Oscillator, (0.0, 0.0))
            .unwrap();
        let result = graph.connect(&mut ctx, Connection::audio("osc", MASTER_ID));
        assert!(matches!(result, Err(GraphError::PortUnavailable { .. })));
        assert!(graph.cables().is_empty());

        ctx.initialize();
        assert!(graph
            .connect(&mut ctx, Connection::audio("osc", MASTER_ID))
            .is_ok());
    }

    #[test]
    fn test_remove_releases_native_resources() {
        let (mut ctx, mut graph) = setup();
        graph
            .add_module(&mut ctx, "osc", ModuleKind::Oscillator, (0.0, 0.0))
            .unwrap();
        graph
            .add_module(&mut ctx, "vcf", ModuleKind::Filter, (0.0, 0.0))
            .unwrap();
        graph
            .connect(&mut ctx, Connection::audio("osc", "vcf"))
            .unwrap();
        graph
            .connect(&mut ctx, Connection::audio("vcf", MASTER_ID))
            .unwrap();

        graph.clear(&mut ctx);
        assert!(graph.is_empty());
        assert!(graph.cables().is_empty());
        assert_eq!(ctx.live_node_count(), 0);
        assert!(ctx.edges().is_empty());
    }

    #[test]
    fn test_sequencer_subscribes_and_unsubscribes() {
        let mut ctx = AudioContext::new(ManualClock::new(0.0), NativeFeatures::default());
        let subscriptions = Subscriptions::default();
        let mut graph = ModuleGraph::new(subscriptions.clone(), EventQueue::new());
        graph
            .add_module(&mut ctx, "seq", ModuleKind::Sequencer, (0.0, 0.0))
            .unwrap();
        assert_eq!(subscriptions.tick_listener_count(), 1);
        graph.remove_module(&mut ctx, "seq").unwrap();
        assert_eq!(subscriptions.tick_listener_count(), 0);
    }

    #[test]
    fn test_set_state_and_position() {
        let (mut ctx, mut graph) = setup();
        graph
            .add_module(&mut ctx, "g", ModuleKind::Gain, (1.0, 2.0))
            .unwrap();
        graph
            .set_state(&mut ctx, "g", &serde_json::json!({ "level": 1.5 }))
            .unwrap();
        let state = graph.state("g").map(|s| s.to_value());
        assert_eq!(state, Some(serde_json::json!({ "level": 1.5 })));

        let bad = graph.set_state(&mut ctx, "g", &serde_json::json!({ "level": [] }));
        assert!(matches!(bad, Err(GraphError::State { .. })));

        assert_eq!(graph.position("g"), Some((1.0, 2.0)));
        assert!(graph.set_position("g", (3.0, 4.0)));
        assert_eq!(graph.position("g"), Some((3.0, 4.0)));
    }
}
