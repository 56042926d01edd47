//! Patch Documents
//!
//! The JSON wire format for whole graphs: modules with their position and
//! state, connections by module and port id, and optional transport settings.
//! `master` is implied and never listed as a module.
//!
//! Reading is lenient. Malformed entries are skipped with a warning and the
//! valid remainder loads.

use crate::context::AudioContext;
use crate::graph::{Connection, ModuleGraph, MASTER_ID};
use crate::modules::ModuleKind;
use crate::port::PortKind;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

/// Wire format errors that prevent reading a document at all
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("invalid patch JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid patch document: {0}")]
    Shape(String),
}

/// Tempo carried by a document
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticks_per_beat: Option<u32>,
}

impl TransportSettings {
    pub fn of(transport: &Transport) -> Self {
        Self {
            bpm: Some(transport.bpm()),
            ticks_per_beat: Some(transport.ticks_per_beat()),
        }
    }

    /// Apply whichever settings are present
    pub fn apply(&self, ctx: &AudioContext, transport: &mut Transport) {
        if let Some(bpm) = self.bpm {
            transport.set_bpm(ctx, bpm);
        }
        if let Some(ticks) = self.ticks_per_beat {
            transport.set_ticks_per_beat(ctx, ticks);
        }
    }
}

fn empty_state() -> Value {
    Value::Object(Default::default())
}

/// Serializable module definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ModuleKind,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default = "empty_state")]
    pub state: Value,
}

impl ModuleDef {
    pub fn new(id: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            id: id.into(),
            kind,
            x: 0.0,
            y: 0.0,
            state: empty_state(),
        }
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.x = x;
        self.y = y;
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }
}

/// Serializable patch definition
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PatchDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportSettings>,
    #[serde(default)]
    pub modules: Vec<ModuleDef>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl PatchDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, module: ModuleDef) -> Self {
        self.modules.push(module);
        self
    }

    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connections.push(connection);
        self
    }

    pub fn module(&self, id: &str) -> Option<&ModuleDef> {
        self.modules.iter().find(|m| m.id == id)
    }

    pub fn kind_of(&self, id: &str) -> Option<ModuleKind> {
        if id == MASTER_ID {
            return Some(ModuleKind::Master);
        }
        self.module(id).map(|m| m.kind)
    }

    pub fn to_json(&self) -> Result<String, PatchError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Strict parse: any malformed entry fails the whole document
    pub fn from_json(json: &str) -> Result<Self, PatchError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Lenient parse of a JSON string, see [`PatchDocument::from_value_lenient`]
    pub fn parse(json: &str) -> Result<(Self, Vec<String>), PatchError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value_lenient(&value)
    }

    /// Read a document entry by entry. Entries that cannot be read are
    /// skipped with a warning; the result is then [sanitized](Self::sanitize).
    pub fn from_value_lenient(value: &Value) -> Result<(Self, Vec<String>), PatchError> {
        let object = value
            .as_object()
            .ok_or_else(|| PatchError::Shape("expected a JSON object".into()))?;
        let mut warnings = Vec::new();

        let transport = match object.get("transport") {
            None | Some(Value::Null) => None,
            Some(raw) => match TransportSettings::deserialize(raw) {
                Ok(settings) => Some(settings),
                Err(err) => {
                    warnings.push(format!("ignored transport settings: {err}"));
                    None
                }
            },
        };

        let mut modules = Vec::new();
        for (i, raw) in entries(object.get("modules"), "modules")?.iter().enumerate() {
            match read_module(raw) {
                Ok(module) => modules.push(module),
                Err(reason) => warnings.push(format!("skipped module #{i}: {reason}")),
            }
        }

        let mut connections = Vec::new();
        for (i, raw) in entries(object.get("connections"), "connections")?
            .iter()
            .enumerate()
        {
            match Connection::deserialize(raw) {
                Ok(connection) => connections.push(connection),
                Err(err) => warnings.push(format!("skipped connection #{i}: {err}")),
            }
        }

        let (document, more) = Self {
            transport,
            modules,
            connections,
        }
        .sanitize();
        warnings.extend(more);
        Ok((document, warnings))
    }

    /// Drop entries that would violate graph invariants: reserved or
    /// duplicate module ids, and connections whose endpoints are not in the
    /// document. Also warns when no audio reaches master.
    pub fn sanitize(self) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let mut seen = HashSet::new();
        let mut modules = Vec::with_capacity(self.modules.len());
        for module in self.modules {
            if module.id.trim().is_empty() {
                warnings.push("skipped module with empty id".to_string());
            } else if module.id == MASTER_ID || module.kind == ModuleKind::Master {
                warnings.push(format!("skipped module {:?}: master is reserved", module.id));
            } else if !seen.insert(module.id.clone()) {
                warnings.push(format!("skipped module {:?}: duplicate id", module.id));
            } else {
                modules.push(module);
            }
        }

        let mut unique = HashSet::new();
        let mut connections = Vec::with_capacity(self.connections.len());
        for connection in self.connections {
            let known = |id: &str| id == MASTER_ID || seen.contains(id);
            if !known(&connection.source_module_id) || !known(&connection.target_module_id) {
                warnings.push(format!("skipped connection {connection}: unknown endpoint"));
            } else if !unique.insert(connection.clone()) {
                warnings.push(format!("skipped connection {connection}: duplicate"));
            } else {
                connections.push(connection);
            }
        }

        let document = Self {
            transport: self.transport,
            modules,
            connections,
        };
        if !document.routes_to_master() {
            warnings.push("no audio connection reaches master".to_string());
        }
        for warning in &warnings {
            tracing::warn!("{warning}");
        }
        (document, warnings)
    }

    /// Whether some audio-kind connection terminates at master
    pub fn routes_to_master(&self) -> bool {
        self.connections.iter().any(|c| {
            c.target_module_id == MASTER_ID
                && self.connection_kind(c) == Some(PortKind::Audio)
        })
    }

    /// Kind of a connection resolved from the static port layouts
    pub fn connection_kind(&self, connection: &Connection) -> Option<PortKind> {
        let source = self.kind_of(&connection.source_module_id)?;
        let target = self.kind_of(&connection.target_module_id)?;
        crate::graph::resolve_kind(
            source,
            &connection.source_port_id,
            target,
            &connection.target_port_id,
        )
        .ok()
    }
}

fn entries<'a>(value: Option<&'a Value>, field: &str) -> Result<&'a [Value], PatchError> {
    match value {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(PatchError::Shape(format!("`{field}` must be an array"))),
    }
}

fn read_module(raw: &Value) -> Result<ModuleDef, String> {
    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .ok_or("missing id")?;
    let kind = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("{id:?} is missing its type"))?;
    let kind = kind
        .parse::<ModuleKind>()
        .map_err(|err| format!("{id:?}: {err}"))?;
    let coordinate = |axis: &str| raw.get(axis).and_then(Value::as_f64).unwrap_or(0.0);
    Ok(ModuleDef {
        id: id.to_string(),
        kind,
        x: coordinate("x"),
        y: coordinate("y"),
        state: raw.get("state").cloned().unwrap_or_else(empty_state),
    })
}

/// Snapshot the live graph (master excluded) as a document
pub fn export(graph: &ModuleGraph, transport: &Transport) -> PatchDocument {
    let modules = graph
        .ids()
        .into_iter()
        .filter_map(|id| {
            let kind = graph.kind_of(&id)?;
            let (x, y) = graph.position(&id).unwrap_or_default();
            let state = graph.state(&id).map(|s| s.to_value()).unwrap_or_else(empty_state);
            Some(ModuleDef {
                id,
                kind,
                x,
                y,
                state,
            })
        })
        .collect();

    PatchDocument {
        transport: Some(TransportSettings::of(transport)),
        modules,
        connections: graph.snapshot_connections(),
    }
}

/// Outcome of loading a document into a graph
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportReport {
    pub modules_added: usize,
    pub connections_added: usize,
    pub warnings: Vec<String>,
}

/// Add every module of `document` (with its state), then every connection.
/// Failures are collected as warnings and the rest continues.
pub fn load_into(
    ctx: &mut AudioContext,
    graph: &mut ModuleGraph,
    document: &PatchDocument,
) -> ImportReport {
    let mut report = ImportReport::default();

    for module in &document.modules {
        if let Err(err) = graph.add_module(ctx, &module.id, module.kind, (module.x, module.y)) {
            report.warnings.push(format!("module {:?} not added: {err}", module.id));
            continue;
        }
        report.modules_added += 1;
        if let Err(err) = graph.set_state(ctx, &module.id, &module.state) {
            report.warnings.push(format!("{err}; defaults kept"));
        }
    }

    for connection in &document.connections {
        match graph.connect(ctx, connection.clone()) {
            Ok(_) => report.connections_added += 1,
            Err(err) => report
                .warnings
                .push(format!("connection {connection} not added: {err}")),
        }
    }

    for warning in &report.warnings {
        tracing::warn!("{warning}");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ManualClock, NativeFeatures};
    use crate::observer::EventQueue;
    use crate::transport::TransportConfig;
    use serde_json::json;

    fn setup() -> (AudioContext, ModuleGraph, Transport) {
        let mut ctx = AudioContext::new(ManualClock::new(0.0), NativeFeatures::default());
        ctx.initialize();
        let transport = Transport::new(TransportConfig::default());
        let graph = ModuleGraph::new(transport.subscriptions().clone(), EventQueue::new());
        (ctx, graph, transport)
    }

    #[test]
    fn test_wire_field_names() {
        let doc = PatchDocument::new()
            .with_module(ModuleDef::new("osc", ModuleKind::Oscillator).with_position(10.0, 20.0))
            .with_connection(Connection::audio("osc", MASTER_ID));
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["modules"][0]["type"], "oscillator");
        assert_eq!(value["modules"][0]["x"], 10.0);
        assert_eq!(value["connections"][0]["sourceModuleId"], "osc");
        assert_eq!(value["connections"][0]["targetPortId"], "audio");
        assert!(value.get("transport").is_none());
    }

    #[test]
    fn test_ports_default_to_audio() {
        let (doc, warnings) = PatchDocument::parse(
            r#"{
                "modules": [{ "id": "osc", "type": "oscillator" }],
                "connections": [{ "sourceModuleId": "osc", "targetModuleId": "master" }]
            }"#,
        )
        .unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(doc.connections, vec![Connection::audio("osc", MASTER_ID)]);
    }

    #[test]
    fn test_duplicate_id_keeps_first() {
        let (doc, warnings) = PatchDocument::from_value_lenient(&json!({
            "modules": [
                { "id": "a", "type": "oscillator", "x": 0, "y": 0, "state": {} },
                { "id": "a", "type": "filter", "x": 0, "y": 0, "state": {} }
            ],
            "connections": [{ "sourceModuleId": "a", "targetModuleId": "master" }]
        }))
        .unwrap();
        assert_eq!(doc.modules.len(), 1);
        assert_eq!(doc.modules[0].kind, ModuleKind::Oscillator);
        assert!(warnings.iter().any(|w| w.contains("duplicate id")));

        let (mut ctx, mut graph, _) = setup();
        let report = load_into(&mut ctx, &mut graph, &doc);
        assert_eq!(report.modules_added, 1);
        assert_eq!(graph.kind_of("a"), Some(ModuleKind::Oscillator));
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let (doc, warnings) = PatchDocument::from_value_lenient(&json!({
            "modules": [
                { "type": "gain" },
                { "id": "b" },
                { "id": "c", "type": "theremin" },
                { "id": "master", "type": "gain" },
                { "id": "g", "type": "gain" }
            ],
            "connections": [
                { "sourceModuleId": "g", "targetModuleId": "ghost" },
                { "targetModuleId": "master" },
                { "sourceModuleId": "g", "targetModuleId": "master" }
            ]
        }))
        .unwrap();
        assert_eq!(doc.modules.len(), 1);
        assert_eq!(doc.connections.len(), 1);
        assert_eq!(warnings.len(), 6, "{warnings:?}");
    }

    #[test]
    fn test_missing_master_route_warns() {
        let (_, warnings) = PatchDocument::from_value_lenient(&json!({
            "modules": [{ "id": "lfo", "type": "lfo" }, { "id": "f", "type": "filter" }],
            "connections": [
                { "sourceModuleId": "lfo", "targetModuleId": "f", "targetPortId": "cutoff" }
            ]
        }))
        .unwrap();
        assert_eq!(warnings, vec!["no audio connection reaches master".to_string()]);
    }

    #[test]
    fn test_shape_errors() {
        assert!(matches!(PatchDocument::parse("[1, 2]"), Err(PatchError::Shape(_))));
        assert!(matches!(
            PatchDocument::parse(r#"{ "modules": 3 }"#),
            Err(PatchError::Shape(_))
        ));
        assert!(matches!(PatchDocument::parse("{"), Err(PatchError::Json(_))));
    }

    #[test]
    fn test_export_import_round_trip() {
        let (mut ctx, mut graph, transport) = setup();
        let doc = PatchDocument::new()
            .with_module(
                ModuleDef::new("seq", ModuleKind::Sequencer).with_state(json!({ "length": 8 })),
            )
            .with_module(
                ModuleDef::new("osc", ModuleKind::Oscillator)
                    .with_position(5.0, 6.0)
                    .with_state(json!({ "waveform": "sawtooth", "octave": -1 })),
            )
            .with_module(ModuleDef::new("env", ModuleKind::Adsr))
            .with_connection(Connection::new("seq", "audio", "osc", "pitch"))
            .with_connection(Connection::new("seq", "gate", "env", "gate"))
            .with_connection(Connection::audio("osc", "env"))
            .with_connection(Connection::audio("env", MASTER_ID));
        let report = load_into(&mut ctx, &mut graph, &doc);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        let exported = export(&graph, &transport);

        let (mut ctx2, mut graph2, transport2) = setup();
        let json = exported.to_json().unwrap();
        let (reread, warnings) = PatchDocument::parse(&json).unwrap();
        assert!(warnings.is_empty());
        load_into(&mut ctx2, &mut graph2, &reread);
        let again = export(&graph2, &transport2);

        let mut first = exported.connections.clone();
        let mut second = again.connections.clone();
        first.sort();
        second.sort();
        assert_eq!(first, second);
        assert_eq!(exported.modules, again.modules);
        assert_eq!(again.module("osc").map(|m| m.state["octave"].clone()), Some(json!(-1)));
        assert_eq!(again.module("osc").map(|m| (m.x, m.y)), Some((5.0, 6.0)));
    }

    #[test]
    fn test_bad_state_keeps_defaults() {
        let (mut ctx, mut graph, _) = setup();
        let doc = PatchDocument::new()
            .with_module(ModuleDef::new("g", ModuleKind::Gain).with_state(json!({ "level": "x" })));
        let report = load_into(&mut ctx, &mut graph, &doc);
        assert_eq!(report.modules_added, 1);
        assert_eq!(report.warnings.len(), 1);
    }
}
