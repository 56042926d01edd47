//! Patch Apply Engine
//!
//! Merges an incoming patch document into the live graph under one of
//! several composition modes. Planning is a pure function of the live graph,
//! the document and the options; [`preview`] reports the plan and [`apply`]
//! commits it.
//!
//! Planning runs in order:
//! 1. colliding incoming ids are renamed `id-N`
//! 2. the incoming entry and exit modules are inferred
//! 3. the connections to remove and to add are computed for the mode
//!
//! Commit creates modules, then removes, then adds. Individual failures are
//! collected as warnings; whatever succeeded stays applied.

use crate::context::AudioContext;
use crate::graph::{resolve_kind, Connection, ModuleGraph, MASTER_ID};
use crate::modules::{ModuleKind, ModuleState};
use crate::port::{PortKind, DEFAULT_PORT};
use crate::serialize::{ModuleDef, PatchDocument, TransportSettings};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// CV ports tried, in order, when attaching a modulation source
pub const MODULATION_PORT_PREFERENCE: [&str; 8] = [
    "cutoff", "level", "freq", "res", "drive", "mix", "time", "feedback",
];

/// Kinds tried, in order, when choosing the incoming modulation source
pub const MODULATION_SOURCE_PREFERENCE: [ModuleKind; 3] =
    [ModuleKind::Lfo, ModuleKind::Adsr, ModuleKind::Sequencer];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    /// Discard the live graph and load the document verbatim
    #[default]
    Replace,
    /// Insert the document in series, relative to the target
    AddChain,
    /// Feed a copy of the target into the document, returning to master
    AddSend,
    /// Add the document as a parallel layer
    AddLayer,
    /// Wire the document's modulation source into a CV port of the target
    AddModulation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    #[default]
    Master,
    AfterModule,
    BeforeModule,
    ParallelModule,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApplyOptions {
    pub mode: ApplyMode,
    pub target_type: TargetType,
    pub target_module_id: Option<String>,
}

impl ApplyOptions {
    pub fn new(mode: ApplyMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn targeting(mut self, target_type: TargetType, module_id: impl Into<String>) -> Self {
        self.target_type = target_type;
        self.target_module_id = Some(module_id.into());
        self
    }
}

/// What an apply did, or would do
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplySummary {
    pub modules_added: usize,
    pub connections_added: usize,
    pub routes_rewired: usize,
    pub ids_renamed: usize,
    pub warnings: Vec<String>,
}

/// A fully resolved merge plan
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApplyPlan {
    pub mode: ApplyMode,
    /// Drop every live module before adding
    pub clear_existing: bool,
    pub transport: Option<TransportSettings>,
    /// Incoming modules under their final ids
    pub modules: Vec<ModuleDef>,
    /// Original id to assigned id, for renamed modules only
    pub renamed: BTreeMap<String, String>,
    pub entry: Option<String>,
    pub exit: Option<String>,
    pub remove: Vec<Connection>,
    pub add: Vec<Connection>,
    pub warnings: Vec<String>,
}

impl ApplyPlan {
    pub fn summary(&self) -> ApplySummary {
        ApplySummary {
            modules_added: self.modules.len(),
            connections_added: self.add.len(),
            routes_rewired: self.remove.len(),
            ids_renamed: self.renamed.len(),
            warnings: self.warnings.clone(),
        }
    }
}

/// Smallest `-N` suffix that collides with nothing live, incoming or
/// already assigned
fn remap_ids(
    graph: &ModuleGraph,
    modules: &[ModuleDef],
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let incoming: HashSet<&str> = modules.iter().map(|m| m.id.as_str()).collect();
    let mut assigned: HashSet<String> = HashSet::new();
    let mut mapping = BTreeMap::new();
    let mut renamed = BTreeMap::new();

    for module in modules {
        let id = if graph.contains(&module.id) {
            let fresh = (1..)
                .map(|n| format!("{}-{n}", module.id))
                .find(|candidate| {
                    !graph.contains(candidate)
                        && !incoming.contains(candidate.as_str())
                        && !assigned.contains(candidate)
                })
                .unwrap_or_else(|| module.id.clone());
            renamed.insert(module.id.clone(), fresh.clone());
            fresh
        } else {
            module.id.clone()
        };
        assigned.insert(id.clone());
        mapping.insert(module.id.clone(), id);
    }
    (mapping, renamed)
}

/// Incoming-side view used for entry/exit inference
struct Incoming<'a> {
    modules: &'a [ModuleDef],
    connections: &'a [Connection],
    document: &'a PatchDocument,
}

impl Incoming<'_> {
    fn is_audio(&self, connection: &Connection) -> bool {
        self.document.connection_kind(connection) == Some(PortKind::Audio)
    }

    fn entry(&self) -> Option<String> {
        self.modules
            .iter()
            .find(|m| {
                !self
                    .connections
                    .iter()
                    .any(|c| c.target_module_id == m.id && self.is_audio(c))
            })
            .or_else(|| self.modules.first())
            .map(|m| m.id.clone())
    }

    fn exit(&self) -> Option<String> {
        let to_master = self
            .connections
            .iter()
            .find(|c| c.target_module_id == MASTER_ID && self.is_audio(c))
            .map(|c| c.source_module_id.clone());
        to_master
            .or_else(|| {
                self.modules
                    .iter()
                    .find(|m| {
                        !self.connections.iter().any(|c| {
                            c.source_module_id == m.id
                                && c.target_module_id != MASTER_ID
                                && self.is_audio(c)
                        })
                    })
                    .map(|m| m.id.clone())
            })
            .or_else(|| self.modules.last().map(|m| m.id.clone()))
    }
}

/// Live audio cables leaving (`outgoing`) or entering `id`
fn live_audio(graph: &ModuleGraph, id: &str, outgoing: bool) -> Vec<Connection> {
    graph
        .cables()
        .iter()
        .filter(|c| c.kind == PortKind::Audio)
        .filter(|c| {
            if outgoing {
                c.connection.source_module_id == id
            } else {
                c.connection.target_module_id == id
            }
        })
        .map(|c| c.connection.clone())
        .collect()
}

/// Compute the merge plan. Never touches the live graph.
pub fn plan(graph: &ModuleGraph, document: &PatchDocument, options: &ApplyOptions) -> ApplyPlan {
    let (document, mut warnings) = document.clone().sanitize();
    let replace = options.mode == ApplyMode::Replace;

    let (mapping, renamed) = if replace {
        let identity = document
            .modules
            .iter()
            .map(|m| (m.id.clone(), m.id.clone()))
            .collect();
        (identity, BTreeMap::new())
    } else {
        remap_ids(graph, &document.modules)
    };
    let rename = |id: &str| mapping.get(id).cloned().unwrap_or_else(|| id.to_string());

    let mut modules: Vec<ModuleDef> = document
        .modules
        .iter()
        .map(|m| ModuleDef {
            id: rename(&m.id),
            ..m.clone()
        })
        .collect();
    for module in &mut modules {
        if let Err(err) = ModuleState::from_value(module.kind, &module.state) {
            warnings.push(format!("{}: {err}; defaults kept", module.id));
            module.state = serde_json::Value::Object(Default::default());
        }
    }

    let connections: Vec<Connection> = document
        .connections
        .iter()
        .map(|c| Connection {
            source_module_id: rename(&c.source_module_id),
            target_module_id: rename(&c.target_module_id),
            ..c.clone()
        })
        .collect();
    let remapped = PatchDocument {
        transport: document.transport,
        modules: modules.clone(),
        connections: connections.clone(),
    };
    let incoming = Incoming {
        modules: &modules,
        connections: &connections,
        document: &remapped,
    };
    let entry = incoming.entry();
    let exit = incoming.exit();

    let (internal, master_routes): (Vec<Connection>, Vec<Connection>) = connections
        .iter()
        .cloned()
        .partition(|c| c.target_module_id != MASTER_ID);
    let ensure_master = |exit: &Option<String>| -> Vec<Connection> {
        if master_routes.is_empty() {
            exit.iter().map(|e| Connection::audio(e.clone(), MASTER_ID)).collect()
        } else {
            master_routes.clone()
        }
    };

    let target = options
        .target_module_id
        .as_deref()
        .filter(|id| *id != MASTER_ID);
    let target = match target {
        Some(id) if graph.contains(id) => Some(id.to_string()),
        Some(id) => {
            warnings.push(format!("target module {id:?} not found"));
            None
        }
        None => None,
    };

    let mut remove = Vec::new();
    let mut add = Vec::new();

    match options.mode {
        ApplyMode::Replace => {
            remove = graph.snapshot_connections();
            add = connections.clone();
        }
        ApplyMode::AddChain => {
            add.extend(internal.iter().cloned());
            match (options.target_type, target.as_deref(), &entry, &exit) {
                (TargetType::AfterModule, Some(t), Some(entry), Some(exit)) => {
                    remove = live_audio(graph, t, true);
                    add.push(Connection::audio(t, entry.clone()));
                    if remove.is_empty() {
                        add.push(Connection::audio(exit.clone(), MASTER_ID));
                    }
                    for old in &remove {
                        add.push(Connection::new(
                            exit.clone(),
                            DEFAULT_PORT,
                            old.target_module_id.clone(),
                            old.target_port_id.clone(),
                        ));
                    }
                }
                (TargetType::BeforeModule, Some(t), Some(entry), Some(exit)) => {
                    remove = live_audio(graph, t, false);
                    for old in &remove {
                        add.push(Connection::new(
                            old.source_module_id.clone(),
                            old.source_port_id.clone(),
                            entry.clone(),
                            DEFAULT_PORT,
                        ));
                    }
                    add.push(Connection::audio(exit.clone(), t));
                }
                (TargetType::ParallelModule, Some(t), Some(entry), Some(exit)) => {
                    for source in live_audio(graph, t, false) {
                        add.push(Connection::new(
                            source.source_module_id,
                            source.source_port_id,
                            entry.clone(),
                            DEFAULT_PORT,
                        ));
                    }
                    let destinations = live_audio(graph, t, true);
                    if destinations.is_empty() {
                        add.push(Connection::audio(exit.clone(), MASTER_ID));
                    }
                    for old in destinations {
                        add.push(Connection::new(
                            exit.clone(),
                            DEFAULT_PORT,
                            old.target_module_id,
                            old.target_port_id,
                        ));
                    }
                }
                (TargetType::Master, ..) => add.extend(ensure_master(&exit)),
                _ => {
                    warnings.push("chain target unavailable; routed to master".to_string());
                    add.extend(ensure_master(&exit));
                }
            }
        }
        ApplyMode::AddSend => {
            add.extend(internal.iter().cloned());
            match (target.as_deref(), &entry) {
                (Some(t), Some(entry)) => add.push(Connection::audio(t, entry.clone())),
                _ => warnings.push("send needs a target module; no send created".to_string()),
            }
            add.extend(ensure_master(&exit));
        }
        ApplyMode::AddLayer => {
            add.extend(internal.iter().cloned());
            match (target.as_deref(), &exit) {
                (Some(t), Some(exit)) => {
                    let destinations = live_audio(graph, t, true);
                    if destinations.is_empty() {
                        add.push(Connection::audio(exit.clone(), MASTER_ID));
                    }
                    for old in destinations {
                        add.push(Connection::new(
                            exit.clone(),
                            DEFAULT_PORT,
                            old.target_module_id,
                            old.target_port_id,
                        ));
                    }
                }
                _ => add.extend(ensure_master(&exit)),
            }
        }
        ApplyMode::AddModulation => {
            add.extend(internal.iter().cloned());
            let source = MODULATION_SOURCE_PREFERENCE
                .iter()
                .find_map(|kind| modules.iter().find(|m| m.kind == *kind))
                .map(|m| m.id.clone())
                .or_else(|| exit.clone());
            let port = target.as_deref().and_then(|t| {
                let spec = graph.kind_of(t)?.port_spec();
                MODULATION_PORT_PREFERENCE
                    .iter()
                    .copied()
                    .find(|p| spec.input(p).map(|d| d.kind) == Some(PortKind::Cv))
                    .map(|p| (t, p))
            });
            match (source, port) {
                (Some(source), Some((t, port))) => {
                    add.push(Connection::new(source, DEFAULT_PORT, t, port));
                }
                (_, None) => {
                    warnings.push("modulation target has no CV input; nothing wired".to_string())
                }
                (None, _) => warnings.push("document has no modulation source".to_string()),
            }
        }
    }

    let add = validate_additions(graph, &remapped, add, &remove, replace, &mut warnings);
    let (remove, add) = if replace {
        (remove, add)
    } else {
        drop_overlap(remove, add, &mut warnings)
    };

    ApplyPlan {
        mode: options.mode,
        clear_existing: replace,
        transport: if replace { document.transport } else { None },
        modules,
        renamed,
        entry,
        exit,
        remove,
        add,
        warnings,
    }
}

/// Drop planned connections that could never be made: unknown endpoints,
/// missing ports, incompatible kinds, or duplicates of live cables.
fn validate_additions(
    graph: &ModuleGraph,
    incoming: &PatchDocument,
    add: Vec<Connection>,
    remove: &[Connection],
    replace: bool,
    warnings: &mut Vec<String>,
) -> Vec<Connection> {
    let kind_of = |id: &str| {
        incoming
            .kind_of(id)
            .or_else(|| if replace { None } else { graph.kind_of(id) })
    };
    let mut seen = HashSet::new();
    let mut valid = Vec::with_capacity(add.len());

    for connection in add {
        if !seen.insert(connection.clone()) {
            continue;
        }
        let (Some(source), Some(target)) = (
            kind_of(&connection.source_module_id),
            kind_of(&connection.target_module_id),
        ) else {
            warnings.push(format!("dropped {connection}: unknown endpoint"));
            continue;
        };
        if let Err(err) = resolve_kind(
            source,
            &connection.source_port_id,
            target,
            &connection.target_port_id,
        ) {
            warnings.push(format!("dropped {connection}: {err}"));
            continue;
        }
        if !replace && graph.has_connection(&connection) && !remove.contains(&connection) {
            warnings.push(format!("dropped {connection}: already connected"));
            continue;
        }
        valid.push(connection);
    }
    valid
}

/// A connection must never be both removed and added in one plan
fn drop_overlap(
    remove: Vec<Connection>,
    add: Vec<Connection>,
    warnings: &mut Vec<String>,
) -> (Vec<Connection>, Vec<Connection>) {
    let overlap: HashSet<Connection> = remove.iter().filter(|c| add.contains(c)).cloned().collect();
    if overlap.is_empty() {
        return (remove, add);
    }
    for connection in &overlap {
        warnings.push(format!("{connection} is both removed and added; left unchanged"));
    }
    (
        remove.into_iter().filter(|c| !overlap.contains(c)).collect(),
        add.into_iter().filter(|c| !overlap.contains(c)).collect(),
    )
}

/// Report what [`apply`] would do, without mutating anything
pub fn preview(
    graph: &ModuleGraph,
    document: &PatchDocument,
    options: &ApplyOptions,
) -> ApplySummary {
    plan(graph, document, options).summary()
}

/// Plan and commit. The summary counts what actually happened.
pub fn apply(
    ctx: &mut AudioContext,
    graph: &mut ModuleGraph,
    transport: &mut Transport,
    document: &PatchDocument,
    options: &ApplyOptions,
) -> ApplySummary {
    let plan = plan(graph, document, options);
    commit(ctx, graph, transport, plan)
}

/// Commit a plan: modules first, then removals, then additions
pub fn commit(
    ctx: &mut AudioContext,
    graph: &mut ModuleGraph,
    transport: &mut Transport,
    plan: ApplyPlan,
) -> ApplySummary {
    let mut summary = ApplySummary {
        ids_renamed: plan.renamed.len(),
        warnings: plan.warnings,
        ..Default::default()
    };

    if plan.clear_existing {
        summary.routes_rewired = graph.cables().len();
        graph.clear(ctx);
        if let Some(settings) = plan.transport {
            settings.apply(ctx, transport);
        }
    }

    for module in &plan.modules {
        match graph.add_module(ctx, &module.id, module.kind, (module.x, module.y)) {
            Ok(_) => {
                summary.modules_added += 1;
                if let Err(err) = graph.set_state(ctx, &module.id, &module.state) {
                    summary.warnings.push(err.to_string());
                }
            }
            Err(err) => summary
                .warnings
                .push(format!("module {:?} not added: {err}", module.id)),
        }
    }

    if !plan.clear_existing {
        for connection in &plan.remove {
            match graph.disconnect(ctx, connection) {
                Ok(()) => summary.routes_rewired += 1,
                Err(err) => summary.warnings.push(format!("{connection} not removed: {err}")),
            }
        }
    }

    for connection in plan.add {
        let label = connection.to_string();
        match graph.connect(ctx, connection) {
            Ok(_) => summary.connections_added += 1,
            Err(err) => summary.warnings.push(format!("{label} not added: {err}")),
        }
    }

    tracing::debug!(
        mode = ?plan.mode,
        modules = summary.modules_added,
        connections = summary.connections_added,
        rewired = summary.routes_rewired,
        renamed = summary.ids_renamed,
        "patch applied"
    );
    for warning in &summary.warnings {
        tracing::warn!("{warning}");
    }
    summary
}
