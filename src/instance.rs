//! Nested graph instancing: a node that embeds an entire other graph and
//! forwards its Input/Output nodes as ports.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::archive::MatArchive;
use crate::environment::Environment;
use crate::function::VarScope;
use crate::gpu::RenderResources;
use crate::graph::Graph;
use crate::node::{
    NodeData, NodeOp, NodeShell, ProcessContext, ProcessOutcome, read_binary_record,
    write_binary_record,
};
use crate::nodes::input::InputNode;
use crate::param::{ParamBinding, ParameterStore, ParameterValue};
use crate::port::{NodeInput, NodeOutput, OutputData, PortRef};
use crate::value::{TypeMask, Value};

const BINARY_VERSION: u16 = 1;

/// Port changes made by a (re)load, handed back to the owning graph so it can
/// keep external wiring consistent.
#[derive(Debug, Default)]
pub struct SetupReport {
    /// Producer links whose consumer-side input slot no longer exists.
    pub removed_input_links: Vec<(PortRef, usize)>,
    /// Consumers whose producer-side output slot no longer exists.
    pub removed_consumers: Vec<PortRef>,
    pub added_inputs: usize,
    pub removed_inputs: usize,
    pub added_outputs: usize,
    pub removed_outputs: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct InstanceFields {
    path: String,
    /// Last successfully serialized inner graph, base64 of its JSON; the
    /// final fallback when every other source fails.
    raw_data: Option<String>,
    parameters: BTreeMap<String, Value>,
    custom_parameters: BTreeMap<String, Value>,
    random_seed: i32,
}

#[derive(Serialize, Deserialize)]
struct InstanceRecord {
    #[serde(flatten)]
    base: NodeData,
    #[serde(flatten)]
    fields: InstanceFields,
}

/// A node wrapping a child [`Graph`]. The inner graph's declared Input and
/// Output nodes become this node's ports; outer parameters cascade down
/// lazily through the dirty flag.
pub struct GraphInstanceNode {
    pub inner: Option<Graph>,
    pub path: String,
    raw_data: Option<String>,
    name_map: HashMap<String, usize>,
    stored_parameters: BTreeMap<String, Value>,
    stored_custom: BTreeMap<String, Value>,
    dirty: bool,
    random_seed: i32,
}

impl Default for GraphInstanceNode {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphInstanceNode {
    pub fn new() -> Self {
        Self {
            inner: None,
            path: String::new(),
            raw_data: None,
            name_map: HashMap::new(),
            stored_parameters: BTreeMap::new(),
            stored_custom: BTreeMap::new(),
            dirty: false,
            random_seed: 0,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Seed the embedded-data fallback directly (hosts that create instances
    /// from in-memory definitions rather than files).
    pub fn set_source_data(&mut self, json: impl Into<String>) {
        self.raw_data = Some(json.into());
    }

    /// Mark derived parameters stale here and in every nested instance
    /// beneath. Repopulation happens lazily on next evaluation.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        if let Some(inner) = self.inner.as_mut() {
            for entry in inner.nodes.values_mut() {
                if let Some(nested) = entry.op.as_any_mut().downcast_mut::<GraphInstanceNode>() {
                    nested.mark_dirty();
                }
            }
        }
    }

    pub fn assign_seed(&mut self, seed: i32) {
        self.random_seed = seed;
        if let Some(inner) = self.inner.as_mut() {
            inner.assign_seed(seed);
        }
    }

    /// O(1) lookup of an inner custom parameter by name.
    pub fn custom_parameter(&self, name: &str) -> Option<&ParameterValue> {
        let index = *self.name_map.get(name)?;
        self.inner.as_ref()?.params.custom.get(index)
    }

    /// Resolve and load the sub-graph definition, trying each source in
    /// priority order: open container archive, absolute path, shelf/library
    /// path, embedded raw data. A failure falls through to the next source;
    /// total failure leaves the previous inner graph untouched and returns
    /// `false`.
    pub fn load(
        &mut self,
        shell: &mut NodeShell,
        env: &Environment,
        archive: Option<&MatArchive>,
        mut res: Option<&mut RenderResources>,
    ) -> (bool, SetupReport) {
        let file_name = Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_default();

        let mut sources: Vec<(String, Option<String>)> = Vec::new();
        if let Some(archive) = archive {
            for candidate in [self.path.as_str(), file_name.as_str()] {
                if !candidate.is_empty() && archive.contains(candidate) {
                    sources.push((
                        format!("archive entry '{candidate}'"),
                        archive.read_entry_string(candidate).ok(),
                    ));
                    break;
                }
            }
        }
        if !self.path.is_empty() && Path::new(&self.path).is_file() {
            sources.push((
                format!("path '{}'", self.path),
                std::fs::read_to_string(&self.path).ok(),
            ));
        }
        if !file_name.is_empty() {
            if let Some(shelf) = env.resolve_library(&file_name) {
                sources.push((
                    format!("library '{}'", shelf.display()),
                    std::fs::read_to_string(&shelf).ok(),
                ));
            }
        }
        if let Some(raw) = self.raw_data.clone() {
            sources.push(("embedded data".to_string(), Some(raw)));
        }

        for (origin, text) in sources {
            let Some(text) = text else {
                log::warn!("[instance] could not read {origin}, trying next source");
                continue;
            };
            match Graph::from_json_with_archive(&text, archive, env.clone()) {
                Ok(mut graph) => {
                    if let Some(res) = res.as_deref_mut() {
                        if let Some(mut old) = self.inner.take() {
                            old.dispose(res);
                        }
                    } else {
                        self.inner = None;
                    }
                    graph.read_only = true;
                    graph.assign_seed(self.random_seed);
                    if shell.name.is_empty() {
                        shell.name = graph.name.clone();
                    }
                    self.raw_data = Some(text);
                    self.inner = Some(graph);
                    self.apply_stored_parameters();
                    let report = self.setup(shell);
                    self.dirty = true;
                    return (true, report);
                }
                Err(e) => {
                    log::warn!("[instance] failed to load from {origin}: {e:#}");
                }
            }
        }

        log::warn!(
            "[instance] no usable source for '{}'; keeping last good state",
            self.path
        );
        (false, SetupReport::default())
    }

    /// Push the record's persisted parameter values onto the freshly loaded
    /// inner graph, skipping slots bound to functions.
    fn apply_stored_parameters(&mut self) {
        let Some(inner) = self.inner.as_mut() else {
            return;
        };
        for (key, value) in &self.stored_parameters {
            if let Some(param) = inner.params.parameters.get_mut(key) {
                if !param.is_function() {
                    param.assign_value(*value);
                }
            }
        }
        for (name, value) in &self.stored_custom {
            if let Some(param) = inner.params.custom_by_name_mut(name) {
                if !param.is_function() {
                    param.assign_value(*value);
                }
            }
        }
    }

    /// Rebuild this node's ports from the inner graph's declared Input and
    /// Output nodes, preserving existing external connections positionally
    /// while counts allow. The report lists everything the owning graph must
    /// unlink.
    fn setup(&mut self, shell: &mut NodeShell) -> SetupReport {
        let mut report = SetupReport::default();
        let Some(inner) = self.inner.as_ref() else {
            return report;
        };

        let old_inputs = std::mem::take(&mut shell.inputs);
        let old_outputs = std::mem::take(&mut shell.outputs);
        let (old_input_count, old_output_count) = (old_inputs.len(), old_outputs.len());

        for id in &inner.input_nodes {
            let name = inner
                .node(id)
                .map(|e| e.shell.name.clone())
                .unwrap_or_default();
            shell.inputs.push(NodeInput::new(TypeMask::IMAGE, name));
        }
        for id in &inner.output_nodes {
            let name = inner
                .node(id)
                .map(|e| e.shell.name.clone())
                .unwrap_or_default();
            shell.outputs.push(NodeOutput::new(TypeMask::IMAGE, name));
        }

        for (i, old) in old_inputs.into_iter().enumerate() {
            match shell.inputs.get_mut(i) {
                Some(new) => new.reference = old.reference,
                None => {
                    if let Some(reference) = old.reference {
                        report.removed_input_links.push((reference, i));
                    }
                    report.removed_inputs += 1;
                }
            }
        }
        for (o, old) in old_outputs.into_iter().enumerate() {
            match shell.outputs.get_mut(o) {
                Some(new) => new.to = old.to,
                None => {
                    report.removed_consumers.extend(old.to);
                    report.removed_outputs += 1;
                }
            }
        }
        report.added_inputs = shell.inputs.len().saturating_sub(old_input_count);
        report.added_outputs = shell.outputs.len().saturating_sub(old_output_count);

        self.name_map.clear();
        for (index, param) in inner.params.custom.iter().enumerate() {
            self.name_map.insert(param.name.clone(), index);
        }
        report
    }

    /// Copy every same-keyed outer parameter value down onto the inner graph:
    /// inherited `"nodeId.prop"` keys first, then custom parameters keyed by
    /// `(instance id, name)`. Clears the dirty flag; an immediate repeat call
    /// is a no-op.
    pub fn populate_graph_params(
        &mut self,
        instance_id: &str,
        outer: &ParameterStore,
        scope: &VarScope,
    ) -> bool {
        if !self.dirty {
            return false;
        }
        let Some(inner) = self.inner.as_mut() else {
            self.dirty = false;
            return false;
        };

        let keys: Vec<String> = inner.params.parameters.keys().cloned().collect();
        for key in keys {
            let Some((node_id, prop)) = key.split_once('.') else {
                continue;
            };
            if inner
                .params
                .parameters
                .get(&key)
                .is_some_and(ParameterValue::is_function)
            {
                continue;
            }
            if outer.has_value(node_id, prop) {
                if let Some(value) = outer.resolve(node_id, prop, scope) {
                    if let Some(param) = inner.params.parameters.get_mut(&key) {
                        param.assign_value(value.convert_to(param.kind));
                    }
                }
            }
        }

        for index in 0..inner.params.custom.len() {
            let (name, kind, is_function) = {
                let param = &inner.params.custom[index];
                (param.name.clone(), param.kind, param.is_function())
            };
            if is_function {
                continue;
            }
            if outer.has_value(instance_id, &name) {
                if let Some(value) = outer.resolve(instance_id, &name, scope) {
                    inner.params.custom[index].assign_value(value.convert_to(kind));
                }
            }
        }

        self.dirty = false;
        true
    }

    fn record(&self, shell: &NodeShell) -> InstanceRecord {
        let mut parameters = BTreeMap::new();
        let mut custom_parameters = BTreeMap::new();
        if let Some(inner) = self.inner.as_ref() {
            for (key, param) in &inner.params.parameters {
                if let ParamBinding::Literal(v) = &param.binding {
                    parameters.insert(key.clone(), *v);
                }
            }
            for param in &inner.params.custom {
                if let ParamBinding::Literal(v) = &param.binding {
                    custom_parameters.insert(param.name.clone(), *v);
                }
            }
        } else {
            parameters = self.stored_parameters.clone();
            custom_parameters = self.stored_custom.clone();
        }

        InstanceRecord {
            base: NodeData::from_shell(shell, self.type_name()),
            fields: InstanceFields {
                path: self.path.clone(),
                raw_data: self.raw_data.as_ref().map(|raw| BASE64.encode(raw)),
                parameters,
                custom_parameters,
                random_seed: self.random_seed,
            },
        }
    }

    fn restore(
        &mut self,
        shell: &mut NodeShell,
        record: InstanceRecord,
        archive: Option<&MatArchive>,
        env: &Environment,
    ) -> Result<()> {
        record.base.apply_to(shell);
        self.path = record.fields.path;
        self.raw_data = match record.fields.raw_data {
            Some(encoded) => Some(
                String::from_utf8(
                    BASE64
                        .decode(encoded.as_bytes())
                        .context("instance raw data is not valid base64")?,
                )
                .context("instance raw data is not utf-8")?,
            ),
            None => None,
        };
        self.stored_parameters = record.fields.parameters;
        self.stored_custom = record.fields.custom_parameters;
        self.random_seed = record.fields.random_seed;

        let (loaded, _report) = self.load(shell, env, archive, None);
        if !loaded {
            log::warn!(
                "[instance] '{}' restored without a usable sub-graph",
                shell.id
            );
        }
        // Fan-out lists land on the ports the load just created.
        record.base.apply_connections(shell);
        Ok(())
    }
}

impl NodeOp for GraphInstanceNode {
    fn type_name(&self) -> &'static str {
        "graph_instance"
    }

    fn init(&self, _shell: &mut NodeShell) {
        // Ports come from the loaded inner graph, not the node type.
    }

    fn process(&mut self, shell: &mut NodeShell, ctx: &mut ProcessContext<'_>) -> ProcessOutcome {
        if self.inner.is_none() {
            return ProcessOutcome::unchanged();
        }

        // Follow the host node's size before evaluating.
        let needs_resize = self
            .inner
            .as_ref()
            .is_some_and(|g| g.width != shell.width || g.height != shell.height);
        if needs_resize {
            if let Some(inner) = self.inner.as_mut() {
                inner.resize_with(shell.width, shell.height, ctx.res);
            }
        }

        if self.dirty {
            let scope = ctx.function_scope(shell);
            let instance_id = shell.id.clone();
            self.populate_graph_params(&instance_id, ctx.params, &scope);
        }

        // Feed outer input data to the inner graph's Input nodes.
        let bindings: Vec<Option<OutputData>> = (0..shell.inputs.len())
            .map(|i| ctx.input_texture(shell, i).map(OutputData::Texture))
            .collect();
        let inner = match self.inner.as_mut() {
            Some(inner) => inner,
            None => return ProcessOutcome::unchanged(),
        };
        for (i, id) in inner.input_nodes.clone().iter().enumerate() {
            if let Some(entry) = inner.node_mut(id) {
                if let Some(op) = entry.op.as_any_mut().downcast_mut::<InputNode>() {
                    op.external = bindings.get(i).cloned().flatten();
                }
            }
        }

        inner.try_and_process(ctx.res);

        let mut changed = Vec::new();
        for (o, id) in inner.output_nodes.clone().iter().enumerate() {
            let data = inner.output_data(id, 0).cloned();
            if let (Some(slot), Some(data)) = (shell.outputs.get_mut(o), data) {
                slot.data = Some(data);
                changed.push(o);
            }
        }
        ProcessOutcome { changed }
    }

    fn get_json(&self, shell: &NodeShell) -> Result<String> {
        Ok(serde_json::to_string(&self.record(shell))?)
    }

    fn from_json(&mut self, shell: &mut NodeShell, data: &str) -> Result<()> {
        let record: InstanceRecord = serde_json::from_str(data)?;
        self.restore(shell, record, None, &Environment::new())
    }

    fn from_json_with_archive(
        &mut self,
        shell: &mut NodeShell,
        data: &str,
        archive: Option<&MatArchive>,
        env: &Environment,
    ) -> Result<()> {
        let record: InstanceRecord = serde_json::from_str(data)?;
        self.restore(shell, record, archive, env)
    }

    fn get_binary(&self, shell: &NodeShell, w: &mut dyn Write) -> Result<()> {
        let record = self.record(shell);
        write_binary_record(w, BINARY_VERSION, &record.base, &record.fields)
    }

    fn from_binary(&mut self, shell: &mut NodeShell, r: &mut dyn Read) -> Result<()> {
        let (_, base, fields): (u16, NodeData, InstanceFields) =
            read_binary_record(r, BINARY_VERSION)?;
        self.restore(shell, InstanceRecord { base, fields }, None, &Environment::new())
    }

    fn dispose(&mut self, _shell: &mut NodeShell, res: &mut RenderResources) {
        // The inner graph goes down before the instance itself.
        if let Some(mut inner) = self.inner.take() {
            inner.dispose(res);
        }
        self.name_map.clear();
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Graph {
    /// Reload a graph instance in place (optionally pointing it at a new
    /// path) and reconcile the hosting graph's wiring with the ports that
    /// appeared or disappeared.
    pub fn reload_instance(
        &mut self,
        id: &str,
        path: Option<&str>,
        archive: Option<&MatArchive>,
        res: &mut RenderResources,
    ) -> Result<()> {
        let mut entry = self
            .nodes
            .remove(id)
            .ok_or_else(|| anyhow!("unknown node '{id}'"))?;

        let env = self.env.clone();
        let (loaded, report) = match entry.op.as_any_mut().downcast_mut::<GraphInstanceNode>() {
            Some(instance) => {
                if let Some(path) = path {
                    instance.path = path.to_string();
                }
                instance.load(&mut entry.shell, &env, archive, Some(res))
            }
            None => {
                self.nodes.insert(id.to_string(), entry);
                return Err(anyhow!("node '{id}' is not a graph instance"));
            }
        };
        self.nodes.insert(id.to_string(), entry);

        // Apply the port-change report: drop links whose slots disappeared.
        for (producer, in_index) in &report.removed_input_links {
            if let Some(entry) = self.nodes.get_mut(&producer.node) {
                if let Some(output) = entry.shell.outputs.get_mut(producer.index) {
                    output.to.retain(|r| !(r.node == id && r.index == *in_index));
                }
            }
        }
        for consumer in &report.removed_consumers {
            if let Some(entry) = self.nodes.get_mut(&consumer.node) {
                if let Some(input) = entry.shell.inputs.get_mut(consumer.index) {
                    input.reference = None;
                }
            }
        }

        if loaded {
            self.process_node(id, res);
        }
        Ok(())
    }
}
