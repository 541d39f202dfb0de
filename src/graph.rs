use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::archive::MatArchive;
use crate::environment::Environment;
use crate::function::VarScope;
use crate::gpu::RenderResources;
use crate::instance::GraphInstanceNode;
use crate::node::{DEFAULT_NODE_SIZE, NodeData, NodeEntry, NodeState, ProcessContext};
use crate::param::{ParamBinding, ParameterStore};
use crate::port::{NodeOutput, OutputData, PortRef};
use crate::schedule::{GatherJob, Scheduler};
use crate::value::{PixelFormat, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Loading,
    Ready,
}

pub const GRAPH_SIZES: [u32; 10] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Serialized form of a whole graph. Node records are kept as raw JSON values
/// so each node type round-trips its own fields.
#[derive(Debug, Serialize, Deserialize)]
pub struct GraphData {
    pub id: String,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub absolute_size: bool,
    pub default_format: PixelFormat,
    pub random_seed: i32,
    pub nodes: Vec<serde_json::Value>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub parameters: ParameterStore,
}

/// Owner of the node set, the parameter table and the schedule queue; drives
/// evaluation by push-based change propagation.
pub struct Graph {
    pub id: String,
    pub name: String,
    pub(crate) nodes: HashMap<String, NodeEntry>,
    order: Vec<String>,
    pub input_nodes: Vec<String>,
    pub output_nodes: Vec<String>,
    pub params: ParameterStore,
    pub vars: VarScope,
    pub width: u32,
    pub height: u32,
    pub absolute_size: bool,
    pub default_format: PixelFormat,
    pub random_seed: i32,
    pub read_only: bool,
    pub modified: bool,
    pub state: GraphState,
    pub cwd: PathBuf,
    pub env: Environment,
    origin_sizes: HashMap<String, (u32, u32)>,
    sched: Scheduler,
}

impl Graph {
    pub fn new(name: impl Into<String>, width: u32, height: u32, env: Environment) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            nodes: HashMap::new(),
            order: Vec::new(),
            input_nodes: Vec::new(),
            output_nodes: Vec::new(),
            params: ParameterStore::new(),
            vars: VarScope::new(),
            width,
            height,
            absolute_size: false,
            default_format: PixelFormat::default(),
            random_seed: 0,
            read_only: false,
            modified: false,
            state: GraphState::Ready,
            cwd: PathBuf::new(),
            env,
            origin_sizes: HashMap::new(),
            sched: Scheduler::new(),
        }
    }

    pub fn with_default_size(name: impl Into<String>, env: Environment) -> Self {
        Self::new(name, DEFAULT_NODE_SIZE, DEFAULT_NODE_SIZE, env)
    }

    /// Replace the scheduler's debounce window (tests use zero).
    pub fn set_schedule_debounce(&mut self, debounce: Duration) {
        self.sched = Scheduler::with_debounce(debounce);
    }

    // ---- node set -------------------------------------------------------

    /// Insert a node. Initializes its ports when still uninitialized and
    /// records its origin size for proportional resizes. O(1).
    pub fn add(&mut self, mut entry: NodeEntry) -> String {
        if entry.shell.state == NodeState::Uninitialized {
            entry.op.init(&mut entry.shell);
            entry.shell.state = NodeState::Ready;
        }
        let id = entry.shell.id.clone();
        match entry.op.type_name() {
            "graph_input" => self.input_nodes.push(id.clone()),
            "graph_output" => self.output_nodes.push(id.clone()),
            _ => {}
        }
        self.origin_sizes
            .insert(id.clone(), (entry.shell.width, entry.shell.height));
        if !self.nodes.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.nodes.insert(id.clone(), entry);
        self.modified = true;
        id
    }

    /// Remove a node, bidirectionally unlinking every port it touches before
    /// disposing it. Neither side is ever left with a dangling reference.
    pub fn remove(&mut self, id: &str, res: &mut RenderResources) {
        let Some(mut entry) = self.nodes.remove(id) else {
            return;
        };

        // Producers this node consumed from drop it from their fan-out.
        for (in_index, input) in entry.shell.inputs.iter_mut().enumerate() {
            if let Some(reference) = input.reference.take() {
                if let Some(producer) = self.nodes.get_mut(&reference.node) {
                    if let Some(output) = producer.shell.outputs.get_mut(reference.index) {
                        output.to.retain(|r| !(r.node == id && r.index == in_index));
                    }
                }
            }
        }
        // Consumers of this node null their reference.
        for output in &mut entry.shell.outputs {
            for consumer in output.to.drain(..) {
                if let Some(target) = self.nodes.get_mut(&consumer.node) {
                    if let Some(input) = target.shell.inputs.get_mut(consumer.index) {
                        input.reference = None;
                    }
                }
            }
        }

        entry.op.dispose(&mut entry.shell, res);
        entry.shell.dispose(res);

        self.order.retain(|n| n != id);
        self.input_nodes.retain(|n| n != id);
        self.output_nodes.retain(|n| n != id);
        self.origin_sizes.remove(id);
        self.sched.cancel(id);
        self.modified = true;
    }

    pub fn node(&self, id: &str) -> Option<&NodeEntry> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut NodeEntry> {
        self.nodes.get_mut(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn output_data(&self, id: &str, out_index: usize) -> Option<&OutputData> {
        self.nodes.get(id)?.shell.outputs.get(out_index)?.data.as_ref()
    }

    // ---- wiring ---------------------------------------------------------

    /// Atomically connect `from.out_index -> to.in_index`. The input's old
    /// producer (if any) is unlinked before the new link lands; no
    /// half-connected state is observable. Triggers the consumer's
    /// processing.
    pub fn connect(
        &mut self,
        from: &str,
        out_index: usize,
        to: &str,
        in_index: usize,
        res: &mut RenderResources,
    ) -> Result<()> {
        if from == to {
            bail!("cannot connect node '{from}' to itself");
        }
        let produces = {
            let producer = self
                .nodes
                .get(from)
                .ok_or_else(|| anyhow!("unknown producer node '{from}'"))?;
            producer
                .shell
                .outputs
                .get(out_index)
                .ok_or_else(|| anyhow!("producer '{from}' has no output {out_index}"))?
                .produces
        };
        let accepts = {
            let consumer = self
                .nodes
                .get(to)
                .ok_or_else(|| anyhow!("unknown consumer node '{to}'"))?;
            consumer
                .shell
                .inputs
                .get(in_index)
                .ok_or_else(|| anyhow!("consumer '{to}' has no input {in_index}"))?
                .accepts
        };
        if !accepts.accepts(produces) {
            bail!("type mismatch: '{from}'[{out_index}] does not satisfy '{to}'[{in_index}]");
        }

        // Unlink the input's previous producer first.
        let old = self
            .nodes
            .get_mut(to)
            .and_then(|c| c.shell.inputs[in_index].reference.take());
        let old_producer_id = old.as_ref().map(|r| r.node.clone());
        if let Some(old_ref) = old {
            if let Some(producer) = self.nodes.get_mut(&old_ref.node) {
                if let Some(output) = producer.shell.outputs.get_mut(old_ref.index) {
                    output.to.retain(|r| !(r.node == to && r.index == in_index));
                }
            }
        }

        if let Some(consumer) = self.nodes.get_mut(to) {
            consumer.shell.inputs[in_index].reference = Some(PortRef::new(from, out_index));
        }
        if let Some(producer) = self.nodes.get_mut(from) {
            producer.shell.outputs[out_index]
                .to
                .push(PortRef::new(to, in_index));
        }

        if let Some(old_id) = old_producer_id {
            self.apply_variadic(&old_id);
        }
        self.apply_variadic(from);
        self.modified = true;

        self.process_node(to, res);
        Ok(())
    }

    /// Detach the producer feeding `to.in_index`, leaving both sides
    /// consistent.
    pub fn disconnect(&mut self, to: &str, in_index: usize) {
        let Some(reference) = self
            .nodes
            .get_mut(to)
            .and_then(|c| c.shell.inputs.get_mut(in_index))
            .and_then(|input| input.reference.take())
        else {
            return;
        };
        if let Some(producer) = self.nodes.get_mut(&reference.node) {
            if let Some(output) = producer.shell.outputs.get_mut(reference.index) {
                output.to.retain(|r| !(r.node == to && r.index == in_index));
            }
        }
        self.apply_variadic(&reference.node);
        self.modified = true;
    }

    /// Keep a variadic node's invariant: one trailing empty slot above the
    /// floor, growth when every slot is connected, shrink over empty tails —
    /// never removing a connected slot.
    fn apply_variadic(&mut self, node_id: &str) {
        let Some(entry) = self.nodes.get_mut(node_id) else {
            return;
        };
        let Some(spec) = entry.op.variadic_outputs() else {
            return;
        };
        let produces = match entry.shell.outputs.first() {
            Some(first) => first.produces,
            None => return,
        };

        if !entry.shell.has_empty_output() {
            let name = entry.shell.outputs.len().to_string();
            entry.shell.outputs.push(NodeOutput::new(produces, name));
        }

        while entry.shell.outputs.len() > spec.floor {
            let len = entry.shell.outputs.len();
            if entry.shell.outputs[len - 1].to.is_empty()
                && entry.shell.outputs[len - 2].to.is_empty()
            {
                entry.shell.outputs.pop();
            } else {
                break;
            }
        }
    }

    /// Restore a persisted edge without type checks or processing.
    fn link_raw(&mut self, from: &str, out_index: usize, to: &str, in_index: usize) {
        let ok = self
            .nodes
            .get(from)
            .is_some_and(|p| out_index < p.shell.outputs.len())
            && self
                .nodes
                .get(to)
                .is_some_and(|c| in_index < c.shell.inputs.len());
        if !ok {
            log::warn!(
                "[graph] could not restore a connection {from}[{out_index}] -> {to}[{in_index}]"
            );
            return;
        }
        if let Some(consumer) = self.nodes.get_mut(to) {
            consumer.shell.inputs[in_index].reference = Some(PortRef::new(from, out_index));
        }
        if let Some(producer) = self.nodes.get_mut(from) {
            let target = PortRef::new(to, in_index);
            let fan_out = &mut producer.shell.outputs[out_index].to;
            // The producer side may already be present: node records restore
            // their own fan-out lists.
            if !fan_out.contains(&target) {
                fan_out.push(target);
            }
        }
    }

    // ---- evaluation -----------------------------------------------------

    /// Nodes with no connected input; evaluation starts here and cascades.
    pub fn root_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.nodes
                    .get(*id)
                    .is_some_and(|e| e.shell.inputs.iter().all(|i| !i.has_input()))
            })
            .cloned()
            .collect()
    }

    /// Evaluate the whole graph: process every root and let change
    /// propagation walk the fan-out.
    pub fn try_and_process(&mut self, res: &mut RenderResources) {
        for id in self.root_ids() {
            self.process_node(&id, res);
        }
    }

    /// Run one node's processing routine and push the change to its
    /// consumers. Re-entrant calls on a node already mid-process fall out at
    /// the map lookup (the entry is lifted out for the duration), which keeps
    /// cyclic wiring from recursing forever.
    pub fn process_node(&mut self, id: &str, res: &mut RenderResources) {
        self.process_node_inner(id, res, None);
    }

    fn process_node_inner(
        &mut self,
        id: &str,
        res: &mut RenderResources,
        gathered: Option<&HashMap<String, Value>>,
    ) {
        let Some(mut entry) = self.nodes.remove(id) else {
            return;
        };
        if entry.shell.state == NodeState::Disposed {
            self.nodes.insert(id.to_string(), entry);
            return;
        }

        // Async nodes defer to the schedule queue instead of running inline;
        // the scheduled continuation comes back through here with `gathered`.
        if entry.shell.is_async && gathered.is_none() {
            self.nodes.insert(id.to_string(), entry);
            self.schedule(id);
            return;
        }

        entry.shell.state = NodeState::Processing;
        let outcome = {
            let mut ctx = ProcessContext {
                nodes: &self.nodes,
                params: &self.params,
                vars: &self.vars,
                res,
                env: &self.env,
                graph_width: self.width,
                graph_height: self.height,
                default_format: self.default_format,
                random_seed: self.random_seed,
                gathered,
            };
            entry.op.process(&mut entry.shell, &mut ctx)
        };
        entry.shell.state = NodeState::Ready;

        let mut consumers: Vec<String> = Vec::new();
        for out_index in &outcome.changed {
            if let Some(output) = entry.shell.outputs.get(*out_index) {
                for r in &output.to {
                    if !consumers.contains(&r.node) {
                        consumers.push(r.node.clone());
                    }
                }
            }
        }
        self.nodes.insert(id.to_string(), entry);

        for consumer in consumers {
            self.process_node_inner(&consumer, res, None);
        }
    }

    // ---- deferred scheduling -------------------------------------------

    /// Queue a node for deferred execution; repeated calls before it runs
    /// keep exactly one pending run.
    pub fn schedule(&mut self, id: &str) {
        if !self.nodes.contains_key(id) {
            return;
        }
        self.sched.schedule(id);
    }

    pub fn is_scheduled(&self, id: &str) -> bool {
        self.sched.is_scheduled(id)
    }

    /// Drive the schedule queue: hand due nodes to the gather worker and run
    /// GPU continuations for completed gathers. Completions arrive in no
    /// particular order between nodes.
    pub fn poll_scheduled(&mut self, res: &mut RenderResources) {
        for (id, revision) in self.sched.take_due(Instant::now()) {
            let Some(entry) = self.nodes.get(&id) else {
                self.sched.cancel(&id);
                continue;
            };
            let props: Vec<_> = entry
                .op
                .promotable()
                .iter()
                .map(|(name, kind)| (name.to_string(), *kind))
                .collect();
            let mut scope = self.parameter_scope();
            scope.set(
                "size",
                Value::Float2([entry.shell.width as f32, entry.shell.height as f32]),
            );
            self.sched.submit(GatherJob {
                node: id,
                revision,
                props,
                params: self.params.clone(),
                scope,
            });
        }

        for done in self.sched.drain_completed() {
            self.process_node_inner(&done.node, res, Some(&done.values));
        }
    }

    /// Poll until the schedule queue drains or `timeout` passes.
    pub fn flush_scheduled(&mut self, res: &mut RenderResources, timeout: Duration) {
        let start = Instant::now();
        while !self.sched.is_idle() {
            self.poll_scheduled(res);
            if start.elapsed() > timeout {
                log::warn!("[graph] flush_scheduled timed out with work pending");
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // ---- parameters -----------------------------------------------------

    pub fn has_parameter_value(&self, id: &str, prop: &str) -> bool {
        self.params.has_value(id, prop)
    }

    pub fn is_parameter_value_function(&self, id: &str, prop: &str) -> bool {
        self.params.is_function(id, prop)
    }

    /// Scope parameter functions evaluate in when no node context applies.
    pub fn parameter_scope(&self) -> VarScope {
        let mut scope = self.vars.clone();
        self.params.export_literals(&mut scope);
        scope.set(
            "size",
            Value::Float2([self.width as f32, self.height as f32]),
        );
        scope.set("seed", Value::Float(self.random_seed as f32));
        scope
    }

    /// Composite-key lookup; a bound function is evaluated and its result
    /// returned. `None` means callers fall back to the node's own field.
    pub fn get_parameter_value(&self, id: &str, prop: &str) -> Option<Value> {
        self.params.resolve(id, prop, &self.parameter_scope())
    }

    /// Store an override and mark every graph instance (and its nested
    /// instances) dirty; they repopulate lazily on next evaluation.
    pub fn set_parameter_value(&mut self, id: &str, prop: &str, binding: ParamBinding) {
        self.params.set_value(id, prop, binding);
        self.mark_instances_dirty();
        self.modified = true;
    }

    /// Drop an override; the node's stored field shows through again.
    pub fn remove_parameter_value(&mut self, id: &str, prop: &str) {
        if self.params.remove_value(id, prop).is_some() {
            self.mark_instances_dirty();
            self.modified = true;
        }
    }

    fn mark_instances_dirty(&mut self) {
        for entry in self.nodes.values_mut() {
            if let Some(instance) = entry.op.as_any_mut().downcast_mut::<GraphInstanceNode>() {
                instance.mark_dirty();
            }
        }
    }

    // ---- graph variables ------------------------------------------------

    pub fn set_var(&mut self, name: &str, value: Value) {
        self.vars.set(name, value);
    }

    pub fn get_var(&self, name: &str) -> Option<Value> {
        self.vars.get(name)
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.vars.has(name)
    }

    pub fn remove_var(&mut self, name: &str) {
        self.vars.remove(name);
    }

    // ---- cascading changes ---------------------------------------------

    /// Switch the graph-wide format, releasing every node's buffers and
    /// re-evaluating. Per-node format overrides are overwritten.
    pub fn assign_pixel_type(&mut self, format: PixelFormat, res: &mut RenderResources) {
        if self.read_only {
            return;
        }
        self.default_format = format;
        for entry in self.nodes.values_mut() {
            entry.shell.pixel_format = format;
            entry.shell.release_buffers(res);
        }
        self.modified = true;
        self.try_and_process(res);
    }

    /// Proportionally rescale every non-absolute node from its origin size.
    /// Intrinsically sized nodes (bitmaps) keep their dimensions.
    pub fn resize_with(&mut self, width: u32, height: u32, res: &mut RenderResources) {
        if self.absolute_size {
            return;
        }
        let wp = width as f32 / self.width.max(1) as f32;
        let hp = height as f32 / self.height.max(1) as f32;

        for id in self.order.clone() {
            let Some(entry) = self.nodes.get_mut(&id) else {
                continue;
            };
            if entry.shell.absolute_size || !entry.op.respects_resize() {
                continue;
            }
            let (ow, oh) = self
                .origin_sizes
                .get(&id)
                .copied()
                .unwrap_or((entry.shell.width, entry.shell.height));
            let fw = (ow as f32 * wp).round() as u32;
            let fh = (oh as f32 * hp).round() as u32;
            entry.shell.set_size(fw, fh);
            entry.shell.release_buffers(res);
        }

        self.width = width;
        self.height = height;
        self.modified = true;
    }

    /// Store the seed and cascade it into instance nodes, parameter-bound
    /// functions and the custom function library.
    pub fn assign_seed(&mut self, seed: i32) {
        self.random_seed = seed;
        self.params.assign_seed(seed);
        for entry in self.nodes.values_mut() {
            if let Some(instance) = entry.op.as_any_mut().downcast_mut::<GraphInstanceNode>() {
                instance.assign_seed(seed);
            }
        }
        self.modified = true;
    }

    // ---- persistence ----------------------------------------------------

    pub fn get_json(&self) -> Result<String> {
        let mut nodes = Vec::with_capacity(self.order.len());
        for id in &self.order {
            let entry = self
                .nodes
                .get(id)
                .ok_or_else(|| anyhow!("node order out of sync for '{id}'"))?;
            let record = entry.op.get_json(&entry.shell)?;
            nodes.push(
                serde_json::from_str(&record)
                    .with_context(|| format!("node '{id}' produced an invalid record"))?,
            );
        }

        let data = GraphData {
            id: self.id.clone(),
            name: self.name.clone(),
            width: self.width,
            height: self.height,
            absolute_size: self.absolute_size,
            default_format: self.default_format,
            random_seed: self.random_seed,
            nodes,
            inputs: self.input_nodes.clone(),
            outputs: self.output_nodes.clone(),
            parameters: self.params.clone(),
        };
        Ok(serde_json::to_string(&data)?)
    }

    pub fn from_json(data: &str, env: Environment) -> Result<Graph> {
        Self::from_json_with_archive(data, None, env)
    }

    /// Load a graph, optionally resolving nested instances against an open
    /// container archive.
    pub fn from_json_with_archive(
        data: &str,
        archive: Option<&MatArchive>,
        env: Environment,
    ) -> Result<Graph> {
        let d: GraphData = serde_json::from_str(data).context("failed to parse graph json")?;
        let mut graph = Graph::new(&d.name, d.width, d.height, env);
        graph.state = GraphState::Loading;
        graph.id = d.id;
        graph.absolute_size = d.absolute_size;
        graph.default_format = d.default_format;
        graph.random_seed = d.random_seed;
        graph.params = d.parameters;

        let mut bases: Vec<NodeData> = Vec::with_capacity(d.nodes.len());
        for record in &d.nodes {
            let base: NodeData = serde_json::from_value(record.clone())
                .context("node record is missing base fields")?;
            let Some(mut entry) =
                crate::nodes::create_node(&base.node_type, d.width, d.height, d.default_format)
            else {
                log::warn!("[graph] unknown node type '{}', skipping", base.node_type);
                continue;
            };
            entry.op.init(&mut entry.shell);
            let record_str = serde_json::to_string(record)?;
            entry
                .op
                .from_json_with_archive(&mut entry.shell, &record_str, archive, &graph.env)
                .with_context(|| format!("failed to restore node '{}'", base.id))?;
            entry.shell.state = NodeState::Ready;

            graph.order.push(entry.shell.id.clone());
            graph.origin_sizes.insert(
                entry.shell.id.clone(),
                (entry.shell.width, entry.shell.height),
            );
            graph.nodes.insert(entry.shell.id.clone(), entry);
            bases.push(base);
        }

        graph.input_nodes = d
            .inputs
            .into_iter()
            .filter(|id| graph.nodes.contains_key(id))
            .collect();
        graph.output_nodes = d
            .outputs
            .into_iter()
            .filter(|id| graph.nodes.contains_key(id))
            .collect();

        // Second pass: restore wiring in record order.
        for base in &bases {
            for connection in &base.outputs {
                graph.link_raw(
                    &base.id,
                    connection.out_index,
                    &connection.node,
                    connection.index,
                );
            }
        }

        // Fan-out entries restored from records may point at nodes that were
        // skipped above; drop them rather than leave dangling references.
        let restored: std::collections::HashSet<String> = graph.nodes.keys().cloned().collect();
        for entry in graph.nodes.values_mut() {
            for output in &mut entry.shell.outputs {
                output.to.retain(|r| restored.contains(&r.node));
            }
        }

        graph.state = GraphState::Ready;
        graph.modified = false;
        Ok(graph)
    }

    /// Relocate every file-backed node's assets under the new working
    /// directory; called once per save.
    pub fn copy_resources(&mut self, cwd: &Path) -> Result<()> {
        for id in self.order.clone() {
            if let Some(mut entry) = self.nodes.remove(&id) {
                let result = entry.op.copy_resources(&entry.shell, cwd, &self.env);
                self.nodes.insert(id.clone(), entry);
                result.with_context(|| format!("copy_resources failed for node '{id}'"))?;
            }
        }
        self.cwd = cwd.to_path_buf();
        Ok(())
    }

    /// Release every owned node and its GPU resources. Idempotent.
    pub fn dispose(&mut self, res: &mut RenderResources) {
        for id in std::mem::take(&mut self.order) {
            if let Some(mut entry) = self.nodes.remove(&id) {
                entry.op.dispose(&mut entry.shell, res);
                entry.shell.dispose(res);
            }
        }
        self.nodes.clear();
        self.input_nodes.clear();
        self.output_nodes.clear();
        self.origin_sizes.clear();
    }
}
