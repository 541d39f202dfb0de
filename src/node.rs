use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::environment::Environment;
use crate::function::VarScope;
use crate::gpu::{PassKind, RenderResources, TextureDesc, TextureHandle, TexturePass, ensure_texture};
use crate::param::ParameterStore;
use crate::port::{NodeConnection, NodeInput, NodeOutput, OutputData, PortRef, TextureBinding};
use crate::value::{PixelFormat, Value, ValueKind};

pub const MIN_NODE_SIZE: u32 = 8;
pub const MAX_NODE_SIZE: u32 = 4096;
pub const DEFAULT_NODE_SIZE: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Uninitialized,
    Ready,
    Processing,
    Disposed,
}

/// Engine-owned per-node record: identity, layout, ports, owned GPU buffers.
/// The node-type-specific behavior lives in the boxed [`NodeOp`] next to it.
#[derive(Debug)]
pub struct NodeShell {
    pub id: String,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub absolute_size: bool,
    pub tile_x: f32,
    pub tile_y: f32,
    pub pixel_format: PixelFormat,
    pub is_async: bool,
    pub state: NodeState,
    pub inputs: Vec<NodeInput>,
    pub outputs: Vec<NodeOutput>,
    /// Primary buffer, exclusively owned by this node.
    pub buffer: Option<TextureHandle>,
    /// Snapshot copy for feedback kernels; never aliases `buffer`.
    pub aux_buffer: Option<TextureHandle>,
    disposing: bool,
}

impl NodeShell {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: String::new(),
            width,
            height,
            absolute_size: false,
            tile_x: 1.0,
            tile_y: 1.0,
            pixel_format,
            is_async: false,
            state: NodeState::Uninitialized,
            inputs: Vec::new(),
            outputs: Vec::new(),
            buffer: None,
            aux_buffer: None,
            disposing: false,
        }
    }

    pub fn set_size(&mut self, width: u32, height: u32) {
        self.width = width.clamp(MIN_NODE_SIZE, MAX_NODE_SIZE);
        self.height = height.clamp(MIN_NODE_SIZE, MAX_NODE_SIZE);
    }

    pub fn has_empty_output(&self) -> bool {
        self.outputs.iter().any(|o| o.to.is_empty())
    }

    /// Release the shell's owned buffers back to the pool, nulling the fields
    /// immediately. Safe to call repeatedly and from within disposal.
    pub fn release_buffers(&mut self, res: &mut RenderResources) {
        if let Some(handle) = self.buffer.take() {
            res.textures.release(handle);
        }
        if let Some(handle) = self.aux_buffer.take() {
            res.textures.release(handle);
        }
    }

    /// Tear the node down. Idempotent; re-entrant calls triggered while
    /// releasing are swallowed by the `disposing` guard.
    pub fn dispose(&mut self, res: &mut RenderResources) {
        if self.disposing || self.state == NodeState::Disposed {
            return;
        }
        self.disposing = true;
        self.release_buffers(res);
        for output in &mut self.outputs {
            output.data = None;
        }
        self.state = NodeState::Disposed;
        self.disposing = false;
    }

    /// Persistence view of this node's outgoing edges.
    pub fn connections(&self) -> Vec<NodeConnection> {
        let mut list = Vec::new();
        for (out_index, output) in self.outputs.iter().enumerate() {
            for consumer in &output.to {
                list.push(NodeConnection {
                    node: consumer.node.clone(),
                    index: consumer.index,
                    out_index,
                });
            }
        }
        list
    }
}

/// Base fields every node record carries, JSON and binary alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub absolute_size: bool,
    pub tile_x: f32,
    pub tile_y: f32,
    pub pixel_format: PixelFormat,
    pub is_async: bool,
    pub input_count: usize,
    pub output_count: usize,
    pub outputs: Vec<NodeConnection>,
}

impl NodeData {
    pub fn from_shell(shell: &NodeShell, node_type: &str) -> Self {
        Self {
            id: shell.id.clone(),
            node_type: node_type.to_string(),
            name: shell.name.clone(),
            width: shell.width,
            height: shell.height,
            absolute_size: shell.absolute_size,
            tile_x: shell.tile_x,
            tile_y: shell.tile_y,
            pixel_format: shell.pixel_format,
            is_async: shell.is_async,
            input_count: shell.inputs.len(),
            output_count: shell.outputs.len(),
            outputs: shell.connections(),
        }
    }

    /// Restore base scalar fields onto a freshly initialized shell. Port
    /// counts are restored by the node op where they are dynamic.
    pub fn apply_to(&self, shell: &mut NodeShell) {
        shell.id = self.id.clone();
        shell.name = self.name.clone();
        shell.width = self.width;
        shell.height = self.height;
        shell.absolute_size = self.absolute_size;
        shell.tile_x = self.tile_x;
        shell.tile_y = self.tile_y;
        shell.pixel_format = self.pixel_format;
        shell.is_async = self.is_async;
    }

    /// Rebuild the producer-side fan-out lists from the record. Called after
    /// any dynamic ports exist; the owning graph completes the consumer side
    /// when the whole graph is restored.
    pub fn apply_connections(&self, shell: &mut NodeShell) {
        for output in &mut shell.outputs {
            output.to.clear();
        }
        for connection in &self.outputs {
            match shell.outputs.get_mut(connection.out_index) {
                Some(output) => output
                    .to
                    .push(PortRef::new(connection.node.clone(), connection.index)),
                None => log::warn!(
                    "[node] record for '{}' references missing output {}",
                    self.id,
                    connection.out_index
                ),
            }
        }
    }
}

/// Frame a versioned binary record: version tag, base record, node record.
/// The two records are written as independent bincode values (bincode cannot
/// decode internally tagged/flattened layouts).
pub fn write_binary_record<T: Serialize>(
    w: &mut dyn Write,
    version: u16,
    base: &NodeData,
    record: &T,
) -> Result<()> {
    w.write_all(&version.to_le_bytes())?;
    bincode::serialize_into(&mut *w, base)?;
    bincode::serialize_into(&mut *w, record)?;
    Ok(())
}

pub fn read_binary_record<T: DeserializeOwned>(
    r: &mut dyn Read,
    newest_version: u16,
) -> Result<(u16, NodeData, T)> {
    let mut tag = [0u8; 2];
    r.read_exact(&mut tag)?;
    let version = u16::from_le_bytes(tag);
    if version == 0 || version > newest_version {
        bail!("unsupported binary record version {version} (newest known: {newest_version})");
    }
    let base: NodeData = bincode::deserialize_from(&mut *r)?;
    let record: T = bincode::deserialize_from(&mut *r)?;
    Ok((version, base, record))
}

/// Growth policy for a node whose output list is variadic.
#[derive(Debug, Clone, Copy)]
pub struct VariadicOutputs {
    /// Never shrink below this many outputs.
    pub floor: usize,
}

/// Indices of outputs whose published data changed during one process call.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    pub changed: Vec<usize>,
}

impl ProcessOutcome {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn changed(indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            changed: indices.into_iter().collect(),
        }
    }
}

/// A node paired with its behavior; the graph's node map stores these.
pub struct NodeEntry {
    pub shell: NodeShell,
    pub op: Box<dyn NodeOp>,
}

/// Everything a kernel may touch while processing. The node being processed
/// is absent from `nodes` (the graph lifts it out for the duration), which
/// doubles as the re-entrancy guard.
pub struct ProcessContext<'a> {
    pub nodes: &'a HashMap<String, NodeEntry>,
    pub params: &'a ParameterStore,
    pub vars: &'a VarScope,
    pub res: &'a mut RenderResources,
    pub env: &'a Environment,
    pub graph_width: u32,
    pub graph_height: u32,
    pub default_format: PixelFormat,
    pub random_seed: i32,
    /// Phase-1 results when this call is the GPU continuation of a scheduled
    /// two-phase task; checked before the live parameter table.
    pub gathered: Option<&'a HashMap<String, Value>>,
}

impl ProcessContext<'_> {
    pub fn output_data(&self, port: &PortRef) -> Option<&OutputData> {
        self.nodes
            .get(&port.node)?
            .shell
            .outputs
            .get(port.index)?
            .data
            .as_ref()
    }

    /// The texture published by the producer connected to input `index`, if
    /// any. Missing input or unresolved producer is the steady no-op state.
    pub fn input_texture(&self, shell: &NodeShell, index: usize) -> Option<TextureBinding> {
        let reference = shell.inputs.get(index)?.reference.as_ref()?;
        self.output_data(reference)?.as_texture()
    }

    pub fn input_value(&self, shell: &NodeShell, index: usize) -> Option<Value> {
        let reference = shell.inputs.get(index)?.reference.as_ref()?;
        self.output_data(reference)?.as_value()
    }

    /// Variable scope a parameter function evaluates in: graph variables,
    /// promoted/custom literals (`p_` prefixed), builtin `size` and `seed`.
    pub fn function_scope(&self, shell: &NodeShell) -> VarScope {
        let mut scope = self.vars.clone();
        self.params.export_literals(&mut scope);
        scope.set(
            "size",
            Value::Float2([shell.width as f32, shell.height as f32]),
        );
        scope.set("seed", Value::Float(self.random_seed as f32));
        scope
    }

    /// Snapshot-copy the node's primary buffer into its private secondary
    /// buffer and return the snapshot handle. Feedback kernels read the
    /// snapshot, never the primary buffer, so one dispatch never reads and
    /// writes the same texture.
    pub fn snapshot_aux(&mut self, shell: &mut NodeShell) -> Option<TextureHandle> {
        let primary = shell.buffer?;
        let desc = self.res.textures.desc(primary)?.clone();
        let aux = ensure_texture(
            &mut self.res.textures,
            shell.aux_buffer,
            TextureDesc {
                label: format!("{}.feedback", desc.label),
                ..desc
            },
        );
        shell.aux_buffer = Some(aux);
        self.res.queue_pass(TexturePass {
            label: format!("feedback snapshot '{}'", shell.name),
            target: aux,
            kind: PassKind::Copy { source: primary },
        });
        Some(aux)
    }

    /// The single parameter-resolution helper every node calls:
    /// function override, else literal override, else the node's own field.
    pub fn parameter(&self, shell: &NodeShell, prop: &str, fallback: Value) -> Value {
        self.parameter_with(shell, prop, fallback, &[])
    }

    /// Same as [`parameter`], with per-call context variables (iteration
    /// index, uv, character index, ...) injected into function evaluation.
    pub fn parameter_with(
        &self,
        shell: &NodeShell,
        prop: &str,
        fallback: Value,
        extra: &[(&str, Value)],
    ) -> Value {
        let kind = fallback.kind();

        if extra.is_empty() {
            if let Some(gathered) = self.gathered {
                if let Some(v) = gathered.get(prop) {
                    return v.convert_to(kind);
                }
            }
        }

        if self.params.has_value(&shell.id, prop) {
            let mut scope = self.function_scope(shell);
            for (name, value) in extra {
                scope.set(*name, *value);
            }
            match self.params.resolve(&shell.id, prop, &scope) {
                Some(v) => return v.convert_to(kind),
                None => return fallback,
            }
        }

        fallback
    }
}

/// Node-type-specific behavior. Implementations keep their own fields (the
/// promotable properties) and serialize them through the record pair.
pub trait NodeOp: Send {
    fn type_name(&self) -> &'static str;

    /// Populate the shell's ports. Called once right after construction.
    fn init(&self, shell: &mut NodeShell);

    /// The processing routine behind `TryAndProcess`. Must be idempotent for
    /// unchanged inputs and silently publish nothing when required inputs are
    /// missing.
    fn process(&mut self, shell: &mut NodeShell, ctx: &mut ProcessContext<'_>) -> ProcessOutcome;

    fn get_json(&self, shell: &NodeShell) -> Result<String>;
    fn from_json(&mut self, shell: &mut NodeShell, data: &str) -> Result<()>;

    /// Deserialize with access to the container archive the graph was loaded
    /// from. Only graph instances care; everything else ignores the archive.
    fn from_json_with_archive(
        &mut self,
        shell: &mut NodeShell,
        data: &str,
        archive: Option<&crate::archive::MatArchive>,
        env: &Environment,
    ) -> Result<()> {
        let _ = (archive, env);
        self.from_json(shell, data)
    }

    fn get_binary(&self, shell: &NodeShell, w: &mut dyn Write) -> Result<()>;
    fn from_binary(&mut self, shell: &mut NodeShell, r: &mut dyn Read) -> Result<()>;

    /// Relocate referenced external assets next to the graph being saved.
    fn copy_resources(&mut self, shell: &NodeShell, cwd: &Path, env: &Environment) -> Result<()> {
        let _ = (shell, cwd, env);
        Ok(())
    }

    /// Release op-owned resources beyond the shell's buffers.
    fn dispose(&mut self, shell: &mut NodeShell, res: &mut RenderResources) {
        let _ = (shell, res);
    }

    fn variadic_outputs(&self) -> Option<VariadicOutputs> {
        None
    }

    /// Whether proportional graph resizes apply; intrinsically sized content
    /// (bitmaps) opts out.
    fn respects_resize(&self) -> bool {
        true
    }

    /// Properties eligible for graph-level override, with their kinds; the
    /// scheduler gathers these in phase 1.
    fn promotable(&self) -> &'static [(&'static str, ValueKind)] {
        &[]
    }

    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Copy an external file under `cwd/relative`, preferring the original source
/// location and falling back to the previous working directory.
pub fn copy_resource_to(cwd: &Path, relative: &str, from: &Path, old_cwd: &Path) -> Result<()> {
    if relative.is_empty() {
        return Ok(());
    }
    let target = cwd.join(relative);
    if let Some(dir) = target.parent() {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
    }
    if from == target {
        return Ok(());
    }
    if from.is_file() && !target.exists() {
        std::fs::copy(from, &target)?;
        return Ok(());
    }
    let previous = old_cwd.join(relative);
    if previous != target && previous.is_file() && !target.exists() {
        std::fs::copy(&previous, &target)?;
    }
    Ok(())
}
