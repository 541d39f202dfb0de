//! material-forge: the graph-execution engine of a procedural texture and
//! material authoring tool. A directed graph of image-processing nodes
//! produces GPU-resident textures; this crate is the engine every node plugs
//! into — the port/dependency model, push-based change propagation and
//! two-phase deferred scheduling, the parameter-resolution protocol (literal
//! and expression-graph overrides), GPU buffer lifecycle, and nested-graph
//! instancing. Concrete pixel kernels, importers and the editor UI live
//! elsewhere.

pub mod archive;
pub mod environment;
pub mod function;
pub mod gpu;
pub mod graph;
pub mod instance;
pub mod node;
pub mod nodes;
pub mod param;
pub mod port;
pub mod schedule;
pub mod value;

pub use archive::MatArchive;
pub use environment::Environment;
pub use function::{ExecutionMode, FnOp, FunctionGraph, VarScope};
pub use gpu::{GpuContext, RenderResources, TextureDesc, TextureHandle, TexturePool};
pub use graph::{Graph, GraphData, GraphState};
pub use instance::GraphInstanceNode;
pub use node::{NodeData, NodeEntry, NodeOp, NodeShell, NodeState, ProcessContext, ProcessOutcome};
pub use param::{ParamBinding, ParameterStore, ParameterValue};
pub use port::{NodeConnection, NodeInput, NodeOutput, OutputData, PortRef, TextureBinding};
pub use value::{PixelFormat, TypeMask, Value, ValueKind};
