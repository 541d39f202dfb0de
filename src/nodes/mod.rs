//! The concrete node set. Kernels are deliberately simple; the engine
//! contract they exercise (ports, parameter resolution, buffer lifecycle,
//! persistence) is the point.

pub mod bitmap;
pub mod blend;
pub mod blur;
pub mod input;
pub mod output;
pub mod pixel_processor;
pub mod sequence;
pub mod uniform_color;

use crate::instance::GraphInstanceNode;
use crate::node::{NodeEntry, NodeOp, NodeShell};
use crate::value::PixelFormat;

pub use bitmap::BitmapNode;
pub use blend::BlendNode;
pub use blur::BlurNode;
pub use input::InputNode;
pub use output::OutputNode;
pub use pixel_processor::PixelProcessorNode;
pub use sequence::SequenceNode;
pub use uniform_color::UniformColorNode;

/// Construct a node of the given registered type with an uninitialized
/// shell. Returns `None` for unknown type tags so loaders can skip records
/// from newer builds.
pub fn create_node(
    type_name: &str,
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Option<NodeEntry> {
    let op: Box<dyn NodeOp> = match type_name {
        "bitmap" => Box::new(BitmapNode::new()),
        "blend" => Box::new(BlendNode::new()),
        "blur" => Box::new(BlurNode::new()),
        "graph_input" => Box::new(InputNode::new()),
        "graph_output" => Box::new(OutputNode::new()),
        "graph_instance" => Box::new(GraphInstanceNode::new()),
        "pixel_processor" => Box::new(PixelProcessorNode::new()),
        "sequence" => Box::new(SequenceNode::new()),
        "uniform_color" => Box::new(UniformColorNode::new()),
        _ => return None,
    };
    Some(NodeEntry {
        shell: NodeShell::new(width, height, format),
        op,
    })
}
