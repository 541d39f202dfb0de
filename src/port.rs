use serde::{Deserialize, Serialize};

use crate::gpu::TextureHandle;
use crate::value::{PixelFormat, TypeMask, Value};

/// Address of a port on some node: the owning node's id plus the port's
/// position in that node's input or output list. Ports reference their peers
/// through these plain handles; the graph owns every node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub node: String,
    pub index: usize,
}

impl PortRef {
    pub fn new(node: impl Into<String>, index: usize) -> Self {
        Self {
            node: node.into(),
            index,
        }
    }
}

/// Non-owning view of a producer's GPU buffer, published as output data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureBinding {
    pub handle: TextureHandle,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// What an output currently carries. Image nodes publish texture bindings;
/// math-flavored nodes publish CPU values.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputData {
    Texture(TextureBinding),
    Value(Value),
}

impl OutputData {
    pub fn as_texture(&self) -> Option<TextureBinding> {
        match self {
            OutputData::Texture(t) => Some(*t),
            OutputData::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<Value> {
        match self {
            OutputData::Value(v) => Some(*v),
            OutputData::Texture(_) => None,
        }
    }
}

/// Consumer-side connection point. Accepts exactly one producer; `reference`
/// does not own anything.
#[derive(Debug, Clone)]
pub struct NodeInput {
    pub name: String,
    pub accepts: TypeMask,
    pub reference: Option<PortRef>,
}

impl NodeInput {
    pub fn new(accepts: TypeMask, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            accepts,
            reference: None,
        }
    }

    pub fn has_input(&self) -> bool {
        self.reference.is_some()
    }
}

/// Producer-side connection point. Fans out to any number of consumers, all
/// sharing read-only access to the one published buffer.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub name: String,
    pub produces: TypeMask,
    pub data: Option<OutputData>,
    pub to: Vec<PortRef>,
}

impl NodeOutput {
    pub fn new(produces: TypeMask, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            produces,
            data: None,
            to: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to.is_empty()
    }
}

/// Persistence record for one edge, stored on the producing node: target node
/// id plus both port indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConnection {
    pub node: String,
    pub index: usize,
    pub out_index: usize,
}
