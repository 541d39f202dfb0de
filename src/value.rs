use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

/// Capability bitmask a port advertises. An input accepts an output when the
/// masks intersect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeMask(pub u32);

impl TypeMask {
    pub const FLOAT: TypeMask = TypeMask(1);
    pub const FLOAT2: TypeMask = TypeMask(1 << 1);
    pub const FLOAT3: TypeMask = TypeMask(1 << 2);
    pub const FLOAT4: TypeMask = TypeMask(1 << 3);
    pub const BOOL: TypeMask = TypeMask(1 << 4);
    pub const COLOR: TypeMask = TypeMask(1 << 5);
    pub const GRAY: TypeMask = TypeMask(1 << 6);

    pub const IMAGE: TypeMask = TypeMask(Self::COLOR.0 | Self::GRAY.0);
    pub const ANY_VALUE: TypeMask = TypeMask(
        Self::FLOAT.0 | Self::FLOAT2.0 | Self::FLOAT3.0 | Self::FLOAT4.0 | Self::BOOL.0,
    );

    pub fn accepts(self, produced: TypeMask) -> bool {
        self.0 & produced.0 != 0
    }

    pub fn contains(self, other: TypeMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TypeMask {
    type Output = TypeMask;

    fn bitor(self, rhs: TypeMask) -> TypeMask {
        TypeMask(self.0 | rhs.0)
    }
}

/// The kind of a single CPU-side value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Float,
    Float2,
    Float3,
    Float4,
    Bool,
}

impl ValueKind {
    pub fn mask(self) -> TypeMask {
        match self {
            ValueKind::Float => TypeMask::FLOAT,
            ValueKind::Float2 => TypeMask::FLOAT2,
            ValueKind::Float3 => TypeMask::FLOAT3,
            ValueKind::Float4 => TypeMask::FLOAT4,
            ValueKind::Bool => TypeMask::BOOL,
        }
    }

    pub fn wgsl_type(self) -> &'static str {
        match self {
            ValueKind::Float => "f32",
            ValueKind::Float2 => "vec2<f32>",
            ValueKind::Float3 => "vec3<f32>",
            ValueKind::Float4 => "vec4<f32>",
            ValueKind::Bool => "bool",
        }
    }
}

/// A CPU-side value flowing through function graphs and parameter overrides.
///
/// Conversions are total across bool/float/vector pairs: every `as_*` returns
/// a usable value regardless of the stored kind (nonzero float -> true,
/// scalar -> splat vector, vector -> first component, ...).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Float(f32),
    Float2([f32; 2]),
    Float3([f32; 3]),
    Float4([f32; 4]),
    Bool(bool),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Float(_) => ValueKind::Float,
            Value::Float2(_) => ValueKind::Float2,
            Value::Float3(_) => ValueKind::Float3,
            Value::Float4(_) => ValueKind::Float4,
            Value::Bool(_) => ValueKind::Bool,
        }
    }

    pub fn zero_of(kind: ValueKind) -> Value {
        match kind {
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Float2 => Value::Float2([0.0; 2]),
            ValueKind::Float3 => Value::Float3([0.0; 3]),
            ValueKind::Float4 => Value::Float4([0.0; 4]),
            ValueKind::Bool => Value::Bool(false),
        }
    }

    pub fn as_float(&self) -> f32 {
        match *self {
            Value::Float(v) => v,
            Value::Float2(v) => v[0],
            Value::Float3(v) => v[0],
            Value::Float4(v) => v[0],
            Value::Bool(v) => {
                if v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    pub fn as_bool(&self) -> bool {
        match *self {
            Value::Bool(v) => v,
            other => other.as_float() != 0.0,
        }
    }

    /// Floor-and-clamp scalar conversion for integer-like properties.
    pub fn as_u32(&self) -> u32 {
        let v = self.as_float();
        if !v.is_finite() {
            return 0;
        }
        v.max(0.0).floor().min(u32::MAX as f32) as u32
    }

    pub fn as_float2(&self) -> [f32; 2] {
        match *self {
            Value::Float2(v) => v,
            Value::Float3(v) => [v[0], v[1]],
            Value::Float4(v) => [v[0], v[1]],
            other => {
                let f = other.as_float();
                [f, f]
            }
        }
    }

    pub fn as_float3(&self) -> [f32; 3] {
        match *self {
            Value::Float3(v) => v,
            Value::Float4(v) => [v[0], v[1], v[2]],
            Value::Float2(v) => [v[0], v[1], 0.0],
            other => {
                let f = other.as_float();
                [f, f, f]
            }
        }
    }

    pub fn as_float4(&self) -> [f32; 4] {
        match *self {
            Value::Float4(v) => v,
            Value::Float3(v) => [v[0], v[1], v[2], 1.0],
            Value::Float2(v) => [v[0], v[1], 0.0, 1.0],
            other => {
                let f = other.as_float();
                [f, f, f, f]
            }
        }
    }

    pub fn convert_to(&self, kind: ValueKind) -> Value {
        match kind {
            ValueKind::Float => Value::Float(self.as_float()),
            ValueKind::Float2 => Value::Float2(self.as_float2()),
            ValueKind::Float3 => Value::Float3(self.as_float3()),
            ValueKind::Float4 => Value::Float4(self.as_float4()),
            ValueKind::Bool => Value::Bool(self.as_bool()),
        }
    }

    /// Number of f32 lanes, treating bool as one lane.
    pub fn lanes(&self) -> usize {
        match self {
            Value::Float(_) | Value::Bool(_) => 1,
            Value::Float2(_) => 2,
            Value::Float3(_) => 3,
            Value::Float4(_) => 4,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{v}"),
            Value::Float2(v) => write!(f, "({}, {})", v[0], v[1]),
            Value::Float3(v) => write!(f, "({}, {}, {})", v[0], v[1], v[2]),
            Value::Float4(v) => write!(f, "({}, {}, {}, {})", v[0], v[1], v[2], v[3]),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// Storage format of a node's GPU buffer. The graph carries a default; any
/// node can override its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    #[default]
    Rgba8,
    Rgba16F,
    Rgba32F,
    Luminance16F,
    Luminance32F,
}

impl PixelFormat {
    pub fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            PixelFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
            PixelFormat::Rgba16F => wgpu::TextureFormat::Rgba16Float,
            PixelFormat::Rgba32F => wgpu::TextureFormat::Rgba32Float,
            PixelFormat::Luminance16F => wgpu::TextureFormat::R16Float,
            PixelFormat::Luminance32F => wgpu::TextureFormat::R32Float,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgba16F => 8,
            PixelFormat::Rgba32F => 16,
            PixelFormat::Luminance16F => 2,
            PixelFormat::Luminance32F => 4,
        }
    }

}
