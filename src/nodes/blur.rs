use std::io::{Read, Write};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::gpu::{PassKind, TextureDesc, TexturePass, ensure_texture};
use crate::node::{
    NodeData, NodeOp, NodeShell, ProcessContext, ProcessOutcome, read_binary_record,
    write_binary_record,
};
use crate::port::{NodeInput, NodeOutput, OutputData, TextureBinding};
use crate::value::{TypeMask, Value, ValueKind};

const BINARY_VERSION: u16 = 1;

const BLUR_FS: &str = r#"
struct Params {
    intensity: f32,
    tile_x: f32,
    tile_y: f32,
    _pad: f32,
};
@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var samp: sampler;
@group(0) @binding(2) var src: texture_2d<f32>;

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    let texel = vec2<f32>(1.0) / vec2<f32>(textureDimensions(src));
    let radius = i32(clamp(params.intensity, 0.0, 64.0));
    var acc = vec4<f32>(0.0);
    var total = 0.0;
    for (var y = -radius; y <= radius; y = y + 2) {
        for (var x = -radius; x <= radius; x = x + 2) {
            let d = vec2<f32>(f32(x), f32(y));
            let w = 1.0 / (1.0 + dot(d, d));
            let uv = fract(in.uv * vec2<f32>(params.tile_x, params.tile_y)) + d * texel;
            acc = acc + textureSampleLevel(src, samp, uv, 0.0) * w;
            total = total + w;
        }
    }
    return acc / max(total, 1e-6);
}
"#;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct BlurParams {
    intensity: f32,
    tile_x: f32,
    tile_y: f32,
    _pad: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlurFields {
    intensity: f32,
}

#[derive(Serialize, Deserialize)]
struct BlurRecord {
    #[serde(flatten)]
    base: NodeData,
    #[serde(flatten)]
    fields: BlurFields,
}

/// Separable-ish box blur. Output dimensions follow the upstream producer,
/// not the node's static configuration.
pub struct BlurNode {
    pub intensity: f32,
}

impl Default for BlurNode {
    fn default() -> Self {
        Self::new()
    }
}

impl BlurNode {
    pub fn new() -> Self {
        Self { intensity: 10.0 }
    }
}

impl NodeOp for BlurNode {
    fn type_name(&self) -> &'static str {
        "blur"
    }

    fn init(&self, shell: &mut NodeShell) {
        shell
            .inputs
            .push(NodeInput::new(TypeMask::IMAGE, "Image Input"));
        shell.outputs.push(NodeOutput::new(TypeMask::IMAGE, ""));
        if shell.name.is_empty() {
            shell.name = "Blur".to_string();
        }
    }

    fn promotable(&self) -> &'static [(&'static str, ValueKind)] {
        &[("intensity", ValueKind::Float)]
    }

    fn process(&mut self, shell: &mut NodeShell, ctx: &mut ProcessContext<'_>) -> ProcessOutcome {
        let Some(source) = ctx.input_texture(shell, 0) else {
            return ProcessOutcome::unchanged();
        };

        let intensity = ctx
            .parameter(shell, "intensity", Value::Float(self.intensity))
            .as_float();

        shell.width = source.width;
        shell.height = source.height;

        let handle = ensure_texture(
            &mut ctx.res.textures,
            shell.buffer,
            TextureDesc {
                width: source.width,
                height: source.height,
                format: shell.pixel_format,
                label: format!("blur.{}", shell.id),
            },
        );
        shell.buffer = Some(handle);

        let params = BlurParams {
            intensity,
            tile_x: shell.tile_x,
            tile_y: shell.tile_y,
            _pad: 0.0,
        };
        ctx.res.queue_pass(TexturePass {
            label: format!("blur '{}'", shell.name),
            target: handle,
            kind: PassKind::Draw {
                shader: BLUR_FS.to_string(),
                inputs: vec![source.handle],
                uniforms: bytemuck::bytes_of(&params).to_vec(),
            },
        });

        shell.outputs[0].data = Some(OutputData::Texture(TextureBinding {
            handle,
            width: source.width,
            height: source.height,
            format: shell.pixel_format,
        }));
        ProcessOutcome::changed([0])
    }

    fn get_json(&self, shell: &NodeShell) -> Result<String> {
        let record = BlurRecord {
            base: NodeData::from_shell(shell, self.type_name()),
            fields: BlurFields {
                intensity: self.intensity,
            },
        };
        Ok(serde_json::to_string(&record)?)
    }

    fn from_json(&mut self, shell: &mut NodeShell, data: &str) -> Result<()> {
        let record: BlurRecord = serde_json::from_str(data)?;
        record.base.apply_to(shell);
        record.base.apply_connections(shell);
        self.intensity = record.fields.intensity;
        Ok(())
    }

    fn get_binary(&self, shell: &NodeShell, w: &mut dyn Write) -> Result<()> {
        let base = NodeData::from_shell(shell, self.type_name());
        let fields = BlurFields {
            intensity: self.intensity,
        };
        write_binary_record(w, BINARY_VERSION, &base, &fields)
    }

    fn from_binary(&mut self, shell: &mut NodeShell, r: &mut dyn Read) -> Result<()> {
        let (_, base, fields): (u16, NodeData, BlurFields) =
            read_binary_record(r, BINARY_VERSION)?;
        base.apply_to(shell);
        base.apply_connections(shell);
        self.intensity = fields.intensity;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
