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

const BLEND_FS: &str = r#"
struct Params {
    alpha: f32,
    mode: f32,
    _pad0: f32,
    _pad1: f32,
};
@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var samp: sampler;
@group(0) @binding(2) var top: texture_2d<f32>;
@group(0) @binding(3) var bottom: texture_2d<f32>;

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    let a = textureSampleLevel(top, samp, in.uv, 0.0);
    let b = textureSampleLevel(bottom, samp, in.uv, 0.0);
    let mode = i32(params.mode + 0.5);
    var blended = mix(b, a, params.alpha);
    if (mode == 1) {
        blended = mix(b, a * b, params.alpha);
    } else if (mode == 2) {
        blended = mix(b, min(a + b, vec4<f32>(1.0)), params.alpha);
    } else if (mode == 3) {
        blended = mix(b, vec4<f32>(1.0) - (vec4<f32>(1.0) - a) * (vec4<f32>(1.0) - b), params.alpha);
    }
    return blended;
}
"#;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct BlendParams {
    alpha: f32,
    mode: f32,
    _pad0: f32,
    _pad1: f32,
}

/// Blend modes mirror the classic compositing set; anything unknown falls
/// back to normal.
#[derive(Debug, Serialize, Deserialize)]
struct BlendFields {
    alpha: f32,
    mode: u32,
}

#[derive(Serialize, Deserialize)]
struct BlendRecord {
    #[serde(flatten)]
    base: NodeData,
    #[serde(flatten)]
    fields: BlendFields,
}

pub struct BlendNode {
    pub alpha: f32,
    pub mode: u32,
}

impl Default for BlendNode {
    fn default() -> Self {
        Self::new()
    }
}

impl BlendNode {
    pub fn new() -> Self {
        Self {
            alpha: 1.0,
            mode: 0,
        }
    }
}

impl NodeOp for BlendNode {
    fn type_name(&self) -> &'static str {
        "blend"
    }

    fn init(&self, shell: &mut NodeShell) {
        shell
            .inputs
            .push(NodeInput::new(TypeMask::IMAGE, "Foreground"));
        shell
            .inputs
            .push(NodeInput::new(TypeMask::IMAGE, "Background"));
        shell.outputs.push(NodeOutput::new(TypeMask::IMAGE, ""));
        if shell.name.is_empty() {
            shell.name = "Blend".to_string();
        }
    }

    fn promotable(&self) -> &'static [(&'static str, ValueKind)] {
        &[("alpha", ValueKind::Float), ("mode", ValueKind::Float)]
    }

    fn process(&mut self, shell: &mut NodeShell, ctx: &mut ProcessContext<'_>) -> ProcessOutcome {
        // Both layers are required inputs.
        let (Some(top), Some(bottom)) = (
            ctx.input_texture(shell, 0),
            ctx.input_texture(shell, 1),
        ) else {
            return ProcessOutcome::unchanged();
        };

        let alpha = ctx
            .parameter(shell, "alpha", Value::Float(self.alpha))
            .as_float();
        let mode = ctx
            .parameter(shell, "mode", Value::Float(self.mode as f32))
            .as_float();

        shell.width = top.width;
        shell.height = top.height;

        let handle = ensure_texture(
            &mut ctx.res.textures,
            shell.buffer,
            TextureDesc {
                width: shell.width,
                height: shell.height,
                format: shell.pixel_format,
                label: format!("blend.{}", shell.id),
            },
        );
        shell.buffer = Some(handle);

        let params = BlendParams {
            alpha,
            mode,
            _pad0: 0.0,
            _pad1: 0.0,
        };
        ctx.res.queue_pass(TexturePass {
            label: format!("blend '{}'", shell.name),
            target: handle,
            kind: PassKind::Draw {
                shader: BLEND_FS.to_string(),
                inputs: vec![top.handle, bottom.handle],
                uniforms: bytemuck::bytes_of(&params).to_vec(),
            },
        });

        shell.outputs[0].data = Some(OutputData::Texture(TextureBinding {
            handle,
            width: shell.width,
            height: shell.height,
            format: shell.pixel_format,
        }));
        ProcessOutcome::changed([0])
    }

    fn get_json(&self, shell: &NodeShell) -> Result<String> {
        let record = BlendRecord {
            base: NodeData::from_shell(shell, self.type_name()),
            fields: BlendFields {
                alpha: self.alpha,
                mode: self.mode,
            },
        };
        Ok(serde_json::to_string(&record)?)
    }

    fn from_json(&mut self, shell: &mut NodeShell, data: &str) -> Result<()> {
        let record: BlendRecord = serde_json::from_str(data)?;
        record.base.apply_to(shell);
        record.base.apply_connections(shell);
        self.alpha = record.fields.alpha;
        self.mode = record.fields.mode;
        Ok(())
    }

    fn get_binary(&self, shell: &NodeShell, w: &mut dyn Write) -> Result<()> {
        let base = NodeData::from_shell(shell, self.type_name());
        let fields = BlendFields {
            alpha: self.alpha,
            mode: self.mode,
        };
        write_binary_record(w, BINARY_VERSION, &base, &fields)
    }

    fn from_binary(&mut self, shell: &mut NodeShell, r: &mut dyn Read) -> Result<()> {
        let (_, base, fields): (u16, NodeData, BlendFields) =
            read_binary_record(r, BINARY_VERSION)?;
        base.apply_to(shell);
        base.apply_connections(shell);
        self.alpha = fields.alpha;
        self.mode = fields.mode;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
