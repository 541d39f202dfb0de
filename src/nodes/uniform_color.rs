use std::io::{Read, Write};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::gpu::{PassKind, TextureDesc, TexturePass, ensure_texture};
use crate::node::{
    NodeData, NodeOp, NodeShell, ProcessContext, ProcessOutcome, read_binary_record,
    write_binary_record,
};
use crate::port::{NodeOutput, OutputData, TextureBinding};
use crate::value::{TypeMask, Value, ValueKind};

const BINARY_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct UniformColorFields {
    color: [f32; 4],
}

#[derive(Serialize, Deserialize)]
struct UniformColorRecord {
    #[serde(flatten)]
    base: NodeData,
    #[serde(flatten)]
    fields: UniformColorFields,
}

/// Constant-color generator; the simplest producer in the set.
pub struct UniformColorNode {
    pub color: [f32; 4],
}

impl Default for UniformColorNode {
    fn default() -> Self {
        Self::new()
    }
}

impl UniformColorNode {
    pub fn new() -> Self {
        Self {
            color: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

impl NodeOp for UniformColorNode {
    fn type_name(&self) -> &'static str {
        "uniform_color"
    }

    fn init(&self, shell: &mut NodeShell) {
        shell.outputs.push(NodeOutput::new(TypeMask::COLOR, ""));
        if shell.name.is_empty() {
            shell.name = "Uniform Color".to_string();
        }
    }

    fn promotable(&self) -> &'static [(&'static str, ValueKind)] {
        &[("color", ValueKind::Float4)]
    }

    fn process(&mut self, shell: &mut NodeShell, ctx: &mut ProcessContext<'_>) -> ProcessOutcome {
        let color = ctx
            .parameter(shell, "color", Value::Float4(self.color))
            .as_float4();

        let handle = ensure_texture(
            &mut ctx.res.textures,
            shell.buffer,
            TextureDesc {
                width: shell.width,
                height: shell.height,
                format: shell.pixel_format,
                label: format!("uniform_color.{}", shell.id),
            },
        );
        shell.buffer = Some(handle);

        ctx.res.queue_pass(TexturePass {
            label: format!("uniform color '{}'", shell.name),
            target: handle,
            kind: PassKind::Fill {
                color: [
                    color[0] as f64,
                    color[1] as f64,
                    color[2] as f64,
                    color[3] as f64,
                ],
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
        let record = UniformColorRecord {
            base: NodeData::from_shell(shell, self.type_name()),
            fields: UniformColorFields { color: self.color },
        };
        Ok(serde_json::to_string(&record)?)
    }

    fn from_json(&mut self, shell: &mut NodeShell, data: &str) -> Result<()> {
        let record: UniformColorRecord = serde_json::from_str(data)?;
        record.base.apply_to(shell);
        record.base.apply_connections(shell);
        self.color = record.fields.color;
        Ok(())
    }

    fn get_binary(&self, shell: &NodeShell, w: &mut dyn Write) -> Result<()> {
        let base = NodeData::from_shell(shell, self.type_name());
        let fields = UniformColorFields { color: self.color };
        write_binary_record(w, BINARY_VERSION, &base, &fields)
    }

    fn from_binary(&mut self, shell: &mut NodeShell, r: &mut dyn Read) -> Result<()> {
        let (_, base, fields): (u16, NodeData, UniformColorFields) =
            read_binary_record(r, BINARY_VERSION)?;
        base.apply_to(shell);
        base.apply_connections(shell);
        self.color = fields.color;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
