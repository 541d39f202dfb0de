use std::io::{Read, Write};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::function::{ExecutionMode, FunctionGraph, validate_wgsl};
use crate::gpu::{FULLSCREEN_VS, PassKind, TextureDesc, TexturePass, ensure_texture};
use crate::node::{
    NodeData, NodeOp, NodeShell, ProcessContext, ProcessOutcome, read_binary_record,
    write_binary_record,
};
use crate::port::{NodeOutput, OutputData, TextureBinding};
use crate::value::{PixelFormat, TypeMask};

const BINARY_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PixelProcessorFields {
    function: Option<FunctionGraph>,
}

#[derive(Serialize, Deserialize)]
struct PixelProcessorRecord {
    #[serde(flatten)]
    base: NodeData,
    #[serde(flatten)]
    fields: PixelProcessorFields,
}

struct Compiled {
    source: String,
    content_hash: u64,
    uniform_decl: String,
    format: PixelFormat,
    size: (u32, u32),
}

/// Hosts a per-pixel function compiled into this node's fragment program.
///
/// The compiled program is cached and reused until the function's generated
/// code (including its transitive custom-call set) changes content hash, the
/// pixel format or size changes, or the uniform surface changes shape — the
/// rebuild triggers of the compiled evaluation path. A program that fails
/// validation is logged and the node refuses to process until a valid one
/// exists.
pub struct PixelProcessorNode {
    pub function: Option<FunctionGraph>,
    compiled: Option<Compiled>,
}

impl Default for PixelProcessorNode {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelProcessorNode {
    pub fn new() -> Self {
        Self {
            function: None,
            compiled: None,
        }
    }

    pub fn set_function(&mut self, mut function: FunctionGraph) {
        function.execution = ExecutionMode::Compiled;
        self.function = Some(function);
        self.compiled = None;
    }

    /// Whether a valid compiled program is currently cached.
    pub fn has_program(&self) -> bool {
        self.compiled.is_some()
    }

    fn call_args(function: &FunctionGraph, shell: &NodeShell) -> String {
        function
            .args
            .iter()
            .map(|arg| match arg.name.as_str() {
                "uv" => "vec4<f32>(in.uv, 0.0, 1.0)".to_string(),
                "size" => format!(
                    "vec4<f32>({:?}, {:?}, 0.0, 1.0)",
                    shell.width as f32, shell.height as f32
                ),
                _ => "vec4<f32>(0.0)".to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl NodeOp for PixelProcessorNode {
    fn type_name(&self) -> &'static str {
        "pixel_processor"
    }

    fn init(&self, shell: &mut NodeShell) {
        shell.outputs.push(NodeOutput::new(TypeMask::IMAGE, ""));
        if shell.name.is_empty() {
            shell.name = "Pixel Processor".to_string();
        }
    }

    fn process(&mut self, shell: &mut NodeShell, ctx: &mut ProcessContext<'_>) -> ProcessOutcome {
        let Some(function) = self.function.as_ref() else {
            return ProcessOutcome::unchanged();
        };

        let bundle = match function.shader_bundle(&ctx.params.functions) {
            Ok(bundle) => bundle,
            Err(e) => {
                log::error!("[pixel] '{}' failed to generate code: {e:#}", shell.name);
                self.compiled = None;
                return ProcessOutcome::unchanged();
            }
        };

        // Function-bound parameters of this node are folded into the program;
        // only the remaining literals surface as uniforms.
        let (uniform_decl, uniform_bytes) = ctx.params.uniform_block(&shell.id);

        let size = (shell.width, shell.height);
        let up_to_date = self.compiled.as_ref().is_some_and(|c| {
            c.content_hash == bundle.content_hash
                && c.uniform_decl == uniform_decl
                && c.format == shell.pixel_format
                && c.size == size
        });

        if !up_to_date {
            let source = format!(
                "{uniform_decl}\n{}\n@fragment\nfn fs_main(in: VsOut) -> @location(0) vec4<f32> {{\n    return {}({});\n}}\n",
                bundle.code,
                bundle.entry_name,
                Self::call_args(function, shell),
            );
            if let Err(e) = validate_wgsl(&format!("{FULLSCREEN_VS}\n{source}")) {
                log::error!(
                    "[pixel] '{}' produced an invalid program; refusing to process: {e:#}",
                    shell.name
                );
                self.compiled = None;
                return ProcessOutcome::unchanged();
            }
            self.compiled = Some(Compiled {
                source,
                content_hash: bundle.content_hash,
                uniform_decl,
                format: shell.pixel_format,
                size,
            });
        }

        let Some(compiled) = self.compiled.as_ref() else {
            return ProcessOutcome::unchanged();
        };

        let handle = ensure_texture(
            &mut ctx.res.textures,
            shell.buffer,
            TextureDesc {
                width: shell.width,
                height: shell.height,
                format: shell.pixel_format,
                label: format!("pixel_processor.{}", shell.id),
            },
        );
        shell.buffer = Some(handle);

        ctx.res.queue_pass(TexturePass {
            label: format!("pixel processor '{}'", shell.name),
            target: handle,
            kind: PassKind::Draw {
                shader: compiled.source.clone(),
                inputs: Vec::new(),
                uniforms: uniform_bytes,
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
        let record = PixelProcessorRecord {
            base: NodeData::from_shell(shell, self.type_name()),
            fields: PixelProcessorFields {
                function: self.function.clone(),
            },
        };
        Ok(serde_json::to_string(&record)?)
    }

    fn from_json(&mut self, shell: &mut NodeShell, data: &str) -> Result<()> {
        let record: PixelProcessorRecord = serde_json::from_str(data)?;
        record.base.apply_to(shell);
        record.base.apply_connections(shell);
        self.function = record.fields.function;
        self.compiled = None;
        Ok(())
    }

    fn get_binary(&self, shell: &NodeShell, w: &mut dyn Write) -> Result<()> {
        let base = NodeData::from_shell(shell, self.type_name());
        let fields = PixelProcessorFields {
            function: self.function.clone(),
        };
        write_binary_record(w, BINARY_VERSION, &base, &fields)
    }

    fn from_binary(&mut self, shell: &mut NodeShell, r: &mut dyn Read) -> Result<()> {
        let (_, base, fields): (u16, NodeData, PixelProcessorFields) =
            read_binary_record(r, BINARY_VERSION)?;
        base.apply_to(shell);
        base.apply_connections(shell);
        self.function = fields.function;
        self.compiled = None;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
