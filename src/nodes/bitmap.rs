use std::io::{Read, Write};
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::environment::Environment;
use crate::gpu::{PassKind, TextureDesc, TexturePass, ensure_texture};
use crate::node::{
    NodeData, NodeOp, NodeShell, ProcessContext, ProcessOutcome, copy_resource_to,
    read_binary_record, write_binary_record,
};
use crate::port::{NodeOutput, OutputData, TextureBinding};
use crate::value::{PixelFormat, TypeMask};

const BINARY_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct BitmapFields {
    path: String,
}

#[derive(Serialize, Deserialize)]
struct BitmapRecord {
    #[serde(flatten)]
    base: NodeData,
    #[serde(flatten)]
    fields: BitmapFields,
}

/// File-backed image source. Its dimensions are intrinsic: they come from the
/// decoded image and ignore proportional graph resizes. An unresolved source
/// is the steady no-output state, not an error.
pub struct BitmapNode {
    pub path: String,
    image: Option<image::RgbaImage>,
    load_failed: bool,
    needs_upload: bool,
}

impl Default for BitmapNode {
    fn default() -> Self {
        Self::new()
    }
}

impl BitmapNode {
    pub fn new() -> Self {
        Self {
            path: String::new(),
            image: None,
            load_failed: false,
            needs_upload: false,
        }
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
        self.image = None;
        self.load_failed = false;
        self.needs_upload = false;
    }

    /// Hand a decoded image in directly (drag-and-drop hosts, tests).
    pub fn set_image(&mut self, image: image::RgbaImage) {
        self.image = Some(image);
        self.load_failed = false;
        self.needs_upload = true;
    }

    fn try_load(&mut self) {
        if self.image.is_some() || self.load_failed || self.path.is_empty() {
            return;
        }
        match std::fs::read(&self.path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| Ok(image::load_from_memory(&bytes)?))
        {
            Ok(decoded) => {
                self.image = Some(decoded.to_rgba8());
                self.needs_upload = true;
            }
            Err(e) => {
                log::warn!("[bitmap] failed to load '{}': {e:#}", self.path);
                self.load_failed = true;
            }
        }
    }
}

impl NodeOp for BitmapNode {
    fn type_name(&self) -> &'static str {
        "bitmap"
    }

    fn init(&self, shell: &mut NodeShell) {
        shell.outputs.push(NodeOutput::new(TypeMask::COLOR, ""));
        if shell.name.is_empty() {
            shell.name = "Bitmap".to_string();
        }
    }

    fn respects_resize(&self) -> bool {
        false
    }

    fn process(&mut self, shell: &mut NodeShell, ctx: &mut ProcessContext<'_>) -> ProcessOutcome {
        self.try_load();
        let Some(image) = self.image.as_ref() else {
            return ProcessOutcome::unchanged();
        };

        let (width, height) = image.dimensions();
        shell.width = width;
        shell.height = height;

        let previous = shell.buffer;
        let handle = ensure_texture(
            &mut ctx.res.textures,
            shell.buffer,
            TextureDesc {
                width,
                height,
                format: PixelFormat::Rgba8,
                label: format!("bitmap.{}", shell.id),
            },
        );
        shell.buffer = Some(handle);

        if self.needs_upload || previous != Some(handle) {
            ctx.res.queue_pass(TexturePass {
                label: format!("bitmap '{}'", shell.name),
                target: handle,
                kind: PassKind::Upload {
                    pixels: image.as_raw().clone(),
                },
            });
            self.needs_upload = false;
        }

        shell.outputs[0].data = Some(OutputData::Texture(TextureBinding {
            handle,
            width,
            height,
            format: PixelFormat::Rgba8,
        }));
        ProcessOutcome::changed([0])
    }

    fn copy_resources(&mut self, _shell: &NodeShell, cwd: &Path, _env: &Environment) -> Result<()> {
        if self.path.is_empty() {
            return Ok(());
        }
        let source = Path::new(&self.path);
        let Some(file_name) = source.file_name().and_then(|n| n.to_str()) else {
            return Ok(());
        };
        let relative = format!("resources/{file_name}");
        copy_resource_to(cwd, &relative, source, Path::new(""))
    }

    fn get_json(&self, shell: &NodeShell) -> Result<String> {
        let record = BitmapRecord {
            base: NodeData::from_shell(shell, self.type_name()),
            fields: BitmapFields {
                path: self.path.clone(),
            },
        };
        Ok(serde_json::to_string(&record)?)
    }

    fn from_json(&mut self, shell: &mut NodeShell, data: &str) -> Result<()> {
        let record: BitmapRecord = serde_json::from_str(data)?;
        record.base.apply_to(shell);
        record.base.apply_connections(shell);
        self.set_path(record.fields.path);
        Ok(())
    }

    fn get_binary(&self, shell: &NodeShell, w: &mut dyn Write) -> Result<()> {
        let base = NodeData::from_shell(shell, self.type_name());
        let fields = BitmapFields {
            path: self.path.clone(),
        };
        write_binary_record(w, BINARY_VERSION, &base, &fields)
    }

    fn from_binary(&mut self, shell: &mut NodeShell, r: &mut dyn Read) -> Result<()> {
        let (_, base, fields): (u16, NodeData, BitmapFields) =
            read_binary_record(r, BINARY_VERSION)?;
        base.apply_to(shell);
        base.apply_connections(shell);
        self.set_path(fields.path);
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
