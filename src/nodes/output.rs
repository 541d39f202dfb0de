use std::io::{Read, Write};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::node::{
    NodeData, NodeOp, NodeShell, ProcessContext, ProcessOutcome, read_binary_record,
    write_binary_record,
};
use crate::port::{NodeInput, NodeOutput, OutputData};
use crate::value::TypeMask;

const BINARY_VERSION: u16 = 1;

#[derive(Serialize, Deserialize)]
struct OutputRecord {
    #[serde(flatten)]
    base: NodeData,
}

/// A named exit port a nested graph exposes; forwards whatever feeds it.
#[derive(Default)]
pub struct OutputNode;

impl OutputNode {
    pub fn new() -> Self {
        Self
    }
}

impl NodeOp for OutputNode {
    fn type_name(&self) -> &'static str {
        "graph_output"
    }

    fn init(&self, shell: &mut NodeShell) {
        shell.inputs.push(NodeInput::new(TypeMask::IMAGE, "Input"));
        shell.outputs.push(NodeOutput::new(TypeMask::IMAGE, "Output"));
    }

    fn process(&mut self, shell: &mut NodeShell, ctx: &mut ProcessContext<'_>) -> ProcessOutcome {
        let Some(binding) = ctx.input_texture(shell, 0) else {
            return ProcessOutcome::unchanged();
        };
        shell.width = binding.width;
        shell.height = binding.height;
        shell.outputs[0].data = Some(OutputData::Texture(binding));
        ProcessOutcome::changed([0])
    }

    fn get_json(&self, shell: &NodeShell) -> Result<String> {
        let record = OutputRecord {
            base: NodeData::from_shell(shell, self.type_name()),
        };
        Ok(serde_json::to_string(&record)?)
    }

    fn from_json(&mut self, shell: &mut NodeShell, data: &str) -> Result<()> {
        let record: OutputRecord = serde_json::from_str(data)?;
        record.base.apply_to(shell);
        record.base.apply_connections(shell);
        Ok(())
    }

    fn get_binary(&self, shell: &NodeShell, w: &mut dyn Write) -> Result<()> {
        let base = NodeData::from_shell(shell, self.type_name());
        write_binary_record(w, BINARY_VERSION, &base, &())
    }

    fn from_binary(&mut self, shell: &mut NodeShell, r: &mut dyn Read) -> Result<()> {
        let (_, base, ()) = read_binary_record::<()>(r, BINARY_VERSION)?;
        base.apply_to(shell);
        base.apply_connections(shell);
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
