use std::io::{Read, Write};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::node::{
    NodeData, NodeOp, NodeShell, ProcessContext, ProcessOutcome, read_binary_record,
    write_binary_record,
};
use crate::port::{NodeOutput, OutputData};
use crate::value::TypeMask;

const BINARY_VERSION: u16 = 1;

#[derive(Serialize, Deserialize)]
struct InputRecord {
    #[serde(flatten)]
    base: NodeData,
}

/// A named entry port a nested graph exposes. The embedding instance injects
/// the outer data through `external`; standalone graphs just publish nothing.
#[derive(Default)]
pub struct InputNode {
    pub external: Option<OutputData>,
}

impl InputNode {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeOp for InputNode {
    fn type_name(&self) -> &'static str {
        "graph_input"
    }

    fn init(&self, shell: &mut NodeShell) {
        shell.outputs.push(NodeOutput::new(TypeMask::IMAGE, "Input"));
    }

    fn process(&mut self, shell: &mut NodeShell, _ctx: &mut ProcessContext<'_>) -> ProcessOutcome {
        let Some(data) = self.external.clone() else {
            return ProcessOutcome::unchanged();
        };
        if let OutputData::Texture(binding) = &data {
            shell.width = binding.width;
            shell.height = binding.height;
        }
        shell.outputs[0].data = Some(data);
        ProcessOutcome::changed([0])
    }

    fn get_json(&self, shell: &NodeShell) -> Result<String> {
        let record = InputRecord {
            base: NodeData::from_shell(shell, self.type_name()),
        };
        Ok(serde_json::to_string(&record)?)
    }

    fn from_json(&mut self, shell: &mut NodeShell, data: &str) -> Result<()> {
        let record: InputRecord = serde_json::from_str(data)?;
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
