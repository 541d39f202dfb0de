use std::io::{Read, Write};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::node::{
    NodeData, NodeOp, NodeShell, ProcessContext, ProcessOutcome, VariadicOutputs,
    read_binary_record, write_binary_record,
};
use crate::port::{NodeInput, NodeOutput};
use crate::value::TypeMask;

const BINARY_VERSION: u16 = 1;
const OUTPUT_FLOOR: usize = 2;

#[derive(Serialize, Deserialize)]
struct SequenceRecord {
    #[serde(flatten)]
    base: NodeData,
}

fn sequence_mask() -> TypeMask {
    TypeMask::IMAGE | TypeMask::ANY_VALUE
}

/// Fans one input out to an ordered, growable output list. The output list is
/// variadic: connecting the last slot grows it by one placeholder; trailing
/// empty slots shrink back toward the floor.
#[derive(Default)]
pub struct SequenceNode;

impl SequenceNode {
    pub fn new() -> Self {
        Self
    }
}

impl NodeOp for SequenceNode {
    fn type_name(&self) -> &'static str {
        "sequence"
    }

    fn init(&self, shell: &mut NodeShell) {
        shell
            .inputs
            .push(NodeInput::new(sequence_mask(), "Any Input"));
        for i in 0..OUTPUT_FLOOR {
            shell
                .outputs
                .push(NodeOutput::new(sequence_mask(), i.to_string()));
        }
        if shell.name.is_empty() {
            shell.name = "Sequence".to_string();
        }
    }

    fn variadic_outputs(&self) -> Option<VariadicOutputs> {
        Some(VariadicOutputs {
            floor: OUTPUT_FLOOR,
        })
    }

    fn process(&mut self, shell: &mut NodeShell, ctx: &mut ProcessContext<'_>) -> ProcessOutcome {
        let data = shell.inputs[0]
            .reference
            .as_ref()
            .and_then(|r| ctx.output_data(r))
            .cloned();
        let Some(data) = data else {
            return ProcessOutcome::unchanged();
        };

        let mut changed = Vec::with_capacity(shell.outputs.len());
        for (i, output) in shell.outputs.iter_mut().enumerate() {
            output.data = Some(data.clone());
            changed.push(i);
        }
        ProcessOutcome { changed }
    }

    fn get_json(&self, shell: &NodeShell) -> Result<String> {
        let record = SequenceRecord {
            base: NodeData::from_shell(shell, self.type_name()),
        };
        Ok(serde_json::to_string(&record)?)
    }

    fn from_json(&mut self, shell: &mut NodeShell, data: &str) -> Result<()> {
        let record: SequenceRecord = serde_json::from_str(data)?;
        record.base.apply_to(shell);
        // Grown output slots are part of the persisted shape; restore them
        // before the fan-out lists that land on them.
        while shell.outputs.len() < record.base.output_count {
            let name = shell.outputs.len().to_string();
            shell.outputs.push(NodeOutput::new(sequence_mask(), name));
        }
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
        while shell.outputs.len() < base.output_count {
            let name = shell.outputs.len().to_string();
            shell.outputs.push(NodeOutput::new(sequence_mask(), name));
        }
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
