use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::function::{FunctionGraph, VarScope, sanitize_ident};
use crate::value::{Value, ValueKind};

/// What a parameter slot holds: a plain literal or a bound function graph,
/// never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "binding", content = "data", rename_all = "snake_case")]
pub enum ParamBinding {
    Literal(Value),
    Function(FunctionGraph),
}

impl ParamBinding {
    pub fn is_function(&self) -> bool {
        matches!(self, ParamBinding::Function(_))
    }
}

/// A named, typed override slot. `key` is the `"nodeId.propName"` composite
/// it overrides, or `None` for a free-standing (custom, graph-level) value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub id: String,
    pub name: String,
    pub key: Option<String>,
    pub kind: ValueKind,
    pub binding: ParamBinding,
    pub min: f32,
    pub max: f32,
    pub description: String,
    pub section: String,
}

impl ParameterValue {
    pub fn literal(name: impl Into<String>, value: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            key: None,
            kind: value.kind(),
            binding: ParamBinding::Literal(value),
            min: 0.0,
            max: 1.0,
            description: String::new(),
            section: "Default".to_string(),
        }
    }

    pub fn function(name: impl Into<String>, graph: FunctionGraph) -> Self {
        let kind = graph.expected_output;
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            key: None,
            kind,
            binding: ParamBinding::Function(graph),
            min: 0.0,
            max: 1.0,
            description: String::new(),
            section: "Default".to_string(),
        }
    }

    pub fn is_function(&self) -> bool {
        self.binding.is_function()
    }

    pub fn assign_value(&mut self, value: Value) {
        self.kind = value.kind();
        self.binding = ParamBinding::Literal(value);
    }
}

pub fn param_key(node_id: &str, prop: &str) -> String {
    format!("{node_id}.{prop}")
}

/// The graph's parameter surface: promoted overrides keyed by
/// `"nodeId.prop"`, ordered custom parameters, and the custom function
/// library callable from any bound function.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterStore {
    pub parameters: BTreeMap<String, ParameterValue>,
    pub custom: Vec<ParameterValue>,
    pub functions: Vec<FunctionGraph>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_value(&self, node_id: &str, prop: &str) -> bool {
        self.parameters.contains_key(&param_key(node_id, prop))
    }

    pub fn is_function(&self, node_id: &str, prop: &str) -> bool {
        self.parameters
            .get(&param_key(node_id, prop))
            .is_some_and(ParameterValue::is_function)
    }

    pub fn get_raw(&self, node_id: &str, prop: &str) -> Option<&ParameterValue> {
        self.parameters.get(&param_key(node_id, prop))
    }

    pub fn get_raw_mut(&mut self, node_id: &str, prop: &str) -> Option<&mut ParameterValue> {
        self.parameters.get_mut(&param_key(node_id, prop))
    }

    /// Store an override at `(node_id, prop)`, replacing whatever was there.
    pub fn set_value(&mut self, node_id: &str, prop: &str, binding: ParamBinding) {
        let key = param_key(node_id, prop);
        let kind = match &binding {
            ParamBinding::Literal(v) => v.kind(),
            ParamBinding::Function(f) => f.expected_output,
        };
        match self.parameters.get_mut(&key) {
            Some(existing) => {
                existing.kind = kind;
                existing.binding = binding;
            }
            None => {
                let mut p = match binding {
                    ParamBinding::Literal(v) => ParameterValue::literal(prop, v),
                    ParamBinding::Function(f) => ParameterValue::function(prop, f),
                };
                p.key = Some(key.clone());
                self.parameters.insert(key, p);
            }
        }
    }

    /// Remove an override; the node's own field becomes visible again.
    pub fn remove_value(&mut self, node_id: &str, prop: &str) -> Option<ParameterValue> {
        self.parameters.remove(&param_key(node_id, prop))
    }

    /// Evaluate the override at `(node_id, prop)`: a bound function is run in
    /// `scope` against the custom-function library; a literal is returned as
    /// stored. `None` when no override exists or evaluation fails (logged) —
    /// never an error to the caller.
    pub fn resolve(&self, node_id: &str, prop: &str, scope: &VarScope) -> Option<Value> {
        let param = self.parameters.get(&param_key(node_id, prop))?;
        match &param.binding {
            ParamBinding::Literal(v) => Some(v.convert_to(param.kind)),
            ParamBinding::Function(f) => match f.eval(scope, &self.functions) {
                Ok(v) => Some(v),
                Err(e) => {
                    log::warn!(
                        "[params] function for {node_id}.{prop} failed to evaluate: {e:#}"
                    );
                    None
                }
            },
        }
    }

    pub fn custom_by_name(&self, name: &str) -> Option<&ParameterValue> {
        self.custom.iter().find(|p| p.name == name)
    }

    pub fn custom_by_name_mut(&mut self, name: &str) -> Option<&mut ParameterValue> {
        self.custom.iter_mut().find(|p| p.name == name)
    }

    pub fn add_custom(&mut self, param: ParameterValue) {
        if self.custom_by_name(&param.name).is_none() {
            self.custom.push(param);
        }
    }

    pub fn remove_custom(&mut self, name: &str) -> Option<ParameterValue> {
        let index = self.custom.iter().position(|p| p.name == name)?;
        Some(self.custom.remove(index))
    }

    pub fn function_by_name(&self, name: &str) -> Option<&FunctionGraph> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn add_function(&mut self, graph: FunctionGraph) {
        if self.function_by_name(&graph.name).is_none() {
            self.functions.push(graph);
        }
    }

    pub fn remove_function(&mut self, name: &str) -> Option<FunctionGraph> {
        let index = self.functions.iter().position(|f| f.name == name)?;
        Some(self.functions.remove(index))
    }

    /// Export every literal parameter into `scope` under a `p_` prefix, the
    /// names bound functions read them by.
    pub fn export_literals(&self, scope: &mut VarScope) {
        for param in self.parameters.values() {
            if let ParamBinding::Literal(v) = &param.binding {
                scope.set(format!("p_{}", sanitize_ident(&param.name)), *v);
            }
        }
        for param in &self.custom {
            if let ParamBinding::Literal(v) = &param.binding {
                scope.set(format!("p_{}", sanitize_ident(&param.name)), *v);
            }
        }
    }

    /// Forward a new random seed to every bound and library function.
    pub fn assign_seed(&mut self, seed: i32) {
        for param in self.parameters.values_mut() {
            if let ParamBinding::Function(f) = &mut param.binding {
                f.assign_seed(seed);
            }
        }
        for param in &mut self.custom {
            if let ParamBinding::Function(f) = &mut param.binding {
                f.assign_seed(seed);
            }
        }
        for f in &mut self.functions {
            f.assign_seed(seed);
        }
    }

    /// Uniform block for a node's compiled program: every literal parameter
    /// becomes a `vec4<f32>` field, while function-bound parameters of
    /// `exclude_node` are skipped — their code is folded into the program
    /// itself rather than passed as uniforms.
    pub fn uniform_block(&self, exclude_node: &str) -> (String, Vec<u8>) {
        let mut fields: Vec<(String, [f32; 4])> = Vec::new();

        for (key, param) in &self.parameters {
            match &param.binding {
                ParamBinding::Literal(v) => {
                    fields.push((format!("p_{}", sanitize_ident(&param.name)), v.as_float4()));
                }
                ParamBinding::Function(_) => {
                    if key.starts_with(&format!("{exclude_node}.")) {
                        continue;
                    }
                }
            }
        }
        for param in &self.custom {
            if let ParamBinding::Literal(v) = &param.binding {
                fields.push((format!("p_{}", sanitize_ident(&param.name)), v.as_float4()));
            }
        }

        fields.sort_by(|a, b| a.0.cmp(&b.0));
        fields.dedup_by(|a, b| a.0 == b.0);

        if fields.is_empty() {
            return (String::new(), Vec::new());
        }

        let mut decl = String::from("struct FnUniforms {\n");
        let mut bytes: Vec<u8> = Vec::with_capacity(fields.len() * 16);
        for (name, value) in &fields {
            decl.push_str(&format!("    {name}: vec4<f32>,\n"));
            for lane in value {
                bytes.extend_from_slice(&lane.to_le_bytes());
            }
        }
        decl.push_str("};\n@group(0) @binding(0) var<uniform> uni: FnUniforms;\n");
        (decl, bytes)
    }
}
