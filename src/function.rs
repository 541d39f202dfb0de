//! Expression sub-graphs ("functions"): small math graphs with named external
//! variables and one typed result. A function is either walked on the CPU
//! (per-call evaluation) or lowered to WGSL and concatenated into the host
//! node's generated program. Hosts track the generated code of the transitive
//! call set by content hash and rebuild only when it changes.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::value::{Value, ValueKind};

/// Named values injected into function evaluation: graph variables, promoted
/// literals (`p_` prefixed), builtins (`size`, `seed`) and per-call context
/// (`uv`, `index`, ...).
#[derive(Debug, Clone, Default)]
pub struct VarScope {
    vars: HashMap<String, Value>,
}

impl VarScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.vars.get(name).copied()
    }

    pub fn has(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Walked on the CPU when the host evaluates per call.
    Interpreted,
    /// Lowered to WGSL inside the host node's program.
    Compiled,
}

/// One math operation. Variadic wiring lives on the node, not the op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum FnOp {
    Const(Value),
    /// Read a named external variable.
    Var(String),
    Add,
    Subtract,
    Multiply,
    Divide,
    Negate,
    Abs,
    Floor,
    Fract,
    Sqrt,
    Pow,
    Min,
    Max,
    Clamp,
    Mix,
    Step,
    Dot,
    Length,
    Normalize,
    Sin,
    Cos,
    /// Seeded hash noise of its single input.
    Random,
    /// Extract one lane.
    Component(usize),
    MakeFloat2,
    MakeFloat3,
    MakeFloat4,
    /// Invoke a named custom function from the graph's library.
    Call(String),
}

impl FnOp {
    pub fn arity(&self) -> usize {
        match self {
            FnOp::Const(_) | FnOp::Var(_) => 0,
            FnOp::Negate
            | FnOp::Abs
            | FnOp::Floor
            | FnOp::Fract
            | FnOp::Sqrt
            | FnOp::Sin
            | FnOp::Cos
            | FnOp::Length
            | FnOp::Normalize
            | FnOp::Random
            | FnOp::Component(_) => 1,
            FnOp::Add
            | FnOp::Subtract
            | FnOp::Multiply
            | FnOp::Divide
            | FnOp::Pow
            | FnOp::Min
            | FnOp::Max
            | FnOp::Step
            | FnOp::Dot
            | FnOp::MakeFloat2 => 2,
            FnOp::Clamp | FnOp::Mix | FnOp::MakeFloat3 => 3,
            FnOp::MakeFloat4 => 4,
            FnOp::Call(_) => usize::MAX, // bound by the callee's arg list
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FnNode {
    pub id: String,
    pub op: FnOp,
    /// Producer node index per input slot; `None` slots read as zero.
    pub inputs: Vec<Option<usize>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FnArg {
    pub name: String,
    pub kind: ValueKind,
}

/// Generated WGSL for one function plus the identity of everything that went
/// into it.
#[derive(Debug, Clone)]
pub struct FunctionShader {
    pub code: String,
    pub entry_name: String,
    pub content_hash: u64,
    /// Names of the custom functions transitively included.
    pub calls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionGraph {
    pub name: String,
    pub nodes: Vec<FnNode>,
    pub result: Option<usize>,
    pub args: Vec<FnArg>,
    pub expected_output: ValueKind,
    pub execution: ExecutionMode,
    pub random_seed: i32,
    #[serde(skip)]
    pub modified: bool,
}

impl FunctionGraph {
    pub fn new(name: impl Into<String>, expected_output: ValueKind) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            result: None,
            args: Vec::new(),
            expected_output,
            execution: ExecutionMode::Interpreted,
            random_seed: 0,
            modified: false,
        }
    }

    pub fn add_arg(&mut self, name: impl Into<String>, kind: ValueKind) {
        self.args.push(FnArg {
            name: name.into(),
            kind,
        });
        self.modified = true;
    }

    pub fn constant(&mut self, value: Value) -> usize {
        self.push(FnOp::Const(value), &[])
    }

    pub fn variable(&mut self, name: impl Into<String>) -> usize {
        self.push(FnOp::Var(name.into()), &[])
    }

    pub fn push(&mut self, op: FnOp, inputs: &[usize]) -> usize {
        let arity = match &op {
            FnOp::Call(_) => inputs.len(),
            other => other.arity(),
        };
        let mut slots: Vec<Option<usize>> = inputs.iter().copied().map(Some).collect();
        slots.resize(arity, None);
        let index = self.nodes.len();
        self.nodes.push(FnNode {
            id: uuid::Uuid::new_v4().to_string(),
            op,
            inputs: slots,
        });
        self.modified = true;
        index
    }

    pub fn set_result(&mut self, index: usize) {
        self.result = Some(index);
        self.modified = true;
    }

    pub fn assign_seed(&mut self, seed: i32) {
        if self.random_seed != seed {
            self.random_seed = seed;
            self.modified = true;
        }
    }

    /// Interpret the graph on the CPU and return the typed result.
    /// Unconnected slots read as zero; a missing result node is an error.
    pub fn eval(&self, scope: &VarScope, lib: &[FunctionGraph]) -> Result<Value> {
        let mut calls: Vec<&str> = Vec::new();
        self.eval_inner(scope, lib, &mut calls)
    }

    fn eval_inner<'a>(
        &'a self,
        scope: &VarScope,
        lib: &'a [FunctionGraph],
        call_stack: &mut Vec<&'a str>,
    ) -> Result<Value> {
        let result = self
            .result
            .ok_or_else(|| anyhow!("function '{}' has no result node", self.name))?;
        let mut memo: HashMap<usize, Value> = HashMap::new();
        let mut visiting: HashSet<usize> = HashSet::new();
        let value = self.eval_node(result, scope, lib, &mut memo, &mut visiting, call_stack)?;
        Ok(value.convert_to(self.expected_output))
    }

    fn eval_node<'a>(
        &'a self,
        index: usize,
        scope: &VarScope,
        lib: &'a [FunctionGraph],
        memo: &mut HashMap<usize, Value>,
        visiting: &mut HashSet<usize>,
        call_stack: &mut Vec<&'a str>,
    ) -> Result<Value> {
        if let Some(v) = memo.get(&index) {
            return Ok(*v);
        }
        if !visiting.insert(index) {
            bail!("cycle detected in function '{}'", self.name);
        }

        let node = self
            .nodes
            .get(index)
            .ok_or_else(|| anyhow!("function '{}' references missing node", self.name))?;

        let mut inputs: Vec<Value> = Vec::with_capacity(node.inputs.len());
        for slot in &node.inputs {
            let v = match slot {
                Some(src) => self.eval_node(*src, scope, lib, memo, visiting, call_stack)?,
                None => Value::Float(0.0),
            };
            inputs.push(v);
        }

        let value = self.apply(node, &inputs, scope, lib, call_stack)?;
        visiting.remove(&index);
        memo.insert(index, value);
        Ok(value)
    }

    fn apply<'a>(
        &'a self,
        node: &'a FnNode,
        inputs: &[Value],
        scope: &VarScope,
        lib: &'a [FunctionGraph],
        call_stack: &mut Vec<&'a str>,
    ) -> Result<Value> {
        let a = |i: usize| inputs.get(i).copied().unwrap_or(Value::Float(0.0));

        Ok(match &node.op {
            FnOp::Const(v) => *v,
            FnOp::Var(name) => scope.get(name).unwrap_or(Value::Float(0.0)),
            FnOp::Add => zip(a(0), a(1), |x, y| x + y),
            FnOp::Subtract => zip(a(0), a(1), |x, y| x - y),
            FnOp::Multiply => zip(a(0), a(1), |x, y| x * y),
            FnOp::Divide => zip(a(0), a(1), |x, y| if y == 0.0 { 0.0 } else { x / y }),
            FnOp::Negate => map(a(0), |x| -x),
            FnOp::Abs => map(a(0), f32::abs),
            FnOp::Floor => map(a(0), f32::floor),
            FnOp::Fract => map(a(0), |x| x - x.floor()),
            FnOp::Sqrt => map(a(0), |x| x.max(0.0).sqrt()),
            FnOp::Pow => zip(a(0), a(1), f32::powf),
            FnOp::Min => zip(a(0), a(1), f32::min),
            FnOp::Max => zip(a(0), a(1), f32::max),
            FnOp::Clamp => {
                let lo = a(1);
                let hi = a(2);
                zip(zip(a(0), lo, f32::max), hi, f32::min)
            }
            FnOp::Mix => {
                let t = a(2);
                zip3(a(0), a(1), t, |x, y, t| x + (y - x) * t)
            }
            FnOp::Step => zip(a(0), a(1), |edge, x| if x < edge { 0.0 } else { 1.0 }),
            FnOp::Dot => {
                let x = a(0).as_float4();
                let y = a(1).as_float4();
                let lanes = a(0).lanes().max(a(1).lanes());
                Value::Float((0..lanes).map(|i| x[i] * y[i]).sum())
            }
            FnOp::Length => {
                let x = a(0).as_float4();
                let lanes = a(0).lanes();
                Value::Float((0..lanes).map(|i| x[i] * x[i]).sum::<f32>().sqrt())
            }
            FnOp::Normalize => {
                let x = a(0);
                let v = x.as_float4();
                let lanes = x.lanes();
                let len = (0..lanes).map(|i| v[i] * v[i]).sum::<f32>().sqrt();
                if len == 0.0 {
                    x
                } else {
                    map(x, |c| c / len)
                }
            }
            FnOp::Sin => map(a(0), f32::sin),
            FnOp::Cos => map(a(0), f32::cos),
            FnOp::Random => {
                let seed = self.random_seed as f32;
                map(a(0), move |x| {
                    let s = (x * 12.9898 + seed * 78.233).sin() * 43758.5453;
                    s - s.floor()
                })
            }
            FnOp::Component(i) => Value::Float(*a(0).as_float4().get(*i).unwrap_or(&0.0)),
            FnOp::MakeFloat2 => Value::Float2([a(0).as_float(), a(1).as_float()]),
            FnOp::MakeFloat3 => {
                Value::Float3([a(0).as_float(), a(1).as_float(), a(2).as_float()])
            }
            FnOp::MakeFloat4 => Value::Float4([
                a(0).as_float(),
                a(1).as_float(),
                a(2).as_float(),
                a(3).as_float(),
            ]),
            FnOp::Call(name) => {
                let callee = lib
                    .iter()
                    .find(|f| f.name == *name)
                    .ok_or_else(|| anyhow!("call to unknown function '{name}'"))?;
                if call_stack.iter().any(|n| *n == callee.name.as_str()) {
                    log::warn!("[function] recursive call chain through '{name}', yielding 0");
                    return Ok(Value::Float(0.0));
                }
                call_stack.push(callee.name.as_str());
                let mut child = scope.clone();
                for (arg, value) in callee.args.iter().zip(inputs.iter()) {
                    child.set(arg.name.clone(), value.convert_to(arg.kind));
                }
                let out = callee.eval_inner(&child, lib, call_stack)?;
                call_stack.pop();
                out
            }
        })
    }

    /// External variable names this graph (not its callees) reads, excluding
    /// its declared args and per-call builtins.
    pub fn free_variables(&self) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut names: Vec<String> = Vec::new();
        for node in &self.nodes {
            if let FnOp::Var(name) = &node.op {
                if self.args.iter().any(|a| a.name == *name) {
                    continue;
                }
                if seen.insert(name.as_str()) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    /// Lower this graph (plus its transitive custom-call set) to WGSL. Every
    /// value is a `vec4<f32>`; the host converts the result to its expected
    /// kind. Declared args become function parameters the host supplies at
    /// the call site; free variables reference fields of a `uni` uniform
    /// block the host declares.
    pub fn shader_bundle(&self, lib: &[FunctionGraph]) -> Result<FunctionShader> {
        let mut emitted: Vec<String> = Vec::new();
        let mut calls: Vec<String> = Vec::new();
        let mut code = String::new();
        self.emit_function(lib, &mut emitted, &mut calls, &mut code)?;

        let mut hasher = DefaultHasher::new();
        code.hash(&mut hasher);

        Ok(FunctionShader {
            entry_name: sanitize_ident(&self.name),
            code,
            content_hash: hasher.finish(),
            calls,
        })
    }

    fn emit_function(
        &self,
        lib: &[FunctionGraph],
        emitted: &mut Vec<String>,
        calls: &mut Vec<String>,
        code: &mut String,
    ) -> Result<()> {
        if emitted.iter().any(|n| n == &self.name) {
            return Ok(());
        }
        emitted.push(self.name.clone());

        // Callees first, skipping self-recursion the way the interpreter does.
        for node in &self.nodes {
            if let FnOp::Call(name) = &node.op {
                if *name == self.name {
                    continue;
                }
                let callee = lib
                    .iter()
                    .find(|f| f.name == *name)
                    .ok_or_else(|| anyhow!("call to unknown function '{name}'"))?;
                callee.emit_function(lib, emitted, calls, code)?;
                if !calls.contains(name) {
                    calls.push(name.clone());
                }
            }
        }

        let result = self
            .result
            .ok_or_else(|| anyhow!("function '{}' has no result node", self.name))?;

        let mut body = String::new();
        let mut names: HashMap<usize, String> = HashMap::new();
        let mut visiting: HashSet<usize> = HashSet::new();
        let out = self.emit_node(result, &mut body, &mut names, &mut visiting)?;

        let args = self
            .args
            .iter()
            .map(|a| format!("{}: vec4<f32>", sanitize_ident(&a.name)))
            .collect::<Vec<_>>()
            .join(", ");

        let _ = write!(
            code,
            "fn {}({}) -> vec4<f32> {{\n{body}    return {out};\n}}\n\n",
            sanitize_ident(&self.name),
            args
        );
        Ok(())
    }

    fn emit_node(
        &self,
        index: usize,
        body: &mut String,
        names: &mut HashMap<usize, String>,
        visiting: &mut HashSet<usize>,
    ) -> Result<String> {
        if let Some(name) = names.get(&index) {
            return Ok(name.clone());
        }
        if !visiting.insert(index) {
            bail!("cycle detected in function '{}'", self.name);
        }

        let node = self
            .nodes
            .get(index)
            .ok_or_else(|| anyhow!("function '{}' references missing node", self.name))?;

        let mut ins: Vec<String> = Vec::with_capacity(node.inputs.len());
        for slot in &node.inputs {
            let expr = match slot {
                Some(src) => self.emit_node(*src, body, names, visiting)?,
                None => "vec4<f32>(0.0)".to_string(),
            };
            ins.push(expr);
        }

        let i = |k: usize| {
            ins.get(k)
                .cloned()
                .unwrap_or_else(|| "vec4<f32>(0.0)".to_string())
        };

        let expr = match &node.op {
            FnOp::Const(v) => {
                let c = v.as_float4();
                format!(
                    "vec4<f32>({:?}, {:?}, {:?}, {:?})",
                    c[0], c[1], c[2], c[3]
                )
            }
            FnOp::Var(name) => {
                if self.args.iter().any(|a| a.name == *name) {
                    sanitize_ident(name)
                } else {
                    format!("uni.{}", sanitize_ident(name))
                }
            }
            FnOp::Add => format!("({} + {})", i(0), i(1)),
            FnOp::Subtract => format!("({} - {})", i(0), i(1)),
            FnOp::Multiply => format!("({} * {})", i(0), i(1)),
            FnOp::Divide => format!("({} / max(abs({1}), vec4<f32>(1e-6)) * sign({1}))", i(0), i(1)),
            FnOp::Negate => format!("(-{})", i(0)),
            FnOp::Abs => format!("abs({})", i(0)),
            FnOp::Floor => format!("floor({})", i(0)),
            FnOp::Fract => format!("fract({})", i(0)),
            FnOp::Sqrt => format!("sqrt(max({}, vec4<f32>(0.0)))", i(0)),
            FnOp::Pow => format!("pow({}, {})", i(0), i(1)),
            FnOp::Min => format!("min({}, {})", i(0), i(1)),
            FnOp::Max => format!("max({}, {})", i(0), i(1)),
            FnOp::Clamp => format!("clamp({}, {}, {})", i(0), i(1), i(2)),
            FnOp::Mix => format!("mix({}, {}, {})", i(0), i(1), i(2)),
            FnOp::Step => format!("step({}, {})", i(0), i(1)),
            FnOp::Dot => format!("vec4<f32>(dot({}, {}))", i(0), i(1)),
            FnOp::Length => format!("vec4<f32>(length({}))", i(0)),
            FnOp::Normalize => format!("normalize({})", i(0)),
            FnOp::Sin => format!("sin({})", i(0)),
            FnOp::Cos => format!("cos({})", i(0)),
            FnOp::Random => format!(
                "fract(sin({} * 12.9898 + vec4<f32>({:?} * 78.233)) * 43758.5453)",
                i(0),
                self.random_seed as f32
            ),
            FnOp::Component(c) => format!("vec4<f32>({}[{}])", i(0), c.min(&3)),
            FnOp::MakeFloat2 => format!("vec4<f32>({}.x, {}.x, 0.0, 1.0)", i(0), i(1)),
            FnOp::MakeFloat3 => {
                format!("vec4<f32>({}.x, {}.x, {}.x, 1.0)", i(0), i(1), i(2))
            }
            FnOp::MakeFloat4 => format!(
                "vec4<f32>({}.x, {}.x, {}.x, {}.x)",
                i(0),
                i(1),
                i(2),
                i(3)
            ),
            FnOp::Call(name) => {
                if *name == self.name {
                    // Recursive self-call folds to zero, matching the
                    // interpreter's guard.
                    "vec4<f32>(0.0)".to_string()
                } else {
                    format!("{}({})", sanitize_ident(name), ins.join(", "))
                }
            }
        };

        let var = format!("s{index}");
        let _ = writeln!(body, "    let {var} = {expr};");
        visiting.remove(&index);
        names.insert(index, var.clone());
        Ok(var)
    }
}

fn map(v: Value, f: impl Fn(f32) -> f32) -> Value {
    let lanes = v.lanes();
    let a = v.as_float4();
    value_from_lanes([f(a[0]), f(a[1]), f(a[2]), f(a[3])], lanes)
}

fn zip(x: Value, y: Value, f: impl Fn(f32, f32) -> f32) -> Value {
    let lanes = x.lanes().max(y.lanes());
    let a = x.as_float4();
    let b = y.as_float4();
    value_from_lanes(
        [f(a[0], b[0]), f(a[1], b[1]), f(a[2], b[2]), f(a[3], b[3])],
        lanes,
    )
}

fn zip3(x: Value, y: Value, z: Value, f: impl Fn(f32, f32, f32) -> f32) -> Value {
    let lanes = x.lanes().max(y.lanes()).max(z.lanes());
    let a = x.as_float4();
    let b = y.as_float4();
    let c = z.as_float4();
    value_from_lanes(
        [
            f(a[0], b[0], c[0]),
            f(a[1], b[1], c[1]),
            f(a[2], b[2], c[2]),
            f(a[3], b[3], c[3]),
        ],
        lanes,
    )
}

fn value_from_lanes(v: [f32; 4], lanes: usize) -> Value {
    match lanes {
        2 => Value::Float2([v[0], v[1]]),
        3 => Value::Float3([v[0], v[1], v[2]]),
        4 => Value::Float4(v),
        _ => Value::Float(v[0]),
    }
}

pub fn sanitize_ident(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.is_empty() || out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, 'f');
    }
    out
}

/// Parse and validate a complete WGSL module, returning an error a host can
/// log before refusing to process.
pub fn validate_wgsl(source: &str) -> Result<()> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| anyhow!("wgsl parse error: {}", e.emit_to_string(source)))?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| anyhow!("wgsl validation error: {e:?}"))?;
    Ok(())
}
