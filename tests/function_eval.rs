use material_forge::function::validate_wgsl;
use material_forge::gpu::FULLSCREEN_VS;
use material_forge::{
    Environment, ExecutionMode, FnOp, FunctionGraph, Graph, OutputData, RenderResources, Value,
    ValueKind, VarScope, nodes,
};

fn scope_with(vars: &[(&str, Value)]) -> VarScope {
    let mut scope = VarScope::new();
    for (name, value) in vars {
        scope.set(*name, *value);
    }
    scope
}

#[test]
fn interpreter_evaluates_arithmetic() {
    // clamp(x * 2 + 1, 0, 10)
    let mut f = FunctionGraph::new("affine", ValueKind::Float);
    f.add_arg("x", ValueKind::Float);
    let x = f.variable("x");
    let two = f.constant(Value::Float(2.0));
    let one = f.constant(Value::Float(1.0));
    let zero = f.constant(Value::Float(0.0));
    let ten = f.constant(Value::Float(10.0));
    let mul = f.push(FnOp::Multiply, &[x, two]);
    let add = f.push(FnOp::Add, &[mul, one]);
    let clamped = f.push(FnOp::Clamp, &[add, zero, ten]);
    f.set_result(clamped);

    let out = f
        .eval(&scope_with(&[("x", Value::Float(2.0))]), &[])
        .expect("evaluates");
    assert_eq!(out, Value::Float(5.0));

    let out = f
        .eval(&scope_with(&[("x", Value::Float(100.0))]), &[])
        .expect("evaluates");
    assert_eq!(out, Value::Float(10.0), "clamp upper bound applies");
}

#[test]
fn interpreter_broadcasts_scalars_over_vectors() {
    // v * s with a vec2 and a scalar
    let mut f = FunctionGraph::new("scale", ValueKind::Float2);
    let v = f.constant(Value::Float2([1.0, 2.0]));
    let s = f.constant(Value::Float(3.0));
    let mul = f.push(FnOp::Multiply, &[v, s]);
    f.set_result(mul);

    let out = f.eval(&VarScope::new(), &[]).expect("evaluates");
    assert_eq!(out, Value::Float2([3.0, 6.0]));
}

#[test]
fn missing_variables_read_as_zero() {
    let mut f = FunctionGraph::new("lonely", ValueKind::Float);
    let v = f.variable("never_bound");
    f.set_result(v);
    let out = f.eval(&VarScope::new(), &[]).expect("evaluates");
    assert_eq!(out, Value::Float(0.0));
}

#[test]
fn seeded_random_is_deterministic_per_seed() {
    let mut f = FunctionGraph::new("noise", ValueKind::Float);
    let x = f.constant(Value::Float(0.37));
    let r = f.push(FnOp::Random, &[x]);
    f.set_result(r);

    let a = f.eval(&VarScope::new(), &[]).expect("evaluates");
    let b = f.eval(&VarScope::new(), &[]).expect("evaluates");
    assert_eq!(a, b, "same seed, same input, same noise");

    f.assign_seed(99);
    let c = f.eval(&VarScope::new(), &[]).expect("evaluates");
    assert_ne!(a, c, "a different seed shifts the noise");
}

#[test]
fn custom_function_calls_resolve_through_the_library() {
    let mut double = FunctionGraph::new("double", ValueKind::Float);
    double.add_arg("a", ValueKind::Float);
    let a = double.variable("a");
    let two = double.constant(Value::Float(2.0));
    let mul = double.push(FnOp::Multiply, &[a, two]);
    double.set_result(mul);

    let mut main = FunctionGraph::new("main_fn", ValueKind::Float);
    let three = main.constant(Value::Float(3.0));
    let call = main.push(FnOp::Call("double".to_string()), &[three]);
    main.set_result(call);

    let out = main.eval(&VarScope::new(), &[double]).expect("evaluates");
    assert_eq!(out, Value::Float(6.0));
}

#[test]
fn recursive_call_chains_fold_to_zero_instead_of_diverging() {
    let mut f = FunctionGraph::new("ouroboros", ValueKind::Float);
    let c = f.constant(Value::Float(1.0));
    let call = f.push(FnOp::Call("ouroboros".to_string()), &[c]);
    let sum = f.push(FnOp::Add, &[call, c]);
    f.set_result(sum);

    // One level of the call resolves through the library; the recursive call
    // inside it folds to zero. (0 + 1) + 1 = 2, and evaluation terminates.
    let lib = vec![f.clone()];
    let out = f.eval(&VarScope::new(), &lib).expect("must not recurse forever");
    assert_eq!(out, Value::Float(2.0));
}

#[test]
fn generated_wgsl_validates() {
    let mut f = FunctionGraph::new("pattern", ValueKind::Float4);
    f.add_arg("uv", ValueKind::Float2);
    let uv = f.variable("uv");
    let freq = f.constant(Value::Float(12.0));
    let scaled = f.push(FnOp::Multiply, &[uv, freq]);
    let s = f.push(FnOp::Sin, &[scaled]);
    let abs = f.push(FnOp::Abs, &[s]);
    f.set_result(abs);

    assert!(
        f.free_variables().is_empty(),
        "declared args are not free variables"
    );
    let bundle = f.shader_bundle(&[]).expect("codegen succeeds");
    assert!(bundle.code.contains("fn pattern("));

    let module = format!(
        "{FULLSCREEN_VS}\n{}\n@fragment\nfn fs_main(in: VsOut) -> @location(0) vec4<f32> {{\n    return pattern(vec4<f32>(in.uv, 0.0, 1.0));\n}}\n",
        bundle.code
    );
    validate_wgsl(&module).expect("generated module must be valid WGSL");
}

#[test]
fn content_hash_tracks_the_transitive_call_set() {
    let mut helper = FunctionGraph::new("helper", ValueKind::Float);
    helper.add_arg("a", ValueKind::Float);
    let a = helper.variable("a");
    let c = helper.constant(Value::Float(2.0));
    let mul = helper.push(FnOp::Multiply, &[a, c]);
    helper.set_result(mul);

    let mut main = FunctionGraph::new("main_fn", ValueKind::Float);
    let x = main.constant(Value::Float(1.0));
    let call = main.push(FnOp::Call("helper".to_string()), &[x]);
    main.set_result(call);

    let lib = vec![helper.clone()];
    let first = main.shader_bundle(&lib).expect("codegen");
    let again = main.shader_bundle(&lib).expect("codegen");
    assert_eq!(
        first.content_hash, again.content_hash,
        "unchanged call set must hash identically (program reuse)"
    );
    assert_eq!(first.calls, vec!["helper".to_string()]);

    // Editing the callee changes the transitive content hash.
    let mut edited = helper.clone();
    let c3 = edited.constant(Value::Float(3.0));
    let a2 = edited.variable("a");
    let mul = edited.push(FnOp::Multiply, &[a2, c3]);
    edited.set_result(mul);
    let second = main.shader_bundle(&[edited]).expect("codegen");
    assert_ne!(
        first.content_hash, second.content_hash,
        "an upstream function edit must force a rebuild"
    );
}

#[test]
fn pixel_processor_compiles_and_caches_its_program() {
    let mut graph = Graph::with_default_size("pp", Environment::new());
    let mut res = RenderResources::new();
    let entry = nodes::create_node("pixel_processor", 64, 64, Default::default()).expect("node");
    let id = graph.add(entry);

    let mut f = FunctionGraph::new("checker", ValueKind::Float4);
    f.add_arg("uv", ValueKind::Float2);
    let uv = f.variable("uv");
    let freq = f.constant(Value::Float(8.0));
    let scaled = f.push(FnOp::Multiply, &[uv, freq]);
    let fl = f.push(FnOp::Floor, &[scaled]);
    f.set_result(fl);

    {
        let entry = graph.node_mut(&id).expect("node");
        let op = entry
            .op
            .as_any_mut()
            .downcast_mut::<nodes::PixelProcessorNode>()
            .expect("pixel op");
        op.set_function(f);
        assert_eq!(
            op.function.as_ref().map(|f| f.execution),
            Some(ExecutionMode::Compiled)
        );
    }

    graph.process_node(&id, &mut res);

    let entry = graph.node(&id).expect("node");
    let op = entry
        .op
        .as_any()
        .downcast_ref::<nodes::PixelProcessorNode>()
        .expect("pixel op");
    assert!(op.has_program(), "a valid program compiles and is cached");
    assert!(
        matches!(
            entry.shell.outputs[0].data,
            Some(OutputData::Texture(_))
        ),
        "a compiled processor publishes its buffer"
    );
    assert_eq!(res.pending_passes(), 1);
}

#[test]
fn invalid_program_is_logged_and_blocks_processing() {
    let mut graph = Graph::with_default_size("pp", Environment::new());
    let mut res = RenderResources::new();
    let entry = nodes::create_node("pixel_processor", 64, 64, Default::default()).expect("node");
    let id = graph.add(entry);

    // References a free variable with no uniform behind it: the generated
    // module cannot validate.
    let mut f = FunctionGraph::new("broken", ValueKind::Float4);
    let v = f.variable("p_missing");
    f.set_result(v);
    assert_eq!(f.free_variables(), vec!["p_missing".to_string()]);

    graph
        .node_mut(&id)
        .expect("node")
        .op
        .as_any_mut()
        .downcast_mut::<nodes::PixelProcessorNode>()
        .expect("pixel op")
        .set_function(f);

    graph.process_node(&id, &mut res);

    let entry = graph.node(&id).expect("node");
    let op = entry
        .op
        .as_any()
        .downcast_ref::<nodes::PixelProcessorNode>()
        .expect("pixel op");
    assert!(!op.has_program(), "no program may survive a failed validation");
    assert!(
        entry.shell.outputs[0].data.is_none(),
        "the node refuses to process until a valid program exists"
    );
    assert_eq!(res.pending_passes(), 0);
}
