use material_forge::gpu::PassKind;
use material_forge::{
    Environment, FunctionGraph, Graph, ParamBinding, RenderResources, Value, ValueKind, nodes,
};

fn test_graph() -> (Graph, RenderResources) {
    (
        Graph::with_default_size("params", Environment::new()),
        RenderResources::new(),
    )
}

fn add(graph: &mut Graph, ty: &str) -> String {
    let entry = nodes::create_node(ty, 64, 64, Default::default())
        .unwrap_or_else(|| panic!("unknown node type '{ty}'"));
    graph.add(entry)
}

/// The color a uniform-color node actually resolved, read back from the pass
/// it queued.
fn resolved_fill(graph: &mut Graph, id: &str, res: &mut RenderResources) -> [f64; 4] {
    graph.process_node(id, res);
    let passes = res.take_passes();
    let fill = passes
        .iter()
        .rev()
        .find_map(|p| match &p.kind {
            PassKind::Fill { color } => Some(*color),
            _ => None,
        })
        .expect("uniform color should queue a fill pass");
    fill
}

fn constant_function(value: [f32; 4]) -> FunctionGraph {
    let mut f = FunctionGraph::new("constant_blue", ValueKind::Float4);
    let c = f.constant(Value::Float4(value));
    f.set_result(c);
    f
}

#[test]
fn function_beats_literal_beats_field() {
    let (mut graph, mut res) = test_graph();
    let id = add(&mut graph, "uniform_color");

    // 1) No override: the node's own field (white) resolves.
    assert_eq!(
        resolved_fill(&mut graph, &id, &mut res),
        [1.0, 1.0, 1.0, 1.0]
    );

    // 2) Literal override wins over the field.
    graph.set_parameter_value(
        &id,
        "color",
        ParamBinding::Literal(Value::Float4([1.0, 0.0, 0.0, 1.0])),
    );
    assert_eq!(
        resolved_fill(&mut graph, &id, &mut res),
        [1.0, 0.0, 0.0, 1.0]
    );

    // 3) A bound function wins over the literal it replaces.
    graph.set_parameter_value(
        &id,
        "color",
        ParamBinding::Function(constant_function([0.0, 0.0, 1.0, 1.0])),
    );
    assert!(graph.is_parameter_value_function(&id, "color"));
    assert_eq!(
        resolved_fill(&mut graph, &id, &mut res),
        [0.0, 0.0, 1.0, 1.0]
    );

    // 4) Downgrade function -> literal falls back to the literal.
    graph.set_parameter_value(
        &id,
        "color",
        ParamBinding::Literal(Value::Float4([1.0, 0.0, 0.0, 1.0])),
    );
    assert!(!graph.is_parameter_value_function(&id, "color"));
    assert_eq!(
        resolved_fill(&mut graph, &id, &mut res),
        [1.0, 0.0, 0.0, 1.0]
    );

    // 5) Removing the override reverts cleanly to the untouched field.
    graph.remove_parameter_value(&id, "color");
    assert!(!graph.has_parameter_value(&id, "color"));
    assert_eq!(
        resolved_fill(&mut graph, &id, &mut res),
        [1.0, 1.0, 1.0, 1.0]
    );
}

#[test]
fn overrides_convert_to_the_property_kind() {
    let (mut graph, mut res) = test_graph();
    let id = add(&mut graph, "uniform_color");

    // Scalar override of a vector property splats.
    graph.set_parameter_value(&id, "color", ParamBinding::Literal(Value::Float(0.25)));
    assert_eq!(
        resolved_fill(&mut graph, &id, &mut res),
        [0.25, 0.25, 0.25, 0.25]
    );

    // Bool override converts through the total conversion rules.
    graph.set_parameter_value(&id, "color", ParamBinding::Literal(Value::Bool(true)));
    assert_eq!(
        resolved_fill(&mut graph, &id, &mut res),
        [1.0, 1.0, 1.0, 1.0]
    );
}

#[test]
fn missing_override_is_never_an_error() {
    let (mut graph, _res) = test_graph();
    let id = add(&mut graph, "uniform_color");
    assert!(graph.get_parameter_value(&id, "no_such_property").is_none());
    assert!(!graph.has_parameter_value(&id, "no_such_property"));
}

#[test]
fn function_override_sees_graph_variables_and_builtins() {
    let (mut graph, mut res) = test_graph();
    let id = add(&mut graph, "uniform_color");

    // color = vec4(tint) where `tint` is a graph variable.
    graph.set_var("tint", Value::Float(0.5));
    let mut f = FunctionGraph::new("tint_lookup", ValueKind::Float4);
    let v = f.variable("tint");
    f.set_result(v);
    graph.set_parameter_value(&id, "color", ParamBinding::Function(f));

    assert_eq!(
        resolved_fill(&mut graph, &id, &mut res),
        [0.5, 0.5, 0.5, 0.5]
    );

    // `size` is always injected; the node is 64x64.
    let mut f = FunctionGraph::new("size_lookup", ValueKind::Float);
    let v = f.variable("size");
    f.set_result(v);
    graph.set_parameter_value(&id, "color", ParamBinding::Function(f));
    assert_eq!(
        resolved_fill(&mut graph, &id, &mut res),
        [64.0, 64.0, 64.0, 64.0]
    );
}
