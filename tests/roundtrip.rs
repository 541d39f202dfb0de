use material_forge::{
    Environment, FunctionGraph, Graph, GraphInstanceNode, NodeEntry, ParamBinding, ParameterValue,
    RenderResources, Value, ValueKind, nodes,
};

fn add(graph: &mut Graph, ty: &str) -> String {
    let entry = nodes::create_node(ty, 128, 128, Default::default())
        .unwrap_or_else(|| panic!("unknown node type '{ty}'"));
    graph.add(entry)
}

fn sample_function() -> FunctionGraph {
    let mut f = FunctionGraph::new("wave", ValueKind::Float4);
    f.add_arg("uv", ValueKind::Float2);
    let uv = f.variable("uv");
    let freq = f.constant(Value::Float(6.2831));
    let scaled = f.push(material_forge::FnOp::Multiply, &[uv, freq]);
    let s = f.push(material_forge::FnOp::Sin, &[scaled]);
    f.set_result(s);
    f
}

/// A graph touching every node type, with parameters, custom parameters, a
/// custom function, connections and a grown variadic node.
fn build_fixture() -> (Graph, RenderResources) {
    let mut res = RenderResources::new();
    let mut inner = Graph::new("leaf", 64, 64, Environment::new());
    let inp = add(&mut inner, "graph_input");
    let blur = add(&mut inner, "blur");
    let out = add(&mut inner, "graph_output");
    inner.connect(&inp, 0, &blur, 0, &mut res).expect("inner wiring");
    inner.connect(&blur, 0, &out, 0, &mut res).expect("inner wiring");
    inner.set_parameter_value(&blur, "intensity", ParamBinding::Literal(Value::Float(3.0)));
    inner
        .params
        .add_custom(ParameterValue::literal("Tint", Value::Float(1.0)));
    let inner_json = inner.get_json().expect("inner graph serializes");

    let mut graph = Graph::new("fixture", 128, 128, Environment::new());
    let color = add(&mut graph, "uniform_color");
    let bitmap = add(&mut graph, "bitmap");
    let blur = add(&mut graph, "blur");
    let blend = add(&mut graph, "blend");
    let seq = add(&mut graph, "sequence");
    let pixel = add(&mut graph, "pixel_processor");
    let extra_blur = add(&mut graph, "blur");
    let graph_in = add(&mut graph, "graph_input");
    let graph_out = add(&mut graph, "graph_output");

    {
        let entry = graph.node_mut(&bitmap).expect("bitmap exists");
        let op = entry
            .op
            .as_any_mut()
            .downcast_mut::<nodes::BitmapNode>()
            .expect("bitmap op");
        op.set_path("textures/base.png");
    }
    {
        let entry = graph.node_mut(&blur).expect("blur exists");
        entry.shell.is_async = true;
        entry.shell.tile_x = 2.0;
        let op = entry
            .op
            .as_any_mut()
            .downcast_mut::<nodes::BlurNode>()
            .expect("blur op");
        op.intensity = 24.0;
    }
    {
        let entry = graph.node_mut(&blend).expect("blend exists");
        let op = entry
            .op
            .as_any_mut()
            .downcast_mut::<nodes::BlendNode>()
            .expect("blend op");
        op.alpha = 0.5;
        op.mode = 3;
    }
    {
        let entry = graph.node_mut(&pixel).expect("pixel processor exists");
        let op = entry
            .op
            .as_any_mut()
            .downcast_mut::<nodes::PixelProcessorNode>()
            .expect("pixel op");
        op.set_function(sample_function());
    }

    let instance = {
        let mut entry = nodes::create_node("graph_instance", 128, 128, Default::default())
            .expect("instance node");
        entry
            .op
            .as_any_mut()
            .downcast_mut::<GraphInstanceNode>()
            .expect("instance op")
            .set_source_data(inner_json);
        graph.add(entry)
    };
    graph
        .reload_instance(&instance, None, None, &mut res)
        .expect("instance loads from embedded data");

    graph
        .connect(&graph_in, 0, &graph_out, 0, &mut res)
        .expect("wiring");
    graph.connect(&color, 0, &blur, 0, &mut res).expect("wiring");
    graph.connect(&blur, 0, &blend, 0, &mut res).expect("wiring");
    graph.connect(&color, 0, &blend, 1, &mut res).expect("wiring");
    graph.connect(&color, 0, &seq, 0, &mut res).expect("wiring");
    // Grow the sequence: occupy both floor slots so a placeholder appears.
    graph.connect(&seq, 0, &extra_blur, 0, &mut res).expect("wiring");
    graph
        .connect(&seq, 1, &instance, 0, &mut res)
        .expect("wiring into instance port");

    graph.set_parameter_value(&blur, "intensity", ParamBinding::Literal(Value::Float(7.0)));
    graph.set_parameter_value(
        &blend,
        "alpha",
        ParamBinding::Function(sample_function()),
    );
    graph
        .params
        .add_custom(ParameterValue::literal("Roughness", Value::Float(0.4)));
    graph.params.add_function(sample_function());
    graph.assign_seed(42);

    (graph, res)
}

#[test]
fn graph_json_round_trip_is_stable() {
    let (graph, _res) = build_fixture();

    let first = graph.get_json().expect("serialize");
    let reloaded = Graph::from_json(&first, Environment::new()).expect("deserialize");
    let second = reloaded.get_json().expect("re-serialize");

    assert_eq!(
        first, second,
        "serialize(deserialize(serialize(g))) must equal serialize(g)"
    );
}

#[test]
fn reloaded_graph_preserves_wiring_and_parameters() {
    let (graph, _res) = build_fixture();
    let json = graph.get_json().expect("serialize");
    let reloaded = Graph::from_json(&json, Environment::new()).expect("deserialize");

    assert_eq!(reloaded.node_count(), graph.node_count());
    for id in graph.node_ids() {
        let original = graph.node(id).expect("original node");
        let restored = reloaded.node(id).expect("restored node");
        assert_eq!(
            original.shell.connections(),
            restored.shell.connections(),
            "connections of '{id}' must survive the round trip"
        );
        assert_eq!(original.shell.inputs.len(), restored.shell.inputs.len());
        assert_eq!(original.shell.outputs.len(), restored.shell.outputs.len());
        assert_eq!(original.shell.is_async, restored.shell.is_async);
    }
    assert_eq!(
        graph.params.parameters.len(),
        reloaded.params.parameters.len()
    );
    assert_eq!(graph.params.custom.len(), reloaded.params.custom.len());
    assert_eq!(graph.random_seed, reloaded.random_seed);
}

#[test]
fn node_binary_round_trip_is_stable_for_every_type() {
    let (graph, _res) = build_fixture();

    for id in graph.node_ids() {
        let entry = graph.node(id).expect("node");
        let ty = entry.op.type_name();

        let mut first = Vec::new();
        entry
            .op
            .get_binary(&entry.shell, &mut first)
            .unwrap_or_else(|e| panic!("{ty}: binary serialize failed: {e}"));

        let mut fresh: NodeEntry = nodes::create_node(ty, 16, 16, Default::default())
            .unwrap_or_else(|| panic!("factory lost type '{ty}'"));
        fresh.op.init(&mut fresh.shell);
        fresh
            .op
            .from_binary(&mut fresh.shell, &mut first.as_slice())
            .unwrap_or_else(|e| panic!("{ty}: binary deserialize failed: {e}"));

        let mut second = Vec::new();
        fresh
            .op
            .get_binary(&fresh.shell, &mut second)
            .unwrap_or_else(|e| panic!("{ty}: binary re-serialize failed: {e}"));

        assert_eq!(first, second, "{ty}: binary form must round-trip exactly");
    }
}

#[test]
fn node_json_round_trip_is_stable_for_every_type() {
    let (graph, _res) = build_fixture();

    for id in graph.node_ids() {
        let entry = graph.node(id).expect("node");
        let ty = entry.op.type_name();

        let first = entry
            .op
            .get_json(&entry.shell)
            .unwrap_or_else(|e| panic!("{ty}: json serialize failed: {e}"));

        let mut fresh: NodeEntry = nodes::create_node(ty, 16, 16, Default::default())
            .unwrap_or_else(|| panic!("factory lost type '{ty}'"));
        fresh.op.init(&mut fresh.shell);
        fresh
            .op
            .from_json(&mut fresh.shell, &first)
            .unwrap_or_else(|e| panic!("{ty}: json deserialize failed: {e}"));

        let second = fresh
            .op
            .get_json(&fresh.shell)
            .unwrap_or_else(|e| panic!("{ty}: json re-serialize failed: {e}"));

        assert_eq!(first, second, "{ty}: json record must round-trip exactly");
    }
}

#[test]
fn container_archive_round_trips_the_graph() {
    use material_forge::MatArchive;

    let (graph, _res) = build_fixture();
    let json = graph.get_json().expect("serialize");

    let dir = std::env::temp_dir().join(format!("forge-container-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join("fixture.mpack");

    let mut archive = MatArchive::new();
    archive.write_graph(json.clone());
    archive.save(&path).expect("archive saves");

    let reopened = MatArchive::open(&path).expect("archive reopens");
    let stored = reopened.read_graph().expect("graph entry present");
    assert_eq!(stored, json, "the container preserves the graph byte for byte");

    let reloaded = Graph::from_json_with_archive(&stored, Some(&reopened), Environment::new())
        .expect("graph loads against the container");
    assert_eq!(reloaded.node_count(), graph.node_count());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn copy_resources_relocates_file_backed_assets() {
    let dir = std::env::temp_dir().join(format!("forge-resources-{}", std::process::id()));
    let source_dir = dir.join("sources");
    let cwd = dir.join("project");
    std::fs::create_dir_all(&source_dir).expect("temp dirs");
    let source = source_dir.join("base.png");
    std::fs::write(&source, b"not really a png").expect("source file");

    let mut graph = Graph::new("resources", 64, 64, Environment::new());
    let bitmap = add(&mut graph, "bitmap");
    graph
        .node_mut(&bitmap)
        .expect("bitmap")
        .op
        .as_any_mut()
        .downcast_mut::<nodes::BitmapNode>()
        .expect("bitmap op")
        .set_path(source.to_string_lossy().to_string());

    graph.copy_resources(&cwd).expect("copy succeeds");

    assert!(
        cwd.join("resources").join("base.png").is_file(),
        "the referenced asset moves under the new working directory"
    );
    assert_eq!(graph.cwd, cwd);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn binary_reader_rejects_future_versions() {
    let (graph, _res) = build_fixture();
    let id = graph.node_ids().next().expect("at least one node").to_string();
    let entry = graph.node(&id).expect("node");

    let mut bytes = Vec::new();
    entry.op.get_binary(&entry.shell, &mut bytes).expect("serialize");
    // Corrupt the version tag to something newer than any known record.
    bytes[0] = 0xff;
    bytes[1] = 0xff;

    let mut fresh = nodes::create_node(entry.op.type_name(), 16, 16, Default::default())
        .expect("factory");
    fresh.op.init(&mut fresh.shell);
    assert!(
        fresh
            .op
            .from_binary(&mut fresh.shell, &mut bytes.as_slice())
            .is_err(),
        "future record versions must be rejected, not guessed at"
    );
}
