use material_forge::{Environment, Graph, RenderResources, nodes};

fn add(graph: &mut Graph, ty: &str) -> String {
    let entry = nodes::create_node(ty, 64, 64, Default::default())
        .unwrap_or_else(|| panic!("unknown node type '{ty}'"));
    graph.add(entry)
}

fn output_count(graph: &Graph, id: &str) -> usize {
    graph.node(id).expect("node exists").shell.outputs.len()
}

#[test]
fn sequence_starts_at_the_floor() {
    let mut graph = Graph::with_default_size("variadic", Environment::new());
    let seq = add(&mut graph, "sequence");
    assert_eq!(output_count(&graph, &seq), 2);
}

#[test]
fn connecting_the_last_slot_adds_exactly_one_placeholder() {
    let mut graph = Graph::with_default_size("variadic", Environment::new());
    let mut res = RenderResources::new();
    let seq = add(&mut graph, "sequence");
    let a = add(&mut graph, "blur");
    let b = add(&mut graph, "blur");

    // Occupying a non-final slot leaves the shape alone.
    graph.connect(&seq, 0, &a, 0, &mut res).expect("wiring");
    assert_eq!(output_count(&graph, &seq), 2);

    // Occupying the final slot grows the list by one placeholder.
    graph.connect(&seq, 1, &b, 0, &mut res).expect("wiring");
    assert_eq!(output_count(&graph, &seq), 3);
    assert!(
        graph.node(&seq).unwrap().shell.outputs[2].to.is_empty(),
        "the new slot is an empty placeholder"
    );
}

#[test]
fn trailing_empty_slots_shrink_back_to_the_floor() {
    let mut graph = Graph::with_default_size("variadic", Environment::new());
    let mut res = RenderResources::new();
    let seq = add(&mut graph, "sequence");
    let consumers: Vec<String> = (0..3).map(|_| add(&mut graph, "blur")).collect();

    for (i, c) in consumers.iter().enumerate() {
        graph.connect(&seq, i, c, 0, &mut res).expect("wiring");
    }
    assert_eq!(output_count(&graph, &seq), 4, "three connected + one placeholder");

    // Emptying the last connected slot leaves two trailing empties; one goes.
    graph.disconnect(&consumers[2], 0);
    assert_eq!(output_count(&graph, &seq), 3);

    graph.disconnect(&consumers[1], 0);
    assert_eq!(output_count(&graph, &seq), 2, "shrink stops at the floor");

    graph.disconnect(&consumers[0], 0);
    assert_eq!(output_count(&graph, &seq), 2, "the floor is never crossed");
}

#[test]
fn shrink_never_removes_a_connected_slot() {
    let mut graph = Graph::with_default_size("variadic", Environment::new());
    let mut res = RenderResources::new();
    let seq = add(&mut graph, "sequence");
    let a = add(&mut graph, "blur");
    let b = add(&mut graph, "blur");
    let c = add(&mut graph, "blur");

    graph.connect(&seq, 0, &a, 0, &mut res).expect("wiring");
    graph.connect(&seq, 1, &b, 0, &mut res).expect("wiring");
    graph.connect(&seq, 2, &c, 0, &mut res).expect("wiring");
    assert_eq!(output_count(&graph, &seq), 4);

    // Emptying a slot in the middle leaves the connected tail alone.
    graph.disconnect(&b, 0);
    assert_eq!(output_count(&graph, &seq), 4);
    assert!(
        !graph.node(&seq).unwrap().shell.outputs[2].to.is_empty(),
        "slot 2 keeps its consumer"
    );

    // Persisted shape includes grown slots.
    let json = graph.get_json().expect("serialize");
    let reloaded = Graph::from_json(&json, Environment::new()).expect("deserialize");
    assert_eq!(output_count(&reloaded, &seq), 4);
}
