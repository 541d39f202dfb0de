use material_forge::{Environment, Graph, PortRef, RenderResources, nodes};
use proptest::prelude::*;

fn test_graph() -> (Graph, RenderResources) {
    (
        Graph::with_default_size("ports", Environment::new()),
        RenderResources::new(),
    )
}

fn add(graph: &mut Graph, ty: &str) -> String {
    let entry = nodes::create_node(ty, 64, 64, Default::default())
        .unwrap_or_else(|| panic!("unknown node type '{ty}'"));
    graph.add(entry)
}

/// Every edge must be recorded consistently on both sides, with no dangling
/// reference anywhere.
fn assert_symmetry(graph: &Graph) {
    let ids: Vec<String> = graph.node_ids().map(str::to_string).collect();
    for id in &ids {
        let entry = graph.node(id).expect("listed node exists");
        for (in_index, input) in entry.shell.inputs.iter().enumerate() {
            if let Some(reference) = &input.reference {
                let producer = graph
                    .node(&reference.node)
                    .unwrap_or_else(|| panic!("input of '{id}' references missing node"));
                let output = producer
                    .shell
                    .outputs
                    .get(reference.index)
                    .unwrap_or_else(|| panic!("input of '{id}' references missing output"));
                let backrefs = output
                    .to
                    .iter()
                    .filter(|r| r.node == *id && r.index == in_index)
                    .count();
                assert_eq!(
                    backrefs, 1,
                    "producer fan-out must list consumer '{id}'[{in_index}] exactly once"
                );
            }
        }
        for (out_index, output) in entry.shell.outputs.iter().enumerate() {
            for consumer_ref in &output.to {
                let consumer = graph
                    .node(&consumer_ref.node)
                    .unwrap_or_else(|| panic!("output of '{id}' fans out to missing node"));
                let input = consumer
                    .shell
                    .inputs
                    .get(consumer_ref.index)
                    .unwrap_or_else(|| panic!("output of '{id}' fans out to missing input"));
                assert_eq!(
                    input.reference.as_ref(),
                    Some(&PortRef::new(id.clone(), out_index)),
                    "consumer input must point back at '{id}'[{out_index}]"
                );
            }
        }
    }
}

#[test]
fn connect_records_both_sides() {
    let (mut graph, mut res) = test_graph();
    let color = add(&mut graph, "uniform_color");
    let blur = add(&mut graph, "blur");

    graph
        .connect(&color, 0, &blur, 0, &mut res)
        .expect("color -> blur should connect");

    let input = &graph.node(&blur).unwrap().shell.inputs[0];
    assert_eq!(input.reference, Some(PortRef::new(color.clone(), 0)));
    let output = &graph.node(&color).unwrap().shell.outputs[0];
    assert!(output.to.contains(&PortRef::new(blur.clone(), 0)));
    assert_symmetry(&graph);
}

#[test]
fn reconnect_unlinks_old_producer_first() {
    let (mut graph, mut res) = test_graph();
    let first = add(&mut graph, "uniform_color");
    let second = add(&mut graph, "uniform_color");
    let blur = add(&mut graph, "blur");

    graph.connect(&first, 0, &blur, 0, &mut res).expect("first connect");
    graph
        .connect(&second, 0, &blur, 0, &mut res)
        .expect("reconnect to second producer");

    assert!(
        graph.node(&first).unwrap().shell.outputs[0].to.is_empty(),
        "old producer must forget the moved consumer"
    );
    assert_eq!(
        graph.node(&blur).unwrap().shell.inputs[0].reference,
        Some(PortRef::new(second.clone(), 0))
    );
    assert_symmetry(&graph);
}

#[test]
fn disconnect_clears_both_sides() {
    let (mut graph, mut res) = test_graph();
    let color = add(&mut graph, "uniform_color");
    let blur = add(&mut graph, "blur");
    graph.connect(&color, 0, &blur, 0, &mut res).expect("connect");

    graph.disconnect(&blur, 0);

    assert!(graph.node(&blur).unwrap().shell.inputs[0].reference.is_none());
    assert!(graph.node(&color).unwrap().shell.outputs[0].to.is_empty());
    assert_symmetry(&graph);
}

#[test]
fn fan_out_shares_one_producer() {
    let (mut graph, mut res) = test_graph();
    let color = add(&mut graph, "uniform_color");
    let blurs: Vec<String> = (0..3).map(|_| add(&mut graph, "blur")).collect();

    for blur in &blurs {
        graph.connect(&color, 0, blur, 0, &mut res).expect("fan out");
    }

    assert_eq!(graph.node(&color).unwrap().shell.outputs[0].to.len(), 3);
    assert_symmetry(&graph);
}

#[test]
fn remove_unlinks_every_port_bidirectionally() {
    let (mut graph, mut res) = test_graph();
    let color = add(&mut graph, "uniform_color");
    let blur = add(&mut graph, "blur");
    let blend = add(&mut graph, "blend");
    graph.connect(&color, 0, &blur, 0, &mut res).expect("connect");
    graph.connect(&blur, 0, &blend, 0, &mut res).expect("connect");
    graph.connect(&color, 0, &blend, 1, &mut res).expect("connect");

    graph.remove(&blur, &mut res);

    assert!(graph.node(&blur).is_none());
    assert!(
        graph.node(&blend).unwrap().shell.inputs[0].reference.is_none(),
        "consumer of the removed node must be unlinked"
    );
    assert!(
        graph.node(&color).unwrap().shell.outputs[0]
            .to
            .iter()
            .all(|r| r.node != blur),
        "producer feeding the removed node must forget it"
    );
    assert_symmetry(&graph);
}

#[test]
fn self_connection_is_rejected() {
    let (mut graph, mut res) = test_graph();
    let blend = add(&mut graph, "blend");
    assert!(graph.connect(&blend, 0, &blend, 0, &mut res).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Symmetry survives arbitrary connect/disconnect interleavings.
    #[test]
    fn symmetry_holds_under_random_wiring(
        ops in proptest::collection::vec(
            (0usize..4, 0usize..4, 0usize..2, any::<bool>()),
            1..40,
        )
    ) {
        let (mut graph, mut res) = test_graph();
        let producers: Vec<String> = (0..4).map(|_| add(&mut graph, "uniform_color")).collect();
        let consumers: Vec<String> = (0..4).map(|_| add(&mut graph, "blend")).collect();

        for (p, c, input, disconnect) in ops {
            if disconnect {
                graph.disconnect(&consumers[c], input);
            } else {
                graph
                    .connect(&producers[p], 0, &consumers[c], input, &mut res)
                    .expect("compatible connection");
            }
            assert_symmetry(&graph);
        }
    }
}
