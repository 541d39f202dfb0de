use material_forge::{
    Environment, Graph, OutputData, PixelFormat, RenderResources, nodes,
};

fn add(graph: &mut Graph, ty: &str) -> String {
    let entry = nodes::create_node(ty, 256, 256, PixelFormat::Rgba8)
        .unwrap_or_else(|| panic!("unknown node type '{ty}'"));
    graph.add(entry)
}

fn output_texture(graph: &Graph, id: &str) -> Option<(u32, u32)> {
    match graph.output_data(id, 0) {
        Some(OutputData::Texture(binding)) => Some((binding.width, binding.height)),
        _ => None,
    }
}

#[test]
fn blur_fed_by_unresolved_bitmap_produces_nothing_then_follows_its_size() {
    let mut graph = Graph::new("sizes", 256, 256, Environment::new());
    let mut res = RenderResources::new();
    let bitmap = add(&mut graph, "bitmap");
    let blur = add(&mut graph, "blur");
    graph.connect(&bitmap, 0, &blur, 0, &mut res).expect("wiring");

    // Unresolved bitmap: evaluation runs, nothing is published anywhere.
    graph.try_and_process(&mut res);
    assert!(output_texture(&graph, &bitmap).is_none());
    assert!(
        output_texture(&graph, &blur).is_none(),
        "a node with a missing required input leaves its output untouched"
    );

    // The bitmap resolves to a 64x64 image; dimensions propagate from the
    // upstream producer, not from the 256x256 static configuration.
    graph
        .node_mut(&bitmap)
        .expect("bitmap")
        .op
        .as_any_mut()
        .downcast_mut::<nodes::BitmapNode>()
        .expect("bitmap op")
        .set_image(image::RgbaImage::from_pixel(64, 64, image::Rgba([8, 8, 8, 255])));
    graph.process_node(&bitmap, &mut res);

    assert_eq!(output_texture(&graph, &bitmap), Some((64, 64)));
    assert_eq!(
        output_texture(&graph, &blur),
        Some((64, 64)),
        "the blur's buffer must be sized by its upstream producer"
    );
    assert_eq!(graph.node(&blur).expect("blur").shell.width, 64);
}

#[test]
fn missing_input_leaves_previous_output_untouched() {
    let mut graph = Graph::new("steady", 128, 128, Environment::new());
    let mut res = RenderResources::new();
    let color = add(&mut graph, "uniform_color");
    let blur = add(&mut graph, "blur");
    graph.connect(&color, 0, &blur, 0, &mut res).expect("wiring");
    graph.try_and_process(&mut res);

    let published = output_texture(&graph, &blur).expect("blur published after evaluation");

    // Losing the input afterwards must not clear or rewrite the output.
    graph.disconnect(&blur, 0);
    graph.process_node(&blur, &mut res);
    assert_eq!(
        output_texture(&graph, &blur),
        Some(published),
        "processing with a missing input is a silent no-op"
    );
}

#[test]
fn resize_with_scales_proportionally_but_not_intrinsic_nodes() {
    let mut graph = Graph::new("resize", 256, 256, Environment::new());
    let mut res = RenderResources::new();
    let color = add(&mut graph, "uniform_color");
    let bitmap = add(&mut graph, "bitmap");
    graph
        .node_mut(&bitmap)
        .expect("bitmap")
        .op
        .as_any_mut()
        .downcast_mut::<nodes::BitmapNode>()
        .expect("bitmap op")
        .set_image(image::RgbaImage::from_pixel(100, 50, image::Rgba([0, 0, 0, 255])));
    graph.try_and_process(&mut res);

    graph.resize_with(512, 512, &mut res);

    assert_eq!(graph.node(&color).expect("color").shell.width, 512);
    assert_eq!(graph.node(&color).expect("color").shell.height, 512);
    graph.process_node(&bitmap, &mut res);
    assert_eq!(
        output_texture(&graph, &bitmap),
        Some((100, 50)),
        "bitmaps keep their intrinsic dimensions through graph resizes"
    );
    assert_eq!((graph.width, graph.height), (512, 512));
}

#[test]
fn absolute_size_nodes_ignore_graph_resizes() {
    let mut graph = Graph::new("absolute", 256, 256, Environment::new());
    let mut res = RenderResources::new();
    let color = add(&mut graph, "uniform_color");
    graph.node_mut(&color).expect("color").shell.absolute_size = true;

    graph.resize_with(512, 512, &mut res);

    assert_eq!(graph.node(&color).expect("color").shell.width, 256);
}

#[test]
fn assign_pixel_type_releases_and_reprocesses() {
    let mut graph = Graph::new("formats", 128, 128, Environment::new());
    let mut res = RenderResources::new();
    let color = add(&mut graph, "uniform_color");
    graph.try_and_process(&mut res);
    res.take_passes();

    graph.assign_pixel_type(PixelFormat::Rgba16F, &mut res);

    let entry = graph.node(&color).expect("color");
    assert_eq!(entry.shell.pixel_format, PixelFormat::Rgba16F);
    match graph.output_data(&color, 0) {
        Some(OutputData::Texture(binding)) => assert_eq!(binding.format, PixelFormat::Rgba16F),
        other => panic!("expected a republished texture, got {other:?}"),
    }
    assert!(
        res.pending_passes() > 0,
        "the format cascade re-processes the graph"
    );
}

#[test]
fn dispose_releases_every_owned_buffer() {
    let mut graph = Graph::new("dispose", 128, 128, Environment::new());
    let mut res = RenderResources::new();
    for _ in 0..3 {
        add(&mut graph, "uniform_color");
    }
    graph.try_and_process(&mut res);
    assert_eq!(res.textures.live_count(), 3);

    graph.dispose(&mut res);
    assert_eq!(res.textures.live_count(), 0, "dispose must free every buffer");
    assert_eq!(graph.node_count(), 0);

    // Idempotent: a second dispose is a quiet no-op.
    graph.dispose(&mut res);
    assert_eq!(res.textures.live_count(), 0);
}

#[test]
fn feedback_snapshot_never_aliases_the_primary_buffer() {
    use material_forge::gpu::PassKind;
    use material_forge::{NodeEntry, NodeShell, ProcessContext, TextureDesc};
    use std::collections::HashMap;

    let mut res = RenderResources::new();
    let mut shell = NodeShell::new(32, 32, PixelFormat::Rgba8);
    shell.name = "feedback".to_string();
    shell.buffer = Some(res.textures.acquire(TextureDesc {
        width: 32,
        height: 32,
        format: PixelFormat::Rgba8,
        label: "feedback.primary".to_string(),
    }));

    let nodes: HashMap<String, NodeEntry> = HashMap::new();
    let params = material_forge::ParameterStore::new();
    let vars = material_forge::VarScope::new();
    let env = Environment::new();
    let mut ctx = ProcessContext {
        nodes: &nodes,
        params: &params,
        vars: &vars,
        res: &mut res,
        env: &env,
        graph_width: 32,
        graph_height: 32,
        default_format: PixelFormat::Rgba8,
        random_seed: 0,
        gathered: None,
    };

    let aux = ctx.snapshot_aux(&mut shell).expect("snapshot allocates");
    assert_ne!(Some(aux), shell.buffer, "the snapshot is a separate buffer");
    assert_eq!(shell.aux_buffer, Some(aux));
    assert!(res.textures.is_live(aux));
    let passes = res.take_passes();
    assert!(
        matches!(passes.last().map(|p| &p.kind), Some(PassKind::Copy { .. })),
        "the snapshot is a copy pass, not a re-render"
    );

    shell.release_buffers(&mut res);
    assert_eq!(res.textures.live_count(), 0, "both buffers release together");
}

#[test]
fn stale_handles_are_inert() {
    let mut res = RenderResources::new();
    let handle = res.textures.acquire(material_forge::TextureDesc {
        width: 8,
        height: 8,
        format: PixelFormat::Rgba8,
        label: "probe".to_string(),
    });
    assert!(res.textures.release(handle), "first release frees the slot");
    assert!(
        !res.textures.release(handle),
        "a stale handle release is a structural no-op, not an error"
    );
    assert!(!res.textures.is_live(handle));
}
