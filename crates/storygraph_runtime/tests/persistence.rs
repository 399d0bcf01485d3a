// Persistence behavior: document round-trips, extends inheritance with
// delta saves, and the flattened editor format.

use storygraph_runtime::layout::{
    export_flat_graph, import_flat_graph, load_graph, load_graph_from_file, normalize_node_filename,
    save_graph,
};
use storygraph_runtime::registry::hydrate_graph;
use storygraph_runtime::{Graph, GraphKind, GraphNode, NodeSeed, Registry, Value};
use storygraph_types::NodeDoc;

fn leaf_node(registry: &Registry, path: &str) -> storygraph_runtime::Node {
    match registry.create(path, NodeSeed::default()).unwrap() {
        GraphNode::Leaf(node) => node,
        GraphNode::Graph(_) => panic!("expected leaf node for {}", path),
    }
}

fn multiplier_graph(registry: &Registry) -> Graph {
    let mut graph = Graph::new(GraphKind::Graph);
    graph.registry = "tests/multiplier".to_string();
    graph.title = "Multiplier".to_string();

    let mut input = leaf_node(registry, "core/Input");
    input.set_stored_property("input_name", "n");
    input.set_stored_property("input_type", "int");
    let input = graph.add_leaf(input);

    let mut arith = leaf_node(registry, "data/number/BasicArithmetic");
    arith.set_stored_property("operation", "multiply");
    arith.set_stored_property("b", 2i64);
    let arith = graph.add_leaf(arith);

    let mut output = leaf_node(registry, "core/Output");
    output.set_stored_property("output_name", "result");
    let output = graph.add_leaf(output);

    graph.connect_ids(&input, "value", &arith, "a").unwrap();
    graph.connect_ids(&arith, "result", &output, "value").unwrap();
    graph.reinitialize().unwrap();
    graph
}

#[test]
fn save_load_round_trip_preserves_structure() {
    let registry = Registry::with_builtins();
    let graph = multiplier_graph(&registry);

    let doc = graph.to_doc(false);
    let rendered = serde_json::to_string_pretty(&doc).unwrap();
    let parsed: NodeDoc = serde_json::from_str(&rendered).unwrap();

    let mut reloaded = hydrate_graph(&registry, &parsed).unwrap();
    reloaded.reinitialize().unwrap();

    assert_eq!(reloaded.id, graph.id);
    assert_eq!(reloaded.title, graph.title);
    assert_eq!(
        reloaded.nodes.keys().collect::<Vec<_>>(),
        graph.nodes.keys().collect::<Vec<_>>()
    );
    assert_eq!(reloaded.edges, graph.edges);
    assert_eq!(reloaded.to_doc(false), doc);

    // node properties survive the trip
    let arith = graph
        .nodes
        .values()
        .find(|n| n.registry() == "data/number/BasicArithmetic")
        .unwrap();
    let arith_reloaded = reloaded.node(arith.id()).unwrap();
    assert_eq!(
        arith_reloaded.stored_property("operation"),
        Value::from("multiply")
    );
    assert_eq!(arith_reloaded.stored_property("b"), Value::Int(2));
}

#[tokio::test]
async fn extends_marks_inherited_and_saves_only_the_delta() {
    let registry = Registry::with_builtins();
    let dir = tempfile::tempdir().unwrap();

    let base = serde_json::json!({
        "registry": "tests/baseModule",
        "base_type": "core/Graph",
        "title": "Base",
        "nodes": {
            "a": {"id": "a", "registry": "core/Route"},
            "b": {"id": "b", "registry": "core/Route"}
        },
        "edges": {"a.value": ["b.value"]}
    });
    std::fs::write(
        dir.path().join("base.json"),
        serde_json::to_string_pretty(&base).unwrap(),
    )
    .unwrap();

    let child = serde_json::json!({
        "registry": "tests/childModule",
        "base_type": "core/Graph",
        "title": "Child",
        "extends": "base.json",
        "nodes": {
            "c": {"id": "c", "registry": "core/Route"}
        },
        "edges": {"a.value": ["c.value"]}
    });
    let child_path = dir.path().join("child.json");
    std::fs::write(&child_path, serde_json::to_string_pretty(&child).unwrap()).unwrap();

    let search_paths = vec![dir.path().to_path_buf()];
    let (graph, _info) = load_graph_from_file(&child_path, &registry, &search_paths).unwrap();

    // all base nodes are present and marked inherited, the child's are not
    assert!(graph.node("a").unwrap().inherited());
    assert!(graph.node("b").unwrap().inherited());
    assert!(!graph.node("c").unwrap().inherited());
    assert_eq!(graph.edges["a.value"], vec!["c.value", "b.value"]);

    // saving writes only the authored delta
    let out_path = dir.path().join("saved.json");
    save_graph(&graph, &out_path).await.unwrap();
    let saved: NodeDoc =
        serde_json::from_str(&std::fs::read_to_string(&out_path).unwrap()).unwrap();

    assert_eq!(saved.nodes.len(), 1);
    assert!(saved.nodes.contains_key("c"));
    assert_eq!(saved.edges.len(), 1);
    assert_eq!(saved.edges["a.value"], vec!["c.value"]);

    // the saved delta loads back to the same merged graph
    save_graph(&graph, &child_path).await.unwrap();
    let (graph2, _) = load_graph_from_file(&child_path, &registry, &search_paths).unwrap();
    assert!(graph2.node("a").unwrap().inherited());
    assert!(graph2.node("b").unwrap().inherited());
    assert_eq!(graph2.edges["a.value"], vec!["c.value", "b.value"]);
}

#[test]
fn load_graph_searches_paths_by_file_name() {
    let registry = Registry::with_builtins();
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("modules");
    std::fs::create_dir_all(&nested).unwrap();

    let doc = serde_json::json!({
        "registry": "tests/nestedModule",
        "base_type": "core/Graph",
        "title": "Nested",
        "nodes": {"r": {"id": "r", "registry": "core/Route"}}
    });
    std::fs::write(
        nested.join("nested-module.json"),
        serde_json::to_string(&doc).unwrap(),
    )
    .unwrap();

    let search_paths = vec![dir.path().to_path_buf()];
    let (graph, info) = load_graph("nested-module.json", &search_paths, &registry).unwrap();
    assert_eq!(graph.title, "Nested");
    assert!(info.relative_path.contains("nested-module.json"));
}

#[test]
fn flat_export_import_round_trip() {
    let registry = Registry::with_builtins();
    let graph = multiplier_graph(&registry);

    let flat = export_flat_graph(&graph);
    assert_eq!(flat.nodes.len(), 3);
    assert_eq!(flat.connections.len(), 2);
    assert!(flat.nodes.iter().all(|n| n.parent.as_deref() == Some(graph.id.as_str())));

    let rebuilt = import_flat_graph(&flat, &registry, &[]).unwrap();
    assert_eq!(
        rebuilt.nodes.keys().collect::<Vec<_>>(),
        graph.nodes.keys().collect::<Vec<_>>()
    );
    assert_eq!(rebuilt.edges, graph.edges);

    // sockets were rewired from the connection list
    let arith = rebuilt
        .nodes
        .values()
        .find(|n| n.registry() == "data/number/BasicArithmetic")
        .unwrap();
    assert!(arith.input_socket("a").unwrap().source.is_some());
}

#[test]
fn ephemeral_properties_save_as_defaults() {
    let registry = Registry::with_builtins();
    let mut graph = Graph::new(GraphKind::Graph);

    let mut node = leaf_node(&registry, "core/Route");
    node.declare_field(
        storygraph_runtime::PropertyField::new("attempts", "int")
            .default_value(0i64)
            .ephemeral(),
    );
    node.set_stored_property("attempts", 5i64);
    let node_id = graph.add_leaf(node);
    graph.reinitialize().unwrap();

    let doc = graph.to_doc(false);
    assert_eq!(
        doc.nodes[&node_id].properties["attempts"],
        serde_json::json!(0)
    );
}

#[test]
fn filename_normalization() {
    assert_eq!(normalize_node_filename("My Module"), "my-module.json");
}

#[test]
fn node_definition_export_lists_registered_types() {
    let registry = Registry::with_builtins();
    let export = registry.export_node_definitions();
    let nodes = export["nodes"].as_object().unwrap();
    assert!(nodes.contains_key("core/Route"));
    assert!(nodes.contains_key("data/number/BasicArithmetic"));
    let arith = &nodes["data/number/BasicArithmetic"];
    assert_eq!(arith["fields"]["operation"]["default"], "add");
    assert!(arith.get("nodes").is_none());
}

#[test]
fn dynamic_definition_instantiates_as_graph_node() {
    let registry = Registry::with_builtins();
    let doc: NodeDoc = serde_json::from_value(serde_json::json!({
        "registry": "tests/dynamicModule",
        "base_type": "core/Graph",
        "title": "Dynamic",
        "nodes": {
            "in": {"id": "in", "registry": "core/Input",
                   "properties": {"input_name": "x"}},
            "out": {"id": "out", "registry": "core/Output",
                    "properties": {"output_name": "y"}}
        },
        "edges": {"in.value": ["out.value"]}
    }))
    .unwrap();

    registry.import_node_definition(&doc, false, false).unwrap();
    let node = registry
        .create("tests/dynamicModule", NodeSeed::default())
        .unwrap();
    let GraphNode::Graph(inner) = &node else {
        panic!("expected graph node");
    };
    assert_eq!(inner.title, "Dynamic");
    assert_eq!(node.inputs().len(), 1);
    assert_eq!(node.inputs()[0].name, "x");
    assert_eq!(node.outputs()[0].name, "y");
}
