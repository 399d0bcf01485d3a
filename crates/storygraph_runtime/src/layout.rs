// Graph persistence.
//
// Loads and saves graph documents, resolving `extends` chains (a child
// file layers its authored delta over a base file's nodes/edges/groups/
// comments) and converting to and from the flattened editor wire format.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use storygraph_types::{ConnectionDoc, FlatGraphDoc, FlatNodeDoc, NodeDoc};
use tracing::debug;

use crate::error::NodeError;
use crate::graph::{Graph, GraphNode};
use crate::registry::{self, NodeSeed, Registry};

/// Where a loaded graph file was found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathInfo {
    pub full_path: String,
    pub relative_path: String,
    pub search_paths: Vec<String>,
}

fn walk_json_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.filter_map(Result::ok).map(|e| e.path()).collect();
    entries.sort();
    for path in entries {
        if path.is_dir() {
            walk_json_files(&path, files);
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
}

/// Every node definition file reachable from the search paths. With
/// `dedupe`, only the first file of a given filename is kept.
pub fn list_node_files(search_paths: &[PathBuf], dedupe: bool) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for base in search_paths {
        walk_json_files(base, &mut files);
    }
    if dedupe {
        let mut seen = HashSet::new();
        files.retain(|path| {
            let Some(name) = path.file_name().map(|n| n.to_owned()) else {
                return false;
            };
            seen.insert(name)
        });
    }
    files
}

pub fn normalize_node_filename(node_name: &str) -> String {
    format!("{}.json", node_name.to_lowercase().replace(' ', "-"))
}

fn resolve_extends_path(
    extends: &str,
    current_dir: Option<&Path>,
    search_paths: &[PathBuf],
) -> Option<PathBuf> {
    let direct = PathBuf::from(extends);
    if direct.exists() {
        return Some(direct);
    }
    if let Some(dir) = current_dir {
        let relative = dir.join(extends);
        if relative.exists() {
            return Some(relative);
        }
    }
    let file_name = Path::new(extends).file_name()?;
    for base in search_paths {
        let candidate = base.join(extends);
        if candidate.exists() {
            return Some(candidate);
        }
        let mut files = Vec::new();
        walk_json_files(base, &mut files);
        if let Some(found) = files.into_iter().find(|p| p.file_name() == Some(file_name)) {
            return Some(found);
        }
    }
    None
}

/// Merge the full `extends` chain beneath a document, marking everything
/// that came from a base as inherited. Returns the edge pairs that were
/// contributed by bases, so saving can filter them back out.
pub fn merge_extends(
    doc: &mut NodeDoc,
    current_dir: Option<&Path>,
    search_paths: &[PathBuf],
) -> Result<HashSet<(String, String)>, NodeError> {
    let Some(extends) = doc.extends.clone() else {
        return Ok(HashSet::new());
    };

    let own_pairs: HashSet<(String, String)> = doc
        .edges
        .iter()
        .flat_map(|(output, inputs)| {
            inputs
                .iter()
                .map(move |input| (output.clone(), input.clone()))
        })
        .collect();

    let base_path = resolve_extends_path(&extends, current_dir, search_paths).ok_or_else(|| {
        NodeError::Graph(format!("Could not find extended graph file {}", extends))
    })?;
    debug!(path = %base_path.display(), "loading extended components");

    let raw = std::fs::read_to_string(&base_path)
        .map_err(|e| NodeError::Graph(format!("cannot read {}: {}", base_path.display(), e)))?;
    let mut base: NodeDoc = serde_json::from_str(&raw)
        .map_err(|e| NodeError::Graph(format!("invalid graph file {}: {}", base_path.display(), e)))?;

    // the base may itself extend another file
    merge_extends(&mut base, base_path.parent(), search_paths)?;
    doc.merge_inherited(&base);

    let inherited_pairs = doc
        .edges
        .iter()
        .flat_map(|(output, inputs)| {
            inputs
                .iter()
                .map(move |input| (output.clone(), input.clone()))
        })
        .filter(|pair| !own_pairs.contains(pair))
        .collect();
    Ok(inherited_pairs)
}

/// Load a graph by file name, searching each search path (including
/// subdirectories).
pub fn load_graph(
    file_name: &str,
    search_paths: &[PathBuf],
    registry: &Registry,
) -> Result<(Graph, PathInfo), NodeError> {
    let name_path = Path::new(file_name);
    let file_dir = name_path.parent().filter(|p| !p.as_os_str().is_empty());
    let base_name = name_path
        .file_name()
        .ok_or_else(|| NodeError::Graph(format!("invalid file name {}", file_name)))?;

    let mut effective_paths: Vec<PathBuf> = search_paths.to_vec();
    if let Some(dir) = file_dir {
        for base in search_paths {
            let candidate = base.join(dir);
            if candidate.exists() {
                effective_paths = vec![candidate];
                break;
            }
        }
    }

    for base in &effective_paths {
        let direct = base.join(base_name);
        if direct.exists() {
            return load_graph_from_file(&direct, registry, search_paths);
        }
        let mut files = Vec::new();
        walk_json_files(base, &mut files);
        if let Some(found) = files.into_iter().find(|p| p.file_name() == Some(base_name)) {
            return load_graph_from_file(&found, registry, search_paths);
        }
    }

    Err(NodeError::Graph(format!(
        "Could not find {} in any of the search paths",
        file_name
    )))
}

pub fn load_graph_from_file(
    file_path: &Path,
    registry: &Registry,
    search_paths: &[PathBuf],
) -> Result<(Graph, PathInfo), NodeError> {
    let raw = std::fs::read_to_string(file_path)
        .map_err(|e| NodeError::Graph(format!("cannot read {}: {}", file_path.display(), e)))?;
    let mut doc: NodeDoc = serde_json::from_str(&raw)
        .map_err(|e| NodeError::Graph(format!("invalid graph file {}: {}", file_path.display(), e)))?;

    let inherited_edges = merge_extends(&mut doc, file_path.parent(), search_paths)?;

    let mut graph = registry::hydrate_graph(registry, &doc)?;
    graph.inherited_edges = inherited_edges;
    graph.reinitialize()?;

    let relative_path = search_paths
        .iter()
        .find_map(|base| file_path.strip_prefix(base).ok())
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| file_path.display().to_string());

    Ok((
        graph,
        PathInfo {
            full_path: file_path.display().to_string(),
            relative_path,
            search_paths: search_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
        },
    ))
}

/// Persist a graph, writing only the authored delta when the graph
/// extends a base file.
pub async fn save_graph(graph: &Graph, file_path: &Path) -> Result<(), NodeError> {
    let doc = graph.to_doc(true);
    let rendered = serde_json::to_string_pretty(&doc)
        .map_err(|e| NodeError::Graph(format!("cannot serialize graph: {}", e)))?;
    tokio::fs::write(file_path, rendered)
        .await
        .map_err(|e| NodeError::Graph(format!("cannot write {}: {}", file_path.display(), e)))?;
    Ok(())
}

// ── flattened editor format ────────────────────────────────────────────

/// Export one nesting level of the graph into the flat node list +
/// connection list representation the editor UI speaks.
pub fn export_flat_graph(graph: &Graph) -> FlatGraphDoc {
    let mut flat = FlatGraphDoc {
        registry: if graph.registry.is_empty() {
            None
        } else {
            Some(graph.registry.clone())
        },
        base_type: graph.kind.base_type().to_string(),
        title: graph.title.clone(),
        extends: graph.extends.clone(),
        groups: graph.groups.clone(),
        comments: graph.comments.clone(),
        ..FlatGraphDoc::default()
    };

    for (name, value) in &graph.properties {
        flat.properties.insert(name.clone(), value.to_json());
    }
    for (name, field) in &graph.fields {
        flat.fields.insert(name.clone(), field.to_json());
    }
    for (name, field) in graph.module_properties() {
        flat.fields.insert(name, field.to_json());
    }

    for node in graph.nodes.values() {
        let properties = match node {
            GraphNode::Leaf(leaf) => leaf
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
            GraphNode::Graph(child) => child
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        };
        let (x, y, width, height, collapsed) = match node {
            GraphNode::Leaf(leaf) => (leaf.x, leaf.y, leaf.width, leaf.height, leaf.collapsed),
            GraphNode::Graph(child) => {
                (child.x, child.y, child.width, child.height, child.collapsed)
            }
        };
        flat.nodes.push(FlatNodeDoc {
            id: node.id().to_string(),
            registry: node.registry().to_string(),
            properties,
            x,
            y,
            width,
            height,
            parent: Some(graph.id.clone()),
            title: node.title().to_string(),
            collapsed,
            inherited: node.inherited(),
        });

        for socket in node.inputs() {
            if let Some(source) = &socket.source {
                flat.connections.push(ConnectionDoc {
                    from: source.full_id(),
                    to: socket.full_id(),
                });
            }
        }
    }
    flat
}

/// Rebuild a graph hierarchy from the flat representation. Nodes tagged
/// with a parent id are nested into that container.
pub fn import_flat_graph(
    flat: &FlatGraphDoc,
    registry: &Registry,
    search_paths: &[PathBuf],
) -> Result<Graph, NodeError> {
    let mut graph = match flat.registry.as_ref().and_then(|path| registry.get(path)) {
        Some(node_type) => {
            match node_type.create(registry, NodeSeed::default())? {
                GraphNode::Graph(child) => Arc::try_unwrap(child)
                    .map_err(|_| NodeError::Graph("graph type produced a shared instance".into()))?,
                GraphNode::Leaf(_) => {
                    return Err(NodeError::Graph(format!(
                        "registry type {} is not a graph",
                        flat.registry.as_deref().unwrap_or_default()
                    )));
                }
            }
        }
        None => Graph::new(crate::graph::GraphKind::from_base_type(&flat.base_type)),
    };

    // replace any definition content with the editor's payload
    graph.nodes.clear();
    graph.edges.clear();
    graph.groups = flat.groups.clone();
    graph.comments = flat.comments.clone();
    graph.title = flat.title.clone();
    graph.extends = flat.extends.clone();
    graph.properties = flat
        .properties
        .iter()
        .map(|(k, v)| (k.clone(), crate::value::Value::from_json_property(v)))
        .collect();

    let top_level_parent = graph.id.clone();

    for node_doc in &flat.nodes {
        let seed = NodeSeed {
            id: Some(node_doc.id.clone()),
            title: Some(node_doc.title.clone()),
            x: node_doc.x,
            y: node_doc.y,
            width: Some(node_doc.width),
            height: Some(node_doc.height),
            collapsed: node_doc.collapsed,
            inherited: node_doc.inherited,
            properties: node_doc
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), crate::value::Value::from_json_property(v)))
                .collect(),
        };
        let node = registry.create(&node_doc.registry, seed)?;

        match &node_doc.parent {
            Some(parent) if *parent != top_level_parent => {
                let target = find_graph_mut(&mut graph, parent).ok_or_else(|| {
                    NodeError::Graph(format!(
                        "Parent node {} not found for node {}",
                        parent, node_doc.id
                    ))
                })?;
                target.add_node(node);
            }
            _ => {
                graph.add_node(node);
            }
        }
    }

    for connection in &flat.connections {
        let entry = graph.edges.entry(connection.from.clone()).or_default();
        if !entry.contains(&connection.to) {
            entry.push(connection.to.clone());
        }
    }

    if graph.extends.is_some() {
        // round-trip through the document form to layer the base content
        let mut doc = graph.to_doc(false);
        let inherited_edges = merge_extends(&mut doc, None, search_paths)?;
        let mut merged = registry::hydrate_graph(registry, &doc)?;
        merged.inherited_edges = inherited_edges;
        merged.reinitialize()?;
        return Ok(merged);
    }

    graph.reinitialize()?;
    Ok(graph)
}

fn contains_graph(graph: &Graph, id: &str) -> bool {
    graph.nodes.values().any(|node| {
        node.as_graph()
            .map(|child| child.id == id || contains_graph(child, id))
            .unwrap_or(false)
    })
}

fn find_graph_mut<'a>(graph: &'a mut Graph, id: &str) -> Option<&'a mut Graph> {
    let key = graph.nodes.iter().find_map(|(key, node)| {
        node.as_graph().and_then(|child| {
            if child.id == id || contains_graph(child, id) {
                Some(key.clone())
            } else {
                None
            }
        })
    })?;
    let GraphNode::Graph(child) = graph.nodes.get_mut(&key)? else {
        return None;
    };
    let child = Arc::get_mut(child)?;
    if child.id == id {
        Some(child)
    } else {
        find_graph_mut(child, id)
    }
}
