//! Fabula
//!
//! Interactive fiction engine driver: loads node-graph modules and runs
//! them against a scene, with stdin feeding the player input queue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use storygraph_runtime::graph::GraphKind;
use storygraph_runtime::scene::{PlayerInput, Scene, execute_scene_loop};
use storygraph_runtime::{ExecOptions, GraphState, Registry, execute, execute_loop, layout};

/// Fabula story engine
#[derive(Parser, Debug)]
#[command(name = "fabula")]
#[command(about = "Fabula story engine", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Additional node module search paths
    #[arg(short, long, global = true)]
    search_path: Vec<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a graph module and execute it
    Run {
        /// Path or file name of the module to run
        module: String,

        /// Scene name to run the module under
        #[arg(long, default_value = "scene")]
        scene: String,

        /// Directory to persist scene saves into
        #[arg(long)]
        save_dir: Option<PathBuf>,

        /// Save the scene at the end of every loop cycle
        #[arg(long)]
        auto_save: bool,

        /// Run in the creative environment (enables tracing/breakpoints)
        #[arg(long)]
        creative: bool,
    },

    /// Load a graph module and report its structure without running it
    Validate {
        /// Path or file name of the module to check
        module: String,
    },

    /// List all registered node types
    Nodes,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fabula=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let registry = Registry::with_builtins();

    let mut search_paths = args.search_path.clone();
    if search_paths.is_empty() {
        search_paths.push(PathBuf::from("."));
    }

    match args.command {
        Command::Nodes => {
            for path in registry.paths() {
                println!("{}", path);
            }
            Ok(())
        }
        Command::Validate { module } => {
            let (graph, info) = layout::load_graph(&module, &search_paths, &registry)
                .with_context(|| format!("loading {}", module))?;
            let built = graph.build_digraph();
            if built.is_cyclic() {
                bail!("{}: graph contains cycles", info.relative_path);
            }
            let chains = built.chains().map_err(|e| anyhow::anyhow!(e.to_string()))?;
            println!(
                "{}: {} nodes, {} edges, {} chains",
                info.relative_path,
                graph.nodes.len(),
                graph.edges.len(),
                chains.len()
            );
            Ok(())
        }
        Command::Run {
            module,
            scene,
            save_dir,
            auto_save,
            creative,
        } => {
            let (graph, info) = layout::load_graph(&module, &search_paths, &registry)
                .with_context(|| format!("loading {}", module))?;
            info!(module = %info.relative_path, title = %graph.title, "module loaded");

            let scene = build_scene(&scene, &registry, save_dir, auto_save, creative);
            let graph = Arc::new(graph);
            let state = GraphState::new();
            state.set_scene(scene.clone());

            spawn_input_pump(scene.clone());

            let result = match graph.kind {
                GraphKind::SceneLoop(_) => execute_scene_loop(&graph, &scene, &state).await,
                GraphKind::Loop(_) => execute_loop(&graph, &state, ExecOptions::default()).await,
                _ => execute(&graph, Some(&state), ExecOptions::default())
                    .await
                    .map(|inner| print_outputs(&graph, &inner)),
            };

            if let Err(err) = result {
                error!(error = %err, "module execution failed");
                bail!("execution failed: {}", err);
            }
            Ok(())
        }
    }
}

fn build_scene(
    name: &str,
    registry: &Arc<Registry>,
    save_dir: Option<PathBuf>,
    auto_save: bool,
    creative: bool,
) -> Scene {
    let scene = Scene::new(name, Arc::clone(registry));
    if let Some(dir) = save_dir {
        scene.set_save_dir(dir);
    }
    scene.set_auto_save(auto_save);
    if creative {
        scene.set_environment("creative");
    }
    scene
}

/// Feed stdin lines into the scene's player input queue; EOF deactivates
/// the scene so a piped session terminates cleanly.
fn spawn_input_pump(scene: Scene) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => {
                    scene.set_active(false);
                    break;
                }
                Ok(_) => {
                    scene.push_input(PlayerInput::text(line.trim_end_matches('\n')));
                }
            }
        }
    });
}

fn print_outputs(graph: &storygraph_runtime::Graph, state: &GraphState) {
    for socket in &graph.computed_outputs {
        let value = state.socket_value(&graph.id, &socket.name);
        println!("{} = {:?}", socket.name, value);
    }
}
