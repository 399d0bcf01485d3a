// Scene model and the scene-loop driver.
//
// The scene is the engine's ambient collaborator: it owns the player
// input queue, slash commands, persistent game state and save handling.
// SceneLoop is the top-level Loop kind that drives a running story:
// each cycle reconnects listeners, signals the game_loop event and
// persists the scene.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::command::{CommandSet, register_commands_from_registry};
use crate::error::NodeError;
use crate::event::{ScriptEvent, connect_listeners, disconnect_listeners};
use crate::exec::{self, ExecOptions};
use crate::graph::{Graph, GraphKind, GraphNode, LoopConfig};
use crate::node::{Node, NodeBehavior, NodeCx, PropertyField, Socket};
use crate::registry::{NodeType, Registry};
use crate::signals;
use crate::state::{GraphState, NodeVerbosity};
use crate::value::Value;

/// One message from the player, with interaction metadata.
#[derive(Debug, Clone, Default)]
pub struct PlayerInput {
    pub message: String,
    pub data: IndexMap<String, Value>,
}

impl PlayerInput {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: IndexMap::new(),
        }
    }
}

struct SceneInner {
    name: Mutex<String>,
    active: AtomicBool,
    auto_save: AtomicBool,
    auto_progress: AtomicBool,
    environment: Mutex<String>,
    save_dir: Mutex<Option<PathBuf>>,
    game_state: Mutex<IndexMap<String, Value>>,
    changelog: Mutex<Vec<String>>,
    commands: CommandSet,
    input_queue: Mutex<VecDeque<PlayerInput>>,
    registry: Arc<Registry>,
    tasks: Mutex<HashMap<String, AbortHandle>>,
    memory_ready: AtomicBool,
    pins_loaded: AtomicBool,
}

/// Cheap cloneable handle to the running scene.
#[derive(Clone)]
pub struct Scene {
    inner: Arc<SceneInner>,
}

impl Scene {
    pub fn new(name: impl Into<String>, registry: Arc<Registry>) -> Self {
        Self {
            inner: Arc::new(SceneInner {
                name: Mutex::new(name.into()),
                active: AtomicBool::new(true),
                auto_save: AtomicBool::new(false),
                auto_progress: AtomicBool::new(true),
                environment: Mutex::new("scene".to_string()),
                save_dir: Mutex::new(None),
                game_state: Mutex::new(IndexMap::new()),
                changelog: Mutex::new(Vec::new()),
                commands: CommandSet::new(),
                input_queue: Mutex::new(VecDeque::new()),
                registry,
                tasks: Mutex::new(HashMap::new()),
                memory_ready: AtomicBool::new(false),
                pins_loaded: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.name.lock().clone()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn commands(&self) -> &CommandSet {
        &self.inner.commands
    }

    pub fn active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.inner.active.store(active, Ordering::SeqCst);
        if !active {
            self.cancel_tasks();
        }
    }

    pub fn auto_save(&self) -> bool {
        self.inner.auto_save.load(Ordering::SeqCst)
    }

    pub fn set_auto_save(&self, auto_save: bool) {
        self.inner.auto_save.store(auto_save, Ordering::SeqCst);
    }

    pub fn auto_progress(&self) -> bool {
        self.inner.auto_progress.load(Ordering::SeqCst)
    }

    pub fn environment(&self) -> String {
        self.inner.environment.lock().clone()
    }

    pub fn set_environment(&self, environment: impl Into<String>) {
        *self.inner.environment.lock() = environment.into();
    }

    pub fn set_save_dir(&self, dir: impl Into<PathBuf>) {
        *self.inner.save_dir.lock() = Some(dir.into());
    }

    // ── game state ─────────────────────────────────────────────────────

    pub fn game_state_get(&self, name: &str) -> Option<Value> {
        self.inner.game_state.lock().get(name).cloned()
    }

    pub fn game_state_set(&self, name: &str, value: Value) {
        self.inner.game_state.lock().insert(name.to_string(), value);
    }

    pub fn game_state_remove(&self, name: &str) -> Option<Value> {
        self.inner.game_state.lock().shift_remove(name)
    }

    // ── memory / pins hooks (external collaborators, minimal here) ─────

    pub async fn ensure_memory(&self) {
        if !self.inner.memory_ready.swap(true, Ordering::SeqCst) {
            debug!(scene = %self.name(), "memory ready");
        }
    }

    pub async fn load_active_pins(&self) {
        if !self.inner.pins_loaded.swap(true, Ordering::SeqCst) {
            debug!(scene = %self.name(), "active pins loaded");
        }
    }

    // ── player input ───────────────────────────────────────────────────

    pub fn push_input(&self, input: PlayerInput) {
        self.inner.input_queue.lock().push_back(input);
    }

    fn pop_input(&self) -> Option<PlayerInput> {
        self.inner.input_queue.lock().pop_front()
    }

    /// Wait for the next player input, polling the abort condition each
    /// tick. Returns None when the wait was aborted.
    pub async fn wait_for_input<F, Fut>(
        &self,
        prefix: &str,
        abort_condition: Option<F>,
        sleep_time: Duration,
    ) -> Result<Option<PlayerInput>, NodeError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<bool, NodeError>>,
    {
        if !prefix.is_empty() {
            debug!(prefix = %prefix, "waiting for input");
        }
        loop {
            if let Some(input) = self.pop_input() {
                return Ok(Some(input));
            }
            if !self.active() {
                // an inactive scene ends the waiting execution cleanly
                return Err(NodeError::stop_graph("scene is no longer active"));
            }
            if let Some(check) = &abort_condition {
                if check().await? {
                    return Ok(None);
                }
            }
            tokio::time::sleep(sleep_time).await;
        }
    }

    // ── commands ───────────────────────────────────────────────────────

    /// Dispatch a `!command:arg` message. Returns whether a command ran.
    pub async fn execute_command(
        &self,
        text: &str,
        state: &GraphState,
    ) -> Result<bool, NodeError> {
        self.inner.commands.execute(text, state).await
    }

    // ── background tasks ───────────────────────────────────────────────

    pub fn register_task(&self, key: &str, handle: AbortHandle) {
        self.inner.tasks.lock().insert(key.to_string(), handle);
    }

    pub fn remove_task(&self, key: &str) {
        self.inner.tasks.lock().remove(key);
    }

    pub fn cancel_tasks(&self) {
        for (_, handle) in self.inner.tasks.lock().drain() {
            handle.abort();
        }
    }

    // ── persistence ────────────────────────────────────────────────────

    pub fn changelog_append(&self, entry: impl Into<String>) {
        self.inner.changelog.lock().push(entry.into());
    }

    pub fn changelog(&self) -> Vec<String> {
        self.inner.changelog.lock().clone()
    }

    /// Persist the scene state to its save directory.
    pub async fn save(&self, auto: bool) -> Result<(), NodeError> {
        let Some(dir) = self.inner.save_dir.lock().clone() else {
            debug!(scene = %self.name(), "no save dir configured, skipping save");
            return Ok(());
        };
        let game_state: serde_json::Map<String, serde_json::Value> = self
            .inner
            .game_state
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        let payload = serde_json::json!({
            "name": self.name(),
            "auto": auto,
            "game_state": game_state,
            "changelog": self.changelog(),
        });
        let path = dir.join(crate::layout::normalize_node_filename(&self.name()));
        let rendered = serde_json::to_string_pretty(&payload)
            .map_err(|e| NodeError::Graph(format!("cannot serialize scene: {}", e)))?;
        tokio::fs::write(&path, rendered)
            .await
            .map_err(|e| NodeError::Graph(format!("cannot write {}: {}", path.display(), e)))?;
        info!(scene = %self.name(), auto = auto, "scene saved");
        Ok(())
    }

    pub async fn emit_status(&self) {
        if let Some(signal) = signals::get("status") {
            let event = ScriptEvent::new("status");
            event.set_field("scene", Value::String(self.name()));
            event.set_field("active", Value::Bool(self.active()));
            let _ = signal.send(event).await;
        }
    }
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<scene {}>", self.name())
    }
}

// ── scene loop lifecycle ───────────────────────────────────────────────

fn scene_from_state(state: &GraphState) -> Result<Scene, NodeError> {
    state
        .scene()
        .ok_or_else(|| NodeError::Graph("scene loop requires an active scene".into()))
}

fn scene_loop_event(scene: &Scene, event_type: &str) -> ScriptEvent {
    let event = ScriptEvent::new(event_type);
    event.set_field("scene", Value::Scene(scene.clone()));
    event
}

fn graph_property(graph: &Graph, state: &GraphState, name: &str) -> Value {
    state
        .node_property(&graph.id, name)
        .unwrap_or_else(|| graph.properties.get(name).cloned().unwrap_or(Value::Unresolved))
}

pub(crate) async fn scene_loop_start(
    graph: &Arc<Graph>,
    state: &GraphState,
) -> Result<(), NodeError> {
    let scene = scene_from_state(state)?;
    scene.ensure_memory().await;
    scene.load_active_pins().await;

    // listener set may have changed between cycles
    connect_listeners(graph, state, true);

    if state.get("_scene_loop_init").is_none() {
        register_commands_from_registry(&scene, scene.registry())?;
        if let Some(signal) = signals::get("scene_loop_init") {
            signal.send(scene_loop_event(&scene, "scene_loop_init")).await?;
        }
        state.set("_scene_loop_init", Value::Bool(true));
    }

    let trigger_game_loop = match graph_property(graph, state, "trigger_game_loop") {
        Value::Unresolved => true,
        value => value.as_bool(),
    };

    if state.verbosity() >= NodeVerbosity::Verbose {
        debug!(
            id = %graph.id,
            trigger_game_loop = trigger_game_loop,
            "scene loop cycle start"
        );
    }

    if trigger_game_loop {
        let game_loop = ScriptEvent::new("game_loop");
        game_loop.set_field("had_passive_narration", Value::Bool(false));
        game_loop.set_field("scene", Value::Scene(scene.clone()));
        state.shared_set("game_loop", Value::Event(game_loop.clone()));

        let signal_game_loop = state
            .shared_get("signal_game_loop")
            .map(|v| v.as_bool())
            .unwrap_or(true);
        if signal_game_loop {
            if let Some(signal) = signals::get("game_loop") {
                signal.send(game_loop).await?;
            }
        }
    }

    state.shared_set("signal_game_loop", Value::Bool(true));
    state.shared_set("scene_loop", Value::Dict(IndexMap::new()));
    state.shared_set(
        "creative_mode",
        Value::Bool(scene.environment() == "creative"),
    );

    if let Some(signal) = signals::get("scene_loop_start_cycle") {
        signal
            .send(scene_loop_event(&scene, "scene_loop_start_cycle"))
            .await?;
    }
    Ok(())
}

pub(crate) async fn scene_loop_end(
    _graph: &Arc<Graph>,
    state: &GraphState,
) -> Result<(), NodeError> {
    let scene = scene_from_state(state)?;
    if scene.auto_save() {
        scene.save(true).await?;
        scene.changelog_append("auto save");
    }
    scene.emit_status().await;
    if let Some(signal) = signals::get("scene_loop_end_cycle") {
        signal
            .send(scene_loop_event(&scene, "scene_loop_end_cycle"))
            .await?;
    }
    Ok(())
}

/// Translate player-acted and cancelled-generation signals into clean
/// loop breaks; everything else is left to default handling.
pub(crate) async fn scene_loop_error(
    _graph: &Arc<Graph>,
    state: &GraphState,
    err: &NodeError,
) -> Result<(), NodeError> {
    match err {
        NodeError::ActedAsCharacter(character_name) => {
            state.shared_set("signal_game_loop", Value::Bool(false));
            state.shared_set(
                "acted_as_character",
                Value::String(character_name.clone()),
            );
            Err(NodeError::LoopBreak)
        }
        NodeError::GenerationCancelled => {
            state.shared_set("skip_to_player", Value::Bool(true));
            state.shared_set("signal_game_loop", Value::Bool(false));
            Err(NodeError::LoopBreak)
        }
        _ => Ok(()),
    }
}

/// Drive a SceneLoop graph against a scene. Listeners are disconnected
/// when the loop exits, however it exits.
pub async fn execute_scene_loop(
    graph: &Arc<Graph>,
    scene: &Scene,
    outer: &GraphState,
) -> Result<(), NodeError> {
    outer.set_scene(scene.clone());
    outer.set("scene", Value::Scene(scene.clone()));
    let result = exec::execute_loop(graph, outer, ExecOptions::default()).await;
    disconnect_listeners(graph, outer);
    result
}

/// Build a SceneLoop container graph.
pub fn new_scene_loop() -> Graph {
    let mut graph = Graph::new(GraphKind::SceneLoop(LoopConfig::default()));
    graph.registry = "scene/SceneLoop".to_string();
    graph
        .properties
        .insert("trigger_game_loop".to_string(), Value::Bool(true));
    graph.fields.insert(
        "trigger_game_loop".to_string(),
        PropertyField::new("trigger_game_loop", "bool")
            .description("Trigger the game loop event")
            .default_value(true),
    );
    graph
}

// ── nodes ──────────────────────────────────────────────────────────────

/// Basic information about the running scene.
pub struct GetSceneState;

#[async_trait]
impl NodeBehavior for GetSceneState {
    fn default_title(&self) -> &str {
        "Get Scene State"
    }

    fn setup(&self, node: &mut Node) {
        node.add_output(Socket::new("active").with_type("bool"));
        node.add_output(Socket::new("auto_save").with_type("bool"));
        node.add_output(Socket::new("auto_progress").with_type("bool"));
        node.add_output(Socket::new("scene").with_type("scene"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let scene = scene_from_state(cx.state)?;
        cx.set_output("active", scene.active());
        cx.set_output("auto_save", scene.auto_save());
        cx.set_output("auto_progress", scene.auto_progress());
        cx.set_output("scene", Value::Scene(scene));
        Ok(())
    }
}

/// Snapshots of the current, parent and shared state scopes.
pub struct GetSceneLoopState;

#[async_trait]
impl NodeBehavior for GetSceneLoopState {
    fn default_title(&self) -> &str {
        "Get Scene Loop State"
    }

    fn setup(&self, node: &mut Node) {
        node.add_output(Socket::new("state").with_type("dict"));
        node.add_output(Socket::new("parent").with_type("dict"));
        node.add_output(Socket::new("shared").with_type("dict"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        cx.set_output("state", Value::Dict(cx.state.data_snapshot()));
        cx.set_output(
            "parent",
            Value::Dict(
                cx.state
                    .outer()
                    .map(|outer| outer.data_snapshot())
                    .unwrap_or_default(),
            ),
        );
        cx.set_output("shared", Value::Dict(cx.state.shared_snapshot()));
        Ok(())
    }
}

/// Wait for the player's next message. The subchain wired to
/// `abort_condition` is evaluated on every poll; when it resolves the
/// wait continues the loop instead of blocking.
pub struct WaitForInput;

#[async_trait]
impl NodeBehavior for WaitForInput {
    fn default_title(&self) -> &str {
        "Get Input"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("state"));
        node.add_input(Socket::new("player_character").with_type("character").optional());
        node.add_input(Socket::new("reason").with_type("str").optional());
        node.add_input(Socket::new("prefix").with_type("str").optional());
        node.add_input(Socket::new("abort_condition").optional());
        node.declare_field(
            PropertyField::new("reason", "str")
                .description("The reason for the input")
                .default_value("talk"),
        );
        node.declare_field(
            PropertyField::new("prefix", "str")
                .description("The prefix for the input message")
                .default_value(""),
        );
        node.declare_field(
            PropertyField::new("allow_commands", "bool")
                .description("Allow commands to be executed, using the ! prefix")
                .default_value(true),
        );
        node.add_output(Socket::new("input").with_type("str"));
        node.add_output(Socket::new("interaction_state").with_type("interaction_state"));
        node.add_output(Socket::new("character").with_type("character"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let scene = scene_from_state(cx.state)?;
        let allow_commands = cx.property("allow_commands").as_bool();
        let player_character = cx.input("player_character");

        let abort_source = cx
            .node
            .input_socket("abort_condition")
            .and_then(|socket| socket.source.clone());

        let abort_check = abort_source.as_ref().map(|source| {
            let graph = cx.graph;
            let state = cx.state;
            move || {
                let source = source.clone();
                async move {
                    let mut opts = ExecOptions::default();
                    opts.suppress_trace = true;
                    let inner =
                        exec::execute_to_node(graph, &source.node_id, Some(state), false, opts)
                            .await?;
                    let value = inner.socket_value(&source.node_id, &source.name);
                    Ok(match value {
                        Value::Bool(b) => b,
                        Value::Unresolved | Value::Null => false,
                        _ => true,
                    })
                }
            }
        });

        if player_character.is_set(false) {
            if let Some(signal) = signals::get("player_turn_start") {
                let event = ScriptEvent::new("player_turn_start");
                event.set_field("scene", Value::Scene(scene.clone()));
                signal.send(event).await?;
            }
        }

        let sleep_time = if cx.verbosity() >= NodeVerbosity::Verbose {
            Duration::from_secs(1)
        } else {
            Duration::from_millis(100)
        };

        let prefix = cx.input("prefix");
        let input = scene
            .wait_for_input(
                prefix.as_str().unwrap_or(""),
                abort_check,
                sleep_time,
            )
            .await?;

        let Some(input) = input else {
            // aborted waits restart the loop cycle
            return Err(NodeError::LoopContinue);
        };

        cx.state.shared_set("skip_to_player", Value::Bool(false));

        if input.message.is_empty() {
            return Err(NodeError::LoopContinue);
        }

        if allow_commands && scene.execute_command(&input.message, cx.state).await? {
            state_flags_after_command(cx.state);
            return Err(NodeError::LoopBreak);
        }

        warn!(message = %input.message, "wait for input");

        cx.set_output("input", input.message);
        cx.set_output("interaction_state", Value::Dict(input.data));
        cx.set_output("character", player_character);
        Ok(())
    }
}

fn state_flags_after_command(state: &GraphState) {
    state.shared_set("signal_game_loop", Value::Bool(false));
    state.shared_set("skip_to_player", Value::Bool(true));
}

pub fn register(registry: &Registry) -> Result<(), NodeError> {
    registry.register_behavior("scene/GetSceneState", Arc::new(GetSceneState), "core/Node")?;
    registry.register_behavior(
        "scene/GetSceneLoopState",
        Arc::new(GetSceneLoopState),
        "core/Node",
    )?;
    registry.register_behavior("input/WaitForInput", Arc::new(WaitForInput), "core/Node")?;

    let factory: crate::registry::NodeFactory = Arc::new(|_registry, seed| {
        let mut graph = new_scene_loop();
        let mut seed = seed;
        let properties = std::mem::take(&mut seed.properties);
        seed_apply_graph(&mut graph, seed);
        for (name, value) in properties {
            graph.properties.insert(name, value);
        }
        Ok(GraphNode::Graph(Arc::new(graph)))
    });
    registry.register_node_type(
        NodeType::new("scene/SceneLoop", "scene/SceneLoop", false, factory),
        false,
    )?;
    Ok(())
}

fn seed_apply_graph(graph: &mut Graph, seed: crate::registry::NodeSeed) {
    if let Some(id) = seed.id {
        graph.id = id;
    }
    if let Some(title) = seed.title {
        graph.title = title;
    }
    graph.x = seed.x;
    graph.y = seed.y;
    if let Some(width) = seed.width {
        graph.width = width;
    }
    if let Some(height) = seed.height {
        graph.height = height;
    }
    graph.collapsed = seed.collapsed;
    graph.inherited = seed.inherited;
}
