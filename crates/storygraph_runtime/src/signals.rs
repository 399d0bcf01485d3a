// Named async signal bus.
//
// Triggers publish to a signal by name; Listen graphs subscribe with a
// keyed callback so they can be disconnected again. Delivery awaits every
// receiver in turn before returning to the sender.

use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::error::NodeError;
use crate::event::ScriptEvent;

pub type SignalHandler =
    Arc<dyn Fn(ScriptEvent) -> BoxFuture<'static, Result<(), NodeError>> + Send + Sync>;

struct Receiver {
    key: String,
    handler: SignalHandler,
}

/// One named signal and its subscribers.
pub struct AsyncSignal {
    name: String,
    receivers: Mutex<Vec<Receiver>>,
}

impl AsyncSignal {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            receivers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe under a key. Connecting the same key twice is a no-op.
    pub fn connect(&self, key: &str, handler: SignalHandler) {
        let mut receivers = self.receivers.lock();
        if receivers.iter().any(|r| r.key == key) {
            return;
        }
        receivers.push(Receiver {
            key: key.to_string(),
            handler,
        });
    }

    pub fn disconnect(&self, key: &str) {
        self.receivers.lock().retain(|r| r.key != key);
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.lock().len()
    }

    /// Deliver an event to every receiver, awaiting each. The first
    /// receiver error propagates to the sender.
    pub async fn send(&self, event: ScriptEvent) -> Result<(), NodeError> {
        let handlers: Vec<SignalHandler> = self
            .receivers
            .lock()
            .iter()
            .map(|r| Arc::clone(&r.handler))
            .collect();
        for handler in handlers {
            handler(event.clone()).await?;
        }
        Ok(())
    }
}

static SIGNALS: LazyLock<DashMap<String, Arc<AsyncSignal>>> = LazyLock::new(DashMap::new);

/// Ensure the named signals exist. Safe to call repeatedly.
pub fn register(names: &[&str]) {
    for name in names {
        SIGNALS
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncSignal::new(name)));
    }
}

pub fn get(name: &str) -> Option<Arc<AsyncSignal>> {
    SIGNALS.get(name).map(|entry| Arc::clone(entry.value()))
}

/// Signals the engine itself publishes or consumes.
pub fn register_engine_signals() {
    register(&[
        "nodes_node_state",
        "nodes_breakpoint",
        "status",
        "game_loop",
        "game_loop_actor_iter",
        "player_turn_start",
        "scene_loop_init",
        "scene_loop_start_cycle",
        "scene_loop_end_cycle",
        "scene_loop_error",
    ]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn send_reaches_all_receivers() {
        register(&["test_signal_send"]);
        let signal = get("test_signal_send").unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b"] {
            let count = Arc::clone(&count);
            signal.connect(
                key,
                Arc::new(move |_event| {
                    let count = Arc::clone(&count);
                    Box::pin(async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            );
        }

        let event = ScriptEvent::new("test_signal_send");
        event.set_field("value", Value::Int(1));
        signal.send(event).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disconnect_removes_receiver() {
        register(&["test_signal_disconnect"]);
        let signal = get("test_signal_disconnect").unwrap();
        signal.connect("x", Arc::new(|_| Box::pin(async { Ok(()) })));
        assert_eq!(signal.receiver_count(), 1);
        // connecting the same key again is a no-op
        signal.connect("x", Arc::new(|_| Box::pin(async { Ok(()) })));
        assert_eq!(signal.receiver_count(), 1);
        signal.disconnect("x");
        assert_eq!(signal.receiver_count(), 0);
    }
}
