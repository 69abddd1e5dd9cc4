//! Environment
//!
//! The only component allowed to perform external side effects.
//!
//! Delivery is at-least-once: agents retry, so every command carries an
//! idempotency key and settled observations are replayed from a TTL ledger
//! instead of re-running the side effect. Transient errors are never recorded,
//! since nothing happened and a retry has to run for real.
//!
//! Side effects run on a detached task. A caller that times out or is
//! cancelled stops waiting; the action still runs to completion and its
//! observation lands in the ledger.

use async_trait::async_trait;
use moka::future::Cache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::adapter::LegacyAdapter;
use crate::types::{ActionCommand, Observation};

/// Something that actually touches the outside world
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, cmd: &ActionCommand) -> Observation;
}

/// Environment counters
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentStats {
    pub handler: String,
    pub performed: u64,
    pub deduplicated: u64,
    pub ledger_entries: u64,
}

/// Idempotent front for an [`ActionHandler`]
pub struct Environment {
    handler: Arc<dyn ActionHandler>,
    ledger: Cache<String, Observation>,
    performed: Arc<AtomicU64>,
    deduplicated: Arc<AtomicU64>,
}

impl Environment {
    pub fn new(handler: Arc<dyn ActionHandler>, ledger_capacity: u64, ledger_ttl: Duration) -> Self {
        let ledger = Cache::builder()
            .max_capacity(ledger_capacity)
            .time_to_live(ledger_ttl)
            .build();

        Self {
            handler,
            ledger,
            performed: Arc::new(AtomicU64::new(0)),
            deduplicated: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Perform a command, replaying the recorded observation for a known key
    pub async fn perform(&self, cmd: ActionCommand) -> Observation {
        let handler = self.handler.clone();
        let ledger = self.ledger.clone();
        let performed = self.performed.clone();
        let deduplicated = self.deduplicated.clone();

        let task_id = cmd.task_id.clone();
        let sequence = cmd.sequence;

        let side_effect = tokio::spawn(async move {
            let executed = AtomicBool::new(false);
            let key = cmd.idempotency_key.clone();

            let result = ledger
                .try_get_with(key, async {
                    executed.store(true, Ordering::SeqCst);
                    performed.fetch_add(1, Ordering::Relaxed);
                    let observation = handler.handle(&cmd).await;
                    if observation.is_settled() {
                        Ok(observation)
                    } else {
                        Err(observation)
                    }
                })
                .await;

            match result {
                Ok(observation) => {
                    if !executed.load(Ordering::SeqCst) {
                        deduplicated.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "Replayed observation for {}#{} (correlation {})",
                            cmd.task_id, cmd.sequence, cmd.correlation_id
                        );
                    }
                    observation
                }
                Err(transient) => (*transient).clone(),
            }
        });

        match side_effect.await {
            Ok(observation) => observation,
            Err(e) => {
                warn!("Action {}#{} aborted: {}", task_id, sequence, e);
                Observation::permanent("environment_panic")
            }
        }
    }

    /// Recorded observation for an idempotency key
    pub async fn recorded(&self, idempotency_key: &str) -> Option<Observation> {
        self.ledger.get(idempotency_key).await
    }

    pub fn stats(&self) -> EnvironmentStats {
        EnvironmentStats {
            handler: self.handler.name().to_string(),
            performed: self.performed.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            ledger_entries: self.ledger.entry_count(),
        }
    }
}

/// Simulated legacy agent module, driven through the legacy adapter
#[derive(Debug, Clone)]
pub struct LegacyModule {
    base_url: String,
}

impl LegacyModule {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
        }
    }

    /// Legacy `execute_task` call; returns the module's native result shape
    pub fn execute_task(&self, task_id: &str, params: &Value) -> Value {
        let action = params.get("action").and_then(Value::as_str).unwrap_or("unknown");
        debug!("Legacy execute {} via {}", task_id, self.base_url);
        json!({
            "status": "completed",
            "result_code": 200,
            "output": format!("Task {} executed with action {}", task_id, action),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }
}

impl Default for LegacyModule {
    fn default() -> Self {
        Self::new("https://legacy-api.example.com")
    }
}

#[async_trait]
impl ActionHandler for LegacyModule {
    fn name(&self) -> &str {
        "legacy"
    }

    async fn handle(&self, cmd: &ActionCommand) -> Observation {
        let params = LegacyAdapter::native_params(cmd);
        let native = self.execute_task(&cmd.task_id, &params);
        LegacyAdapter::observation_from_native(&native)
            .unwrap_or_else(|e| Observation::permanent(e.kind().as_str()))
    }
}

/// Handler that replays queued observations per task type.
///
/// Once a type's queue is drained it answers with success echoing the payload.
/// Used by the demo mode and by tests that need scripted failures.
#[derive(Default)]
pub struct ScriptedHandler {
    scripts: Mutex<HashMap<String, VecDeque<Observation>>>,
    side_effects: Mutex<HashMap<String, u32>>,
    latency: Option<Duration>,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every action by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue an observation for the next action of `kind`
    pub fn push(&self, kind: &str, observation: Observation) {
        self.scripts
            .lock()
            .entry(kind.to_string())
            .or_default()
            .push_back(observation);
    }

    /// How many times the side effect for a key actually ran
    pub fn side_effects(&self, idempotency_key: &str) -> u32 {
        self.side_effects
            .lock()
            .get(idempotency_key)
            .copied()
            .unwrap_or(0)
    }

    /// Total side effects across all keys
    pub fn total_side_effects(&self) -> u32 {
        self.side_effects.lock().values().sum()
    }
}

#[async_trait]
impl ActionHandler for ScriptedHandler {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn handle(&self, cmd: &ActionCommand) -> Observation {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        *self
            .side_effects
            .lock()
            .entry(cmd.idempotency_key.clone())
            .or_insert(0) += 1;

        let scripted = self
            .scripts
            .lock()
            .get_mut(&cmd.kind)
            .and_then(|queue| queue.pop_front());

        scripted.unwrap_or_else(|| Observation::success(json!({"echo": cmd.payload})))
    }
}
