//! Meta-Controller
//!
//! Receives task requests and is the terminal authority for them: every
//! submitted task ends in exactly one CompletionReport, appended to the audit
//! log whatever happened along the way.
//!
//! Per task:
//! validate → load context (backup, then empty on fault) → plan strategies →
//! approve (circuit breaker + resource gate) → dispatch under a deadline →
//! remember the result → audit.

pub mod admission;
pub mod audit;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, Attempts, CircuitBreaker, CircuitState, Execution};
use crate::config::Config;
use crate::environment::EnvironmentStats;
use crate::error::{MemoryError, TaskError};
use crate::memory::ContextStore;
use crate::metrics::ControllerMetrics;
use crate::types::{
    CompletionReport, Constraints, ContextRecord, ContextSnapshot, ControlSignal, TaskRequest,
};

pub use admission::{ResourceGate, ResourcePermit};
pub use audit::AuditLog;

/// One way of running a task: an agent and a resource footprint
#[derive(Clone)]
pub struct Strategy {
    pub agent: Arc<Agent>,
    pub units: u32,
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy")
            .field("agent", &self.agent.name())
            .field("units", &self.units)
            .finish()
    }
}

/// Liveness of one component
#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub name: String,
    pub capabilities: Vec<String>,
    pub circuit: CircuitState,
    pub environment: EnvironmentStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub ceiling: u32,
    pub in_use: u32,
    pub peak: u32,
}

/// Snapshot served by `GET /status`
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub controller: ComponentStatus,
    pub memory: ComponentStatus,
    pub agents: Vec<AgentStatus>,
    pub resources: ResourceStatus,
    pub tasks_in_flight: usize,
    pub audit_entries: usize,
}

/// Removes a task from the in-flight table when its pipeline ends
struct InFlight<'a> {
    table: &'a Mutex<HashMap<String, CancellationToken>>,
    metrics: &'a ControllerMetrics,
    task_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.table.lock().remove(&self.task_id);
        self.metrics.tasks_in_flight.dec();
    }
}

pub struct MetaController {
    config: Config,
    agents: RwLock<Vec<Arc<Agent>>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    gate: ResourceGate,
    memory: Arc<dyn ContextStore>,
    audit: AuditLog,
    metrics: Arc<ControllerMetrics>,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
    started: Instant,
}

impl MetaController {
    pub fn new(config: Config, memory: Arc<dyn ContextStore>, audit: AuditLog) -> Self {
        Self {
            gate: ResourceGate::new(config.resource_ceiling),
            config,
            agents: RwLock::new(Vec::new()),
            breakers: RwLock::new(HashMap::new()),
            memory,
            audit,
            metrics: Arc::new(ControllerMetrics::new()),
            in_flight: Mutex::new(HashMap::new()),
            started: Instant::now(),
        }
    }

    /// Register an agent; the first capable agent is a task type's primary
    pub fn register_agent(&self, agent: Agent) {
        let name = agent.name().to_string();
        let mut agents = self.agents.write();
        if let Some(existing) = agents.iter().position(|a| a.name() == name) {
            warn!("Replacing registered agent '{}'", name);
            agents.remove(existing);
        }
        agents.push(Arc::new(agent));
        self.breakers.write().insert(
            name.clone(),
            Arc::new(CircuitBreaker::with_config(&name, self.config.breaker_config())),
        );
        info!("Registered agent '{}'", name);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.metrics
    }

    pub fn gate(&self) -> &ResourceGate {
        &self.gate
    }

    pub fn memory(&self) -> &Arc<dyn ContextStore> {
        &self.memory
    }

    pub fn breaker(&self, agent: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(agent).cloned()
    }

    pub fn is_in_flight(&self, task_id: &str) -> bool {
        self.in_flight.lock().contains_key(task_id)
    }

    /// Request cooperative cancellation of an in-flight task
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.in_flight.lock().get(task_id) {
            Some(token) => {
                info!("Cancellation requested for task {}", task_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run a task to its terminal report
    pub async fn submit(&self, task: TaskRequest) -> CompletionReport {
        let start = Instant::now();

        if let Err(e) = task
            .validate(self.config.resource_ceiling, self.config.max_timeout_ms)
        {
            return self.finalize(CompletionReport::failed(&task.task_id, &e, start.elapsed())).await;
        }

        let token = CancellationToken::new();
        let duplicate = {
            let mut table = self.in_flight.lock();
            if table.contains_key(&task.task_id) {
                true
            } else {
                table.insert(task.task_id.clone(), token.clone());
                false
            }
        };
        if duplicate {
            let e = TaskError::InvalidInput(format!("task {} is already in flight", task.task_id));
            return self.finalize(CompletionReport::failed(&task.task_id, &e, start.elapsed())).await;
        }
        self.metrics.tasks_in_flight.inc();
        let guard = InFlight {
            table: &self.in_flight,
            metrics: &self.metrics,
            task_id: task.task_id.clone(),
        };

        let report = self.run(&task, &token, start).await;
        // Audited before the id leaves the in-flight table
        let report = self.finalize(report).await;
        drop(guard);
        report
    }

    async fn run(&self, task: &TaskRequest, token: &CancellationToken, start: Instant) -> CompletionReport {
        let snapshot = self.load_context(task.context_key()).await;
        let degraded = snapshot.degraded;
        let use_cached_schema = snapshot.record.cached_schema.is_some();
        let timeout_ms = self.config.effective_timeout_ms(task.timeout_ms);

        let strategies = self.plan(task);
        if strategies.is_empty() {
            let e = TaskError::Unsupported(task.kind.clone());
            let mut report = CompletionReport::failed(&task.task_id, &e, start.elapsed());
            report.degraded = degraded;
            return report;
        }

        let mut last_error = TaskError::Internal("no strategy attempted".into());
        let mut alternatives = 0u32;
        let mut actions = 0u32;
        let mut retries = 0u32;

        for (sequence, strategy) in strategies.iter().enumerate() {
            if sequence > 0 {
                alternatives += 1;
                self.metrics.alternatives.inc();
                debug!(
                    "Task {} trying alternative {}: agent '{}' with {} units",
                    task.task_id,
                    alternatives,
                    strategy.agent.name(),
                    strategy.units
                );
            }

            if token.is_cancelled() {
                last_error = TaskError::Cancelled;
                break;
            }

            let (signal, permit) = self
                .approve(task, strategy, &snapshot, use_cached_schema, timeout_ms)
                .await;
            let Some(permit) = permit else {
                self.metrics.rejections.inc();
                let reason = signal.reason.unwrap_or_else(|| "denied".into());
                debug!("Task {} denied on '{}': {}", task.task_id, strategy.agent.name(), reason);
                last_error = TaskError::Rejected(reason);
                continue;
            };
            self.metrics.approvals.inc();
            self.metrics.resources_in_use.set(self.gate.in_use() as u64);

            let attempts = Attempts::default();
            let dispatched = tokio::time::timeout(
                signal.constraints.timeout(),
                strategy
                    .agent
                    .execute_counted(&signal, sequence as u32, token, &attempts),
            )
            .await;
            drop(permit);
            self.metrics.resources_in_use.set(self.gate.in_use() as u64);

            let breaker = self.breaker(strategy.agent.name());
            let execution = match dispatched {
                Ok(execution) => execution,
                Err(_) => {
                    warn!("Task {} timed out after {} ms on '{}'", task.task_id, timeout_ms, strategy.agent.name());
                    if let Some(b) = &breaker {
                        b.record_failure().await;
                    }
                    let mut report = CompletionReport::failed(
                        &task.task_id,
                        &TaskError::Timeout(timeout_ms),
                        start.elapsed(),
                    );
                    report.agent = Some(strategy.agent.name().to_string());
                    report.resources_used.units = strategy.units;
                    report.resources_used.actions = actions + attempts.actions();
                    report.resources_used.retries = retries + attempts.retries();
                    report.alternatives_attempted = alternatives;
                    report.degraded = degraded;
                    return report;
                }
            };

            actions += execution.actions;
            retries += execution.retries;

            if let Some(b) = &breaker {
                match &execution.result {
                    Ok(_) => b.record_success().await,
                    Err(TaskError::ActionFailure { .. } | TaskError::PermanentActionFailure(_)) => {
                        b.record_failure().await
                    }
                    Err(_) => {}
                }
            }

            if execution.result.is_ok() {
                self.remember(task, &execution).await;
            }

            let has_next = sequence + 1 < strategies.len();
            if let Err(e) = &execution.result {
                if e.kind().allows_alternative() && has_next {
                    info!("Task {} escalated on '{}': {}", task.task_id, strategy.agent.name(), e);
                    if let Err(e) = execution.result {
                        last_error = e;
                    }
                    continue;
                }
            }

            let mut report = execution.into_report(&task.task_id, strategy.units, start.elapsed());
            report.resources_used.actions = actions;
            report.resources_used.retries = retries;
            report.alternatives_attempted = alternatives;
            report.degraded = degraded;
            return report;
        }

        let mut report = CompletionReport::failed(&task.task_id, &last_error, start.elapsed());
        report.resources_used.actions = actions;
        report.resources_used.retries = retries;
        report.alternatives_attempted = alternatives;
        report.degraded = degraded;
        report
    }

    /// Context for a key; faults degrade instead of failing the task
    async fn load_context(&self, key: &str) -> ContextSnapshot {
        match self.memory.get(key).await {
            Ok(record) => ContextSnapshot {
                record: record.unwrap_or_else(|| ContextRecord::empty(key)),
                degraded: false,
            },
            Err(fault) => {
                self.metrics.memory_faults.inc();
                warn!("Memory get failed for '{}': {}; trying backup", key, fault);

                match self.memory.recover_from_backup(key).await {
                    Ok(record) => {
                        self.metrics.backup_recoveries.inc();
                        info!("Context for '{}' recovered from backup v{}", key, record.version);
                        ContextSnapshot {
                            record,
                            degraded: true,
                        }
                    }
                    Err(e) => {
                        if !matches!(e, MemoryError::Unrecoverable(_)) {
                            self.metrics.memory_faults.inc();
                        }
                        warn!("No usable context for '{}' ({}); continuing empty", key, e);
                        ContextSnapshot {
                            record: ContextRecord::empty(key),
                            degraded: true,
                        }
                    }
                }
            }
        }
    }

    /// Primary agent, other capable agents, then the primary's reduced footprints
    pub fn plan(&self, task: &TaskRequest) -> Vec<Strategy> {
        let capable: Vec<Arc<Agent>> = self
            .agents
            .read()
            .iter()
            .filter(|a| a.supports(&task.kind))
            .cloned()
            .collect();
        let Some(primary) = capable.first().cloned() else {
            return Vec::new();
        };

        let mut plan: Vec<Strategy> = capable
            .into_iter()
            .map(|agent| Strategy {
                agent,
                units: task.resources,
            })
            .collect();
        plan.extend(primary.alternatives(task).into_iter().map(|units| Strategy {
            agent: primary.clone(),
            units,
        }));

        plan.truncate(1 + self.config.max_alternatives);
        plan
    }

    async fn approve(
        &self,
        task: &TaskRequest,
        strategy: &Strategy,
        snapshot: &ContextSnapshot,
        use_cached_schema: bool,
        timeout_ms: u64,
    ) -> (ControlSignal, Option<ResourcePermit>) {
        let name = strategy.agent.name();
        let breaker_open = match self.breaker(name) {
            Some(b) => !b.allow().await,
            None => false,
        };

        let (permit, reason) = if breaker_open {
            (None, Some(format!("circuit open for agent '{}'", name)))
        } else {
            match self.gate.try_acquire(strategy.units) {
                Some(permit) => (Some(permit), None),
                None => (
                    None,
                    Some(format!(
                        "resource ceiling: {} units requested, {} of {} in use",
                        strategy.units,
                        self.gate.in_use(),
                        self.gate.ceiling()
                    )),
                ),
            }
        };

        let signal = ControlSignal {
            approved: permit.is_some(),
            reason,
            agent: name.to_string(),
            constraints: Constraints {
                resource_units: strategy.units,
                timeout_ms,
                max_retries: self.config.max_retries,
            },
            context_snapshot: snapshot.clone(),
            use_cached_schema,
            task: task.clone(),
        };
        (signal, permit)
    }

    /// Append a settled result to the task's context; never fails the task
    async fn remember(&self, task: &TaskRequest, execution: &Execution) {
        let Ok((outcome, data)) = &execution.result else {
            return;
        };
        let entry = json!({
            "task_id": task.task_id,
            "outcome": outcome,
            "agent": execution.agent,
            "data": data,
            "recorded_at": chrono::Utc::now().to_rfc3339(),
        });

        if let Err(e) = self
            .memory
            .append(
                task.context_key(),
                entry,
                Some(execution.schema.clone()),
                self.config.history_limit,
            )
            .await
        {
            self.metrics.memory_faults.inc();
            warn!("Failed to record result of {} in memory: {}", task.task_id, e);
        }
    }

    async fn finalize(&self, report: CompletionReport) -> CompletionReport {
        match &report.error {
            None => info!(
                "Task {} {} in {} ms",
                report.task_id,
                report.outcome.as_str(),
                report.duration_ms
            ),
            Some(err) => warn!(
                "Task {} {} ({}): {}",
                report.task_id,
                report.outcome.as_str(),
                err.kind,
                err.message
            ),
        }
        self.audit.append(report.clone());
        self.metrics.record_report(&report).await;
        report
    }

    pub async fn status(&self) -> ControllerStatus {
        let memory = match self.memory.probe().await {
            Ok(()) => ComponentStatus {
                name: self.memory.backend().to_string(),
                healthy: true,
                detail: None,
            },
            Err(e) => ComponentStatus {
                name: self.memory.backend().to_string(),
                healthy: false,
                detail: Some(e.to_string()),
            },
        };

        let agents: Vec<Arc<Agent>> = self.agents.read().clone();
        let mut agent_status = Vec::with_capacity(agents.len());
        for agent in &agents {
            let circuit = match self.breaker(agent.name()) {
                Some(b) => b.state().await,
                None => CircuitState::Closed,
            };
            agent_status.push(AgentStatus {
                name: agent.name().to_string(),
                capabilities: agent.capabilities().map(str::to_string).collect(),
                circuit,
                environment: agent.environment().stats(),
            });
        }

        let healthy = memory.healthy && agent_status.iter().all(|a| a.circuit != CircuitState::Open);

        ControllerStatus {
            status: if healthy { "ok" } else { "degraded" },
            uptime_secs: self.started.elapsed().as_secs(),
            controller: ComponentStatus {
                name: "meta_controller".into(),
                healthy: true,
                detail: None,
            },
            memory,
            agents: agent_status,
            resources: ResourceStatus {
                ceiling: self.gate.ceiling(),
                in_use: self.gate.in_use(),
                peak: self.gate.peak(),
            },
            tasks_in_flight: self.in_flight.lock().len(),
            audit_entries: self.audit.len(),
        }
    }

    /// Prometheus text for every controller metric plus per-agent circuit state
    pub async fn render_metrics(&self) -> String {
        let agents: Vec<Arc<Agent>> = self.agents.read().clone();

        // Agents may share one environment; count each once
        let mut seen: Vec<&Arc<crate::environment::Environment>> = Vec::new();
        let mut deduplicated = 0;
        for agent in &agents {
            let env = agent.environment();
            if !seen.iter().any(|s| Arc::ptr_eq(s, env)) {
                deduplicated += env.stats().deduplicated;
                seen.push(env);
            }
        }
        self.metrics.deduplicated_actions.set(deduplicated);

        let mut output = self.metrics.render().await;
        output.push_str("\n# HELP archmerge_circuit_state Circuit state per agent (0=closed, 1=open, 2=half-open)\n");
        output.push_str("# TYPE archmerge_circuit_state gauge\n");
        for agent in &agents {
            let state = match self.breaker(agent.name()) {
                Some(b) => b.state().await,
                None => CircuitState::Closed,
            };
            output.push_str(&format!(
                "archmerge_circuit_state{{agent=\"{}\"}} {}\n",
                agent.name(),
                state.as_gauge()
            ));
        }
        output
    }
}
