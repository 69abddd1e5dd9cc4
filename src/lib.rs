//! ArchMerge
//!
//! Orchestration core for integrating heterogeneous agent modules behind one
//! canonical task protocol.
//!
//! # Features
//!
//! - **Adapters**: Native module shapes ⇄ canonical envelopes
//! - **Meta-Controller**: Approval, resource ceiling, circuit breakers, audit log
//! - **Agents**: Capability checks, retries with exponential backoff
//! - **Environment**: Idempotent side effects (SHA256 keys, Moka ledger)
//! - **Memory**: Context records with backup recovery (in-memory or SQLite)
//! - **Metrics**: Prometheus text exposition
//!
//! # Architecture
//!
//! ```text
//! caller ──► HTTP API ──► MetaController ──► Memory (context)
//!                              │
//!                              ├── approve (breaker + resource gate)
//!                              ▼
//!                            Agent ──► Environment ──► ActionHandler
//!                              │
//!                              ▼
//!                    Memory (store) ──► Audit log
//! ```

pub mod adapter;
pub mod agent;
pub mod config;
pub mod controller;
pub mod environment;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod server;
pub mod types;

pub use adapter::{LegacyAdapter, ModuleAdapter};
pub use agent::{Agent, CircuitBreaker, CircuitState, RetryPolicy};
pub use config::Config;
pub use controller::{AuditLog, MetaController, ResourceGate};
pub use environment::{ActionHandler, Environment, LegacyModule, ScriptedHandler};
pub use error::{AdapterError, ErrorKind, MemoryError, TaskError};
pub use memory::{ContextStore, InMemoryStore, SqliteStore};
pub use metrics::ControllerMetrics;
pub use server::Server;
pub use types::{
    ActionCommand, CompletionReport, ContextRecord, ControlSignal, Observation, ObservationStatus,
    Outcome, TaskRequest,
};
