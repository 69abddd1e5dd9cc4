//! Agents
//!
//! An agent executes approved tasks against the environment and owns the
//! retry policy for its actions. Circuit breakers live here too, although
//! the controller is the one that consults them.

pub mod executor;
pub mod recovery;

pub use executor::{Agent, Attempts, Execution};
pub use recovery::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy};
