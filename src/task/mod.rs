//! Background tasks: definitions, payloads, queues, and workers
//!
//! A [`Task`] is a named unit of background work, optionally recurring on a
//! fixed frequency. Enqueued instances travel between the named queues
//! managed by [`queues::TaskQueues`]; [`worker::TaskWorker`] pulls, locks,
//! executes, and re-enqueues periodic instances.

pub mod error;
pub mod queues;
pub mod worker;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::action::InputSpec;
use crate::connection::JsonMap;

pub use error::{TaskError, TaskResult};
pub use queues::TaskQueues;
pub use worker::{TaskWorker, TickOutcome};

// ============================================================================
// Scope and State
// ============================================================================

/// Governs how many outstanding instances a periodic task may have.
///
/// `Node` (the default) permits one outstanding instance per node's local
/// queue; `Any` permits at most one cluster-wide, running on whichever node
/// claims it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskScope {
    #[default]
    Node,
    Any,
}

/// Where an enqueued instance currently sits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Delayed,
    Processing,
}

// ============================================================================
// Task Definitions
// ============================================================================

/// A schedulable unit of background work
#[async_trait]
pub trait Task: Send + Sync {
    /// Unique key into the task registry
    fn name(&self) -> &str;

    /// Human description for status surfaces
    fn description(&self) -> &str {
        ""
    }

    /// Default queue for enqueued instances
    fn queue(&self) -> &str {
        "global"
    }

    /// Recurrence interval; zero means non-recurring
    fn frequency(&self) -> Duration {
        Duration::ZERO
    }

    /// Outstanding-instance scope for periodic runs
    fn scope(&self) -> TaskScope {
        TaskScope::Node
    }

    /// Re-schedule a periodic instance even when its body failed
    fn re_enqueue_on_error(&self) -> bool {
        true
    }

    /// Declared inputs for enqueued args (validated with the action machinery)
    fn inputs(&self) -> HashMap<String, InputSpec> {
        HashMap::new()
    }

    /// Whether this definition recurs
    fn periodic(&self) -> bool {
        self.frequency() > Duration::ZERO
    }

    /// The task body
    async fn run(&self, args: &JsonMap) -> Result<Value, TaskError>;
}

// ============================================================================
// Task Payloads
// ============================================================================

/// One enqueued instance — what is actually serialized into the queue store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Unique per enqueue
    pub id: String,

    /// Definition name
    pub name: String,

    /// Derived from `frequency > 0` at creation
    pub periodic: bool,

    /// Earliest execution time, epoch milliseconds
    pub run_at: Option<i64>,

    /// Current queue state
    pub state: TaskState,

    /// Current queue name
    pub queue: String,

    /// True for copies fanned out to other nodes' local queues
    pub is_duplicate: bool,

    /// Whether this instance has executed before (reset on re-enqueue)
    #[serde(default)]
    pub ran: bool,

    /// Arguments passed to the task body
    #[serde(default)]
    pub args: JsonMap,

    /// When this instance was enqueued, epoch milliseconds
    pub enqueued_at: i64,

    /// Identity of the worker that claimed it, once processing
    #[serde(default)]
    pub worker: Option<String>,
}

impl TaskPayload {
    /// Build a fresh instance from a definition
    pub fn from_definition(def: &dyn Task, args: JsonMap) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: def.name().to_string(),
            periodic: def.periodic(),
            run_at: None,
            state: TaskState::Pending,
            queue: def.queue().to_string(),
            is_duplicate: false,
            ran: false,
            args,
            enqueued_at: now_ms(),
            worker: None,
        }
    }

    /// Clone this instance for fan-out to another node's local queue.
    ///
    /// The copy gets a fresh id so dedup logic never collides with the
    /// canonical original, and is marked a duplicate so it is never
    /// self-re-enqueued.
    pub fn duplicate(&self) -> Self {
        let mut copy = self.clone();
        copy.id = uuid::Uuid::new_v4().to_string();
        copy.is_duplicate = true;
        copy
    }
}

/// Current time in epoch milliseconds, the clock every queue decision uses
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    #[async_trait]
    impl Task for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        fn frequency(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn run(&self, _args: &JsonMap) -> Result<Value, TaskError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_payload_from_definition() {
        let payload = TaskPayload::from_definition(&Probe, JsonMap::new());
        assert_eq!(payload.name, "probe");
        assert!(payload.periodic);
        assert!(!payload.is_duplicate);
        assert_eq!(payload.state, TaskState::Pending);
    }

    #[test]
    fn test_duplicate_gets_fresh_id() {
        let payload = TaskPayload::from_definition(&Probe, JsonMap::new());
        let copy = payload.duplicate();
        assert_ne!(copy.id, payload.id);
        assert!(copy.is_duplicate);
        assert_eq!(copy.name, payload.name);
    }

    #[test]
    fn test_scope_default_is_node() {
        assert_eq!(Probe.scope(), TaskScope::Node);
    }
}
