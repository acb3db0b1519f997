//! Central funnel for caught failures
//!
//! Every swallowed error in the system — a failed action body, a task body
//! that threw, an initializer that could not start — passes through here so
//! operators get one consistent log shape and one exception counter.

use crate::action::ActionError;
use crate::metrics;
use crate::task::TaskError;

/// Report a failed startup step
pub fn report_initializer(name: &str, err: &crate::error::Error) {
    metrics::record_exception("initializer");
    tracing::error!(initializer = name, error = %err, "initializer failed");
}

/// Report an action body failure
pub fn report_action(action: &str, connection_id: &str, err: &ActionError) {
    metrics::record_exception("action");
    tracing::error!(
        action,
        connection_id,
        error = %err,
        "action raised an exception"
    );
}

/// Report a task body failure
pub fn report_task(task: &str, id: &str, err: &TaskError) {
    metrics::record_exception("task");
    tracing::error!(
        task,
        id,
        error = %err,
        recoverable = err.is_recoverable(),
        "task raised an exception"
    );
}

/// Report a payload that could not be deserialized and was dropped
pub fn report_poison(id: &str, reason: &str) {
    metrics::record_exception("poison");
    tracing::error!(id, reason, "dropped undeserializable task payload");
}
