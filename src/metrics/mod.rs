//! Prometheus metrics for the action pipeline and task workers
//!
//! Call `init_metrics()` once at application startup to register all
//! metrics. If initialization never happens (unit tests, embedded use),
//! every recording function is a no-op.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for action-pipeline metrics
struct ActionMetrics {
    executed: CounterVec,
    duration: HistogramVec,
    pending: Gauge,
    http_requests: CounterVec,
}

/// Container for task-system metrics
struct TaskMetrics {
    executed: CounterVec,
    duration: HistogramVec,
    queue_depth: GaugeVec,
    recovered: Counter,
    exceptions: CounterVec,
}

static ACTION_METRICS: OnceLock<ActionMetrics> = OnceLock::new();
static TASK_METRICS: OnceLock<TaskMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Should be called once at application startup. If registration fails,
/// the error is returned and subsequent metric operations become no-ops;
/// the application can continue without metrics.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let actions = ActionMetrics {
        executed: register_counter_vec!(
            "madang_actions_executed_total",
            "Total actions executed by name and completion status",
            &["action", "status"]
        )?,
        duration: register_histogram_vec!(
            "madang_action_duration_seconds",
            "Action execution duration in seconds",
            &["action"],
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
        )?,
        pending: register_gauge!(
            "madang_actions_pending",
            "Actions currently executing across all connections"
        )?,
        http_requests: register_counter_vec!(
            "madang_http_requests_total",
            "Total HTTP requests by response status",
            &["status"]
        )?,
    };

    let tasks = TaskMetrics {
        executed: register_counter_vec!(
            "madang_tasks_executed_total",
            "Total task executions by name and outcome",
            &["task", "outcome"]
        )?,
        duration: register_histogram_vec!(
            "madang_task_duration_seconds",
            "Task execution duration in seconds",
            &["task"],
            vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
        )?,
        queue_depth: register_gauge_vec!(
            "madang_task_queue_depth",
            "Current depth of each task queue",
            &["queue"]
        )?,
        recovered: register_counter!(
            "madang_tasks_recovered_total",
            "Tasks drained from the processing queue back to global at boot"
        )?,
        exceptions: register_counter_vec!(
            "madang_exceptions_total",
            "Exceptions reported by source (action, task, initializer)",
            &["source"]
        )?,
    };

    ACTION_METRICS
        .set(actions)
        .map_err(|_| "Action metrics already initialized")?;
    TASK_METRICS
        .set(tasks)
        .map_err(|_| "Task metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    ACTION_METRICS.get().is_some() && TASK_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a completed action with its final status and duration
pub fn record_action(action: &str, status: &str, duration_secs: f64) {
    let Some(m) = ACTION_METRICS.get() else {
        return;
    };
    m.executed.with_label_values(&[action, status]).inc();
    m.duration
        .with_label_values(&[action])
        .observe(duration_secs);
}

/// One more action in flight; paired with [`dec_pending_actions`] by the
/// completion funnel
pub fn inc_pending_actions() {
    if let Some(m) = ACTION_METRICS.get() {
        m.pending.inc();
    }
}

/// One action settled
pub fn dec_pending_actions() {
    if let Some(m) = ACTION_METRICS.get() {
        m.pending.dec();
    }
}

/// Record an HTTP response by status code
pub fn record_http_request(status: u16) {
    if let Some(m) = ACTION_METRICS.get() {
        m.http_requests
            .with_label_values(&[&status.to_string()])
            .inc();
    }
}

/// Record a task execution outcome ("success", "error", "dropped")
pub fn record_task(task: &str, outcome: &str, duration_secs: f64) {
    let Some(m) = TASK_METRICS.get() else {
        return;
    };
    m.executed.with_label_values(&[task, outcome]).inc();
    m.duration.with_label_values(&[task]).observe(duration_secs);
}

/// Update queue depth gauges from a stats snapshot
pub fn set_queue_depth(queue: &str, depth: u64) {
    if let Some(m) = TASK_METRICS.get() {
        m.queue_depth.with_label_values(&[queue]).set(depth as f64);
    }
}

/// Record crash-recovered tasks
pub fn record_tasks_recovered(count: usize) {
    if let Some(m) = TASK_METRICS.get() {
        m.recovered.inc_by(count as f64);
    }
}

/// Record a reported exception by source
pub fn record_exception(source: &str) {
    if let Some(m) = TASK_METRICS.get() {
        m.exceptions.with_label_values(&[source]).inc();
    }
}
