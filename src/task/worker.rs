//! Worker loop: claim, lock, execute, re-enqueue
//!
//! Each worker polls on a fixed interval, servicing queues in priority
//! order: the node's local queue first, then global, then delayed. Ticks
//! never overlap within one worker; a cluster gets its parallelism from
//! running many workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::queues::{TaskQueues, DELAYED_QUEUE, GLOBAL_QUEUE, PROCESSING_QUEUE};
use super::{now_ms, Task, TaskPayload, TaskResult, TaskScope, TaskState};
use crate::config::TaskConfig;
use crate::exception;
use crate::metrics;
use crate::registry::ApiRegistry;

/// What one tick accomplished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Ran an instance from this node's local queue
    RanLocal { name: String },
    /// Claimed and ran an instance from the global queue
    ClaimedGlobal { name: String },
    /// Moved a due delayed instance into the global queue
    PromotedDelayed { name: String },
    /// Re-inserted a not-yet-due delayed instance at the tail
    RequeuedDelayed,
    /// A live lock holder elsewhere; the instance went back to its queue
    LockBusy { name: String },
    /// Dropped an instance (unknown definition or poison payload)
    Dropped { id: String },
    /// Nothing to do
    Idle,
}

/// One polling worker attached to a queue set and a registry
pub struct TaskWorker {
    queues: Arc<TaskQueues>,
    registry: Arc<ApiRegistry>,
    config: TaskConfig,
    worker_id: String,
    running: AtomicBool,
    ticking: AtomicBool,
}

impl TaskWorker {
    pub fn new(queues: Arc<TaskQueues>, registry: Arc<ApiRegistry>, config: TaskConfig) -> Self {
        let worker_id = format!("{}:{}", queues.node_id(), uuid::Uuid::new_v4());
        Self {
            queues,
            registry,
            config,
            worker_id,
            running: AtomicBool::new(false),
            ticking: AtomicBool::new(false),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Start the polling loop. Returns the join handle; call
    /// [`TaskWorker::stop`] to let the loop wind down.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let worker = Arc::clone(self);
        let interval = worker.config.tick_interval();
        tokio::spawn(async move {
            tracing::info!(worker = %worker.worker_id, "task worker started");
            while worker.running.load(Ordering::SeqCst) {
                // Drain everything currently actionable, then sleep
                loop {
                    match worker.tick().await {
                        Ok(TickOutcome::Idle) | Ok(TickOutcome::RequeuedDelayed) => break,
                        Ok(_) => continue,
                        Err(err) => {
                            tracing::error!(worker = %worker.worker_id, error = %err, "tick failed");
                            break;
                        }
                    }
                }
                worker.publish_queue_depths().await;
                tokio::time::sleep(interval).await;
            }
            tracing::info!(worker = %worker.worker_id, "task worker stopped");
        })
    }

    /// Signal the polling loop to exit after its current tick
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Service the queues once, in priority order: local, global, delayed.
    ///
    /// Re-entrant calls while a tick is in flight return `Idle` rather than
    /// overlapping.
    pub async fn tick(&self) -> TaskResult<TickOutcome> {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(TickOutcome::Idle);
        }
        let outcome = self.tick_inner().await;
        self.ticking.store(false, Ordering::SeqCst);
        outcome
    }

    async fn tick_inner(&self) -> TaskResult<TickOutcome> {
        let local_queue = format!("local:{}", self.queues.node_id());
        if let Some(id) = self.queues.pop(&local_queue).await? {
            return self.claim(&local_queue, id, false).await;
        }

        if let Some(id) = self.queues.pop(GLOBAL_QUEUE).await? {
            return self.claim(GLOBAL_QUEUE, id, true).await;
        }

        if let Some(id) = self.queues.pop(DELAYED_QUEUE).await? {
            return self.service_delayed(id).await;
        }

        Ok(TickOutcome::Idle)
    }

    /// Inspect the head of the delayed queue: promote if due, otherwise
    /// re-insert at the tail so the rest of the queue gets inspected on
    /// subsequent ticks.
    async fn service_delayed(&self, id: String) -> TaskResult<TickOutcome> {
        let mut payload = match self.queues.load_payload(&id).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                tracing::warn!(id = %id, "delayed id without data entry dropped");
                return Ok(TickOutcome::Dropped { id });
            }
            Err(err) => {
                exception::report_poison(&id, &err.to_string());
                self.queues.delete_payload(&id).await?;
                return Ok(TickOutcome::Dropped { id });
            }
        };

        if matches!(payload.run_at, Some(at) if at > now_ms()) {
            self.queues.push(DELAYED_QUEUE, &id).await?;
            return Ok(TickOutcome::RequeuedDelayed);
        }

        payload.state = TaskState::Pending;
        payload.queue = GLOBAL_QUEUE.to_string();
        self.queues.save_payload(&payload).await?;
        self.queues.push(GLOBAL_QUEUE, &id).await?;
        tracing::debug!(task = %payload.name, id = %id, "delayed task promoted");
        Ok(TickOutcome::PromotedDelayed { name: payload.name })
    }

    /// Take ownership of a popped id and run it
    async fn claim(&self, source_queue: &str, id: String, from_global: bool) -> TaskResult<TickOutcome> {
        let mut payload = match self.queues.load_payload(&id).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                tracing::warn!(id = %id, queue = source_queue, "queued id without data entry dropped");
                return Ok(TickOutcome::Dropped { id });
            }
            Err(err) => {
                exception::report_poison(&id, &err.to_string());
                self.queues.delete_payload(&id).await?;
                return Ok(TickOutcome::Dropped { id });
            }
        };

        let Some(def) = self.registry.task(&payload.name) else {
            tracing::error!(task = %payload.name, id = %id, "no definition registered, dropping");
            self.queues.delete_payload(&id).await?;
            return Ok(TickOutcome::Dropped { id });
        };

        // Periodic bodies run under the cooperative lock
        let mut locked = false;
        if payload.periodic {
            if self
                .queues
                .acquire_lock(&payload.name, &self.worker_id, self.config.lock_ttl_secs)
                .await?
            {
                locked = true;
            } else {
                // Someone else holds it: put the instance back at the tail
                self.queues.push(source_queue, &id).await?;
                return Ok(TickOutcome::LockBusy { name: payload.name });
            }
        }

        // A node-scoped claim from global fans copies out to every other
        // node. This must not happen before the lock is held: a lock-busy
        // retry would fan out the same instance again each tick.
        if from_global && def.scope() == TaskScope::Node && !payload.is_duplicate {
            let copies = self.queues.fan_out(&payload).await?;
            if copies > 0 {
                tracing::debug!(task = %payload.name, copies, "fanned out to peer nodes");
            }
        }

        payload.state = TaskState::Processing;
        payload.worker = Some(self.worker_id.clone());
        self.queues.save_payload(&payload).await?;
        self.queues.push(PROCESSING_QUEUE, &id).await?;

        let result = self.execute(&def, &mut payload).await;

        if locked {
            self.queues
                .release_lock(&payload.name, &self.worker_id)
                .await?;
        }
        result?;

        let name = payload.name;
        Ok(if from_global {
            TickOutcome::ClaimedGlobal { name }
        } else {
            TickOutcome::RanLocal { name }
        })
    }

    /// Run a claimed instance and settle its afterlife
    async fn execute(&self, def: &Arc<dyn Task>, payload: &mut TaskPayload) -> TaskResult<()> {
        let started = Instant::now();
        let outcome = def.run(&payload.args).await;
        let elapsed = started.elapsed().as_secs_f64();

        let succeeded = match &outcome {
            Ok(_) => {
                metrics::record_task(&payload.name, "success", elapsed);
                tracing::debug!(task = %payload.name, id = %payload.id, elapsed, "task completed");
                true
            }
            Err(err) => {
                metrics::record_task(&payload.name, "error", elapsed);
                exception::report_task(&payload.name, &payload.id, err);
                false
            }
        };

        // Settlement order matters: the data entry must be gone before the
        // next periodic enqueue runs its dedup check.
        self.queues.remove(PROCESSING_QUEUE, &payload.id).await?;
        self.queues.delete_payload(&payload.id).await?;

        let should_re_enqueue = payload.periodic
            && !payload.is_duplicate
            && (succeeded
                || (def.re_enqueue_on_error() && self.config.re_enqueue_periodic_on_exception));
        if should_re_enqueue {
            payload.ran = true;
            self.queues.enqueue(def, payload, None).await?;
        }

        Ok(())
    }

    async fn publish_queue_depths(&self) {
        if let Ok(stats) = self.queues.stats().await {
            metrics::set_queue_depth("global", stats.global);
            metrics::set_queue_depth("delayed", stats.delayed);
            metrics::set_queue_depth("processing", stats.processing);
            metrics::set_queue_depth("local", stats.local);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::JsonMap;
    use crate::registry::RegistryBuilder;
    use crate::store::MemoryStore;
    use crate::task::TaskError;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingTask {
        name: &'static str,
        frequency: Duration,
        scope: TaskScope,
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Task for CountingTask {
        fn name(&self) -> &str {
            self.name
        }

        fn frequency(&self) -> Duration {
            self.frequency
        }

        fn scope(&self) -> TaskScope {
            self.scope
        }

        async fn run(&self, _args: &JsonMap) -> Result<Value, TaskError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(TaskError::execution(self.name, "boom"))
            } else {
                Ok(Value::Null)
            }
        }
    }

    fn harness(task: CountingTask) -> (Arc<TaskQueues>, Arc<TaskWorker>, Arc<dyn Task>) {
        let def: Arc<dyn Task> = Arc::new(task);
        let registry = Arc::new(
            RegistryBuilder::new()
                .register_task(Arc::clone(&def))
                .build()
                .unwrap(),
        );
        let queues = Arc::new(TaskQueues::new(
            Arc::new(MemoryStore::new()),
            "test",
            "node-a",
        ));
        let worker = Arc::new(TaskWorker::new(
            Arc::clone(&queues),
            registry,
            TaskConfig::default(),
        ));
        (queues, worker, def)
    }

    #[tokio::test]
    async fn test_one_shot_task_runs_and_clears() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (queues, worker, def) = harness(CountingTask {
            name: "send_email",
            frequency: Duration::ZERO,
            scope: TaskScope::Node,
            runs: Arc::clone(&runs),
            fail: false,
        });

        let mut payload = TaskPayload::from_definition(def.as_ref(), JsonMap::new());
        assert!(queues.enqueue(&def, &mut payload, None).await.unwrap());

        let outcome = worker.tick().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::ClaimedGlobal {
                name: "send_email".into()
            }
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let stats = queues.stats().await.unwrap();
        assert_eq!(stats.global, 0);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.tasks, 0);

        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_periodic_task_re_enqueues_into_delayed() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (queues, worker, def) = harness(CountingTask {
            name: "cleanup",
            frequency: Duration::from_secs(300),
            scope: TaskScope::Any,
            runs: Arc::clone(&runs),
            fail: false,
        });

        // Force an immediately-due instance into global
        let mut payload = TaskPayload::from_definition(def.as_ref(), JsonMap::new());
        payload.run_at = Some(now_ms() - 1);
        assert!(queues.enqueue(&def, &mut payload, None).await.unwrap());
        assert_eq!(queues.stats().await.unwrap().global, 1);

        worker.tick().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // The completed run seeded its successor into delayed
        let stats = queues.stats().await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.global, 0);
        assert_eq!(stats.tasks, 1);
    }

    #[tokio::test]
    async fn test_failed_periodic_still_re_enqueues() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (queues, worker, def) = harness(CountingTask {
            name: "flaky",
            frequency: Duration::from_secs(60),
            scope: TaskScope::Any,
            runs: Arc::clone(&runs),
            fail: true,
        });

        let mut payload = TaskPayload::from_definition(def.as_ref(), JsonMap::new());
        payload.run_at = Some(now_ms() - 1);
        queues.enqueue(&def, &mut payload, None).await.unwrap();

        worker.tick().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(queues.stats().await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_not_due_delayed_goes_back_to_tail() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (queues, worker, def) = harness(CountingTask {
            name: "cleanup",
            frequency: Duration::from_secs(3600),
            scope: TaskScope::Any,
            runs: Arc::clone(&runs),
            fail: false,
        });

        let mut payload = TaskPayload::from_definition(def.as_ref(), JsonMap::new());
        queues.enqueue(&def, &mut payload, None).await.unwrap();
        assert_eq!(queues.stats().await.unwrap().delayed, 1);

        assert_eq!(worker.tick().await.unwrap(), TickOutcome::RequeuedDelayed);
        assert_eq!(queues.stats().await.unwrap().delayed, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_due_delayed_promotes_then_runs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (queues, worker, def) = harness(CountingTask {
            name: "report",
            frequency: Duration::ZERO,
            scope: TaskScope::Node,
            runs: Arc::clone(&runs),
            fail: false,
        });

        let mut payload = TaskPayload::from_definition(def.as_ref(), JsonMap::new());
        queues
            .enqueue_at(now_ms() - 100, &def, &mut payload)
            .await
            .unwrap();

        // run_at already elapsed, so it went straight into global
        assert_eq!(queues.stats().await.unwrap().global, 1);
        worker.tick().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_never_self_re_enqueues() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (queues, worker, def) = harness(CountingTask {
            name: "cleanup",
            frequency: Duration::from_secs(60),
            scope: TaskScope::Node,
            runs: Arc::clone(&runs),
            fail: false,
        });

        let original = TaskPayload::from_definition(def.as_ref(), JsonMap::new());
        let mut copy = original.duplicate();
        copy.queue = "local:node-a".to_string();
        queues.save_payload(&copy).await.unwrap();
        queues
            .store()
            .rpush("test:queue:local:node-a", &copy.id)
            .await
            .unwrap();

        let outcome = worker.tick().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::RanLocal {
                name: "cleanup".into()
            }
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Duplicates vanish after their run instead of rescheduling
        let stats = queues.stats().await.unwrap();
        assert_eq!(stats.tasks, 0);
        assert_eq!(stats.delayed, 0);
    }

    #[tokio::test]
    async fn test_unknown_definition_dropped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (queues, worker, def) = harness(CountingTask {
            name: "known",
            frequency: Duration::ZERO,
            scope: TaskScope::Node,
            runs,
            fail: false,
        });

        let mut payload = TaskPayload::from_definition(def.as_ref(), JsonMap::new());
        payload.name = "forgotten".to_string();
        queues.save_payload(&payload).await.unwrap();
        queues.store().rpush("test:queue:global", &payload.id).await.unwrap();

        let outcome = worker.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Dropped { id: payload.id });
        assert_eq!(queues.stats().await.unwrap().tasks, 0);
    }

    #[tokio::test]
    async fn test_lock_busy_requeues_at_tail() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (queues, worker, def) = harness(CountingTask {
            name: "cleanup",
            frequency: Duration::from_secs(60),
            scope: TaskScope::Any,
            runs: Arc::clone(&runs),
            fail: false,
        });

        // Another worker holds the lock
        assert!(queues.acquire_lock("cleanup", "elsewhere", 300).await.unwrap());

        let mut payload = TaskPayload::from_definition(def.as_ref(), JsonMap::new());
        payload.run_at = Some(now_ms() - 1);
        queues.enqueue(&def, &mut payload, None).await.unwrap();

        let outcome = worker.tick().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::LockBusy {
                name: "cleanup".into()
            }
        );
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(queues.stats().await.unwrap().global, 1);
    }

    #[tokio::test]
    async fn test_lock_busy_retries_never_fan_out() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (queues, worker, def) = harness(CountingTask {
            name: "cleanup",
            frequency: Duration::from_secs(60),
            scope: TaskScope::Node,
            runs: Arc::clone(&runs),
            fail: false,
        });
        queues.register_node().await.unwrap();
        let peer = TaskQueues::new(Arc::clone(queues.store()), "test", "node-b");
        peer.register_node().await.unwrap();

        // Another worker holds the lock
        assert!(queues.acquire_lock("cleanup", "elsewhere", 300).await.unwrap());

        let mut payload = TaskPayload::from_definition(def.as_ref(), JsonMap::new());
        payload.run_at = Some(now_ms() - 1);
        queues.enqueue(&def, &mut payload, None).await.unwrap();

        // Retrying while the lock is held must not sow copies on the peer
        for _ in 0..2 {
            assert!(matches!(
                worker.tick().await.unwrap(),
                TickOutcome::LockBusy { .. }
            ));
            assert!(queues.queued("local:node-b").await.unwrap().is_empty());
        }

        queues.release_lock("cleanup", "elsewhere").await.unwrap();
        assert!(matches!(
            worker.tick().await.unwrap(),
            TickOutcome::ClaimedGlobal { .. }
        ));

        let copies = queues.queued("local:node-b").await.unwrap();
        assert_eq!(copies.len(), 1);
        assert!(copies[0].is_duplicate);
    }

    #[tokio::test]
    async fn test_one_shot_node_claim_fans_out_to_peers() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (queues, worker, def) = harness(CountingTask {
            name: "send_email",
            frequency: Duration::ZERO,
            scope: TaskScope::Node,
            runs: Arc::clone(&runs),
            fail: false,
        });
        queues.register_node().await.unwrap();
        let peer = TaskQueues::new(Arc::clone(queues.store()), "test", "node-b");
        peer.register_node().await.unwrap();

        let mut payload = TaskPayload::from_definition(def.as_ref(), JsonMap::new());
        assert!(queues.enqueue(&def, &mut payload, None).await.unwrap());

        worker.tick().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Fan-out keys off scope, not periodicity
        let copies = queues.queued("local:node-b").await.unwrap();
        assert_eq!(copies.len(), 1);
        assert!(copies[0].is_duplicate);
        assert_eq!(copies[0].name, "send_email");
    }
}
