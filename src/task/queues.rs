//! The named task queues and their state-transition operations
//!
//! Four queue kinds coordinate a cluster of worker processes: `global`
//! (cluster-shared intake), `delayed` (time-gated), `local:<node>` (one per
//! node), and `processing` (claimed-and-running), plus a data hash keyed by
//! task id holding full payloads, a node roster, and a lock hash for
//! periodic-job locks. All of it lives behind [`QueueStore`] — the store is
//! the only cross-node coordination channel.

use std::sync::Arc;

use super::error::{TaskError, TaskResult};
use super::{now_ms, Task, TaskPayload, TaskScope, TaskState};
use crate::registry::ApiRegistry;
use crate::store::QueueStore;

/// Name of the cluster-shared intake queue
pub const GLOBAL_QUEUE: &str = "global";

/// Name of the time-gated queue
pub const DELAYED_QUEUE: &str = "delayed";

/// Name of the claimed-and-running queue
pub const PROCESSING_QUEUE: &str = "processing";

/// Lengths of every queue, for status surfaces
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub global: u64,
    pub delayed: u64,
    pub processing: u64,
    pub local: u64,
    pub tasks: usize,
}

/// The set of named queues and the operations that move task ids between them
pub struct TaskQueues {
    store: Arc<dyn QueueStore>,
    namespace: String,
    node_id: String,
}

impl TaskQueues {
    pub fn new(store: Arc<dyn QueueStore>, namespace: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            node_id: node_id.into(),
        }
    }

    /// This node's identity within the cluster
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The underlying store handle
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    // ========================================================================
    // Keys
    // ========================================================================

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.namespace, queue)
    }

    fn local_queue_name(node: &str) -> String {
        format!("local:{node}")
    }

    /// Key of a node's local queue
    pub fn local_key(&self, node: &str) -> String {
        self.queue_key(&Self::local_queue_name(node))
    }

    fn data_key(&self) -> String {
        format!("{}:tasks", self.namespace)
    }

    fn nodes_key(&self) -> String {
        format!("{}:nodes", self.namespace)
    }

    fn locks_key(&self) -> String {
        format!("{}:locks", self.namespace)
    }

    // ========================================================================
    // Node Roster
    // ========================================================================

    /// Announce this node so other workers fan periodic work out to it
    pub async fn register_node(&self) -> TaskResult<()> {
        self.store
            .hset(&self.nodes_key(), &self.node_id, &now_ms().to_string())
            .await?;
        Ok(())
    }

    /// Remove this node from the roster
    pub async fn deregister_node(&self) -> TaskResult<()> {
        self.store.hdel(&self.nodes_key(), &self.node_id).await?;
        Ok(())
    }

    /// Every currently registered node id
    pub async fn nodes(&self) -> TaskResult<Vec<String>> {
        let roster = self.store.hgetall(&self.nodes_key()).await?;
        let mut nodes: Vec<String> = roster.into_keys().collect();
        nodes.sort();
        Ok(nodes)
    }

    // ========================================================================
    // Payload Data
    // ========================================================================

    /// Persist a payload into the data hash
    pub async fn save_payload(&self, payload: &TaskPayload) -> TaskResult<()> {
        let encoded = serde_json::to_string(payload)?;
        self.store.hset(&self.data_key(), &payload.id, &encoded).await?;
        Ok(())
    }

    /// Load one payload by id
    pub async fn load_payload(&self, id: &str) -> TaskResult<Option<TaskPayload>> {
        match self.store.hget(&self.data_key(), id).await? {
            Some(encoded) => match serde_json::from_str(&encoded) {
                Ok(payload) => Ok(Some(payload)),
                Err(err) => Err(TaskError::PayloadCorrupt {
                    id: id.to_string(),
                    reason: err.to_string(),
                }),
            },
            None => Ok(None),
        }
    }

    /// Remove one payload from the data hash
    pub async fn delete_payload(&self, id: &str) -> TaskResult<bool> {
        Ok(self.store.hdel(&self.data_key(), id).await?)
    }

    /// Every stored payload; undeserializable entries are skipped
    pub async fn all_payloads(&self) -> TaskResult<Vec<TaskPayload>> {
        let raw = self.store.hgetall(&self.data_key()).await?;
        let mut payloads = Vec::with_capacity(raw.len());
        for encoded in raw.values() {
            if let Ok(payload) = serde_json::from_str::<TaskPayload>(encoded) {
                payloads.push(payload);
            }
        }
        Ok(payloads)
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Decide whether a (re-)enqueue of this payload is permitted.
    ///
    /// Non-periodic tasks are always enqueueable. A periodic task with scope
    /// `any` is enqueueable iff zero data entries with its name exist
    /// anywhere (cluster-wide dedup). Other scopes are enqueueable iff no
    /// entry with its name currently sits in the global or delayed queue —
    /// entries already claimed into a local or processing queue do not block
    /// a fresh seed.
    pub async fn determine_enqueability(
        &self,
        scope: TaskScope,
        payload: &TaskPayload,
    ) -> TaskResult<bool> {
        if !payload.periodic {
            return Ok(true);
        }

        match scope {
            TaskScope::Any => {
                let existing = self.all_payloads().await?;
                Ok(!existing.iter().any(|p| p.name == payload.name))
            }
            TaskScope::Node => {
                for queue in [GLOBAL_QUEUE, DELAYED_QUEUE] {
                    let ids = self.store.lrange(&self.queue_key(queue), 0, -1).await?;
                    for id in ids {
                        if let Ok(Some(existing)) = self.load_payload(&id).await {
                            if existing.name == payload.name {
                                return Ok(false);
                            }
                        }
                    }
                }
                Ok(true)
            }
        }
    }

    /// Enqueue an instance, honoring the periodicity guard.
    ///
    /// Returns `Ok(false)` — not an error — when blocked by the guard;
    /// callers must check rather than assume success. A future `run_at`, or
    /// an unset one on a periodic task, diverts the instance into the
    /// delayed queue with `run_at` computed as now + frequency.
    pub async fn enqueue(
        &self,
        def: &Arc<dyn Task>,
        payload: &mut TaskPayload,
        queue: Option<&str>,
    ) -> TaskResult<bool> {
        // Support re-use of a previously run instance
        if payload.ran {
            payload.ran = false;
            payload.run_at = None;
        }

        if !self.determine_enqueability(def.scope(), payload).await? {
            tracing::debug!(task = %payload.name, "enqueue blocked by periodicity guard");
            return Ok(false);
        }

        let now = now_ms();
        let mut target = queue.unwrap_or(&payload.queue).to_string();

        if payload.periodic && payload.run_at.is_none() {
            payload.run_at = Some(now + def.frequency().as_millis() as i64);
        }
        if matches!(payload.run_at, Some(at) if at > now) {
            target = DELAYED_QUEUE.to_string();
        }

        payload.state = if target == DELAYED_QUEUE {
            TaskState::Delayed
        } else {
            TaskState::Pending
        };
        payload.queue = target.clone();
        payload.enqueued_at = now;

        self.save_payload(payload).await?;
        self.store.rpush(&self.queue_key(&target), &payload.id).await?;

        tracing::debug!(task = %payload.name, id = %payload.id, queue = %target, "task enqueued");
        Ok(true)
    }

    /// Enqueue to run no earlier than an absolute time (epoch milliseconds)
    pub async fn enqueue_at(
        &self,
        run_at_ms: i64,
        def: &Arc<dyn Task>,
        payload: &mut TaskPayload,
    ) -> TaskResult<bool> {
        payload.run_at = Some(run_at_ms);
        self.enqueue(def, payload, None).await
    }

    /// Enqueue to run after a delay
    pub async fn enqueue_in(
        &self,
        delay: std::time::Duration,
        def: &Arc<dyn Task>,
        payload: &mut TaskPayload,
    ) -> TaskResult<bool> {
        self.enqueue_at(now_ms() + delay.as_millis() as i64, def, payload)
            .await
    }

    // ========================================================================
    // Removal and Introspection
    // ========================================================================

    /// Remove an instance from a queue and delete its data entry
    pub async fn del_task(&self, queue: &str, id: &str) -> TaskResult<bool> {
        let removed = self.store.lrem(&self.queue_key(queue), id).await?;
        self.delete_payload(id).await?;
        Ok(removed > 0)
    }

    /// Payloads currently sitting in one queue, in FIFO order
    pub async fn queued(&self, queue: &str) -> TaskResult<Vec<TaskPayload>> {
        let ids = self.store.lrange(&self.queue_key(queue), 0, -1).await?;
        let mut payloads = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(Some(payload)) = self.load_payload(&id).await {
                payloads.push(payload);
            }
        }
        Ok(payloads)
    }

    /// Payloads in the delayed queue
    pub async fn delayed_tasks(&self) -> TaskResult<Vec<TaskPayload>> {
        self.queued(DELAYED_QUEUE).await
    }

    /// Current depth of every queue
    pub async fn stats(&self) -> TaskResult<QueueStats> {
        Ok(QueueStats {
            global: self.depth(GLOBAL_QUEUE).await?,
            delayed: self.depth(DELAYED_QUEUE).await?,
            processing: self.depth(PROCESSING_QUEUE).await?,
            local: self.depth(&Self::local_queue_name(&self.node_id)).await?,
            tasks: self.store.hgetall(&self.data_key()).await?.len(),
        })
    }

    // ========================================================================
    // Recovery and Seeding
    // ========================================================================

    /// Drain the processing queue back into global.
    ///
    /// Anything still marked processing at boot must have been mid-execution
    /// when the previous process died; there is no partial-completion
    /// tracking, so it is simply re-run from scratch. Poison payloads are
    /// logged and dropped rather than retried. Returns the number of ids
    /// recovered.
    pub async fn recover_processing(&self) -> TaskResult<usize> {
        let mut recovered = 0;
        loop {
            let Some(id) = self.store.lpop(&self.queue_key(PROCESSING_QUEUE)).await? else {
                break;
            };
            match self.load_payload(&id).await {
                Ok(Some(mut payload)) => {
                    payload.state = TaskState::Pending;
                    payload.queue = GLOBAL_QUEUE.to_string();
                    payload.worker = None;
                    self.save_payload(&payload).await?;
                    self.store.rpush(&self.queue_key(GLOBAL_QUEUE), &id).await?;
                    recovered += 1;
                    tracing::warn!(task = %payload.name, id = %id, "recovered crashed task");
                }
                Ok(None) => {
                    tracing::warn!(id = %id, "dropping processing id with no data entry");
                }
                Err(err) => {
                    tracing::error!(id = %id, error = %err, "dropping poison payload");
                    self.delete_payload(&id).await?;
                }
            }
        }
        Ok(recovered)
    }

    /// Seed one fresh enqueue for every periodic definition with no
    /// outstanding instance. The periodicity guard makes this idempotent.
    pub async fn seed_periodic_tasks(&self, registry: &ApiRegistry) -> TaskResult<usize> {
        let mut seeded = 0;
        for def in registry.tasks() {
            if !def.periodic() {
                continue;
            }
            let mut payload = TaskPayload::from_definition(def.as_ref(), Default::default());
            if self.enqueue(def, &mut payload, None).await? {
                seeded += 1;
                tracing::info!(task = %def.name(), "seeded periodic task");
            }
        }
        Ok(seeded)
    }

    // ========================================================================
    // Job Locks
    // ========================================================================

    /// Take the cooperative lock for a periodic task name.
    ///
    /// Returns `false` when another live holder owns it. Expired locks are
    /// taken over.
    pub async fn acquire_lock(&self, name: &str, holder: &str, ttl_secs: u64) -> TaskResult<bool> {
        let key = self.locks_key();
        let now = now_ms();
        if let Some(existing) = self.store.hget(&key, name).await? {
            if let Some((owner, expires)) = parse_lock(&existing) {
                if owner != holder && expires > now {
                    return Ok(false);
                }
            }
        }
        let value = format!("{holder}|{}", now + (ttl_secs as i64) * 1000);
        self.store.hset(&key, name, &value).await?;
        Ok(true)
    }

    /// Release a lock if this holder still owns it
    pub async fn release_lock(&self, name: &str, holder: &str) -> TaskResult<()> {
        let key = self.locks_key();
        if let Some(existing) = self.store.hget(&key, name).await? {
            if matches!(parse_lock(&existing), Some((owner, _)) if owner == holder) {
                self.store.hdel(&key, name).await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Queue Transitions (used by workers)
    // ========================================================================

    /// Pop one id from a queue
    pub(crate) async fn pop(&self, queue: &str) -> TaskResult<Option<String>> {
        Ok(self.store.lpop(&self.queue_key(queue)).await?)
    }

    /// Push one id onto a queue
    pub(crate) async fn push(&self, queue: &str, id: &str) -> TaskResult<()> {
        self.store.rpush(&self.queue_key(queue), id).await?;
        Ok(())
    }

    /// Remove one id from a queue
    pub(crate) async fn remove(&self, queue: &str, id: &str) -> TaskResult<u64> {
        Ok(self.store.lrem(&self.queue_key(queue), id).await?)
    }

    /// Depth of one queue
    pub(crate) async fn depth(&self, queue: &str) -> TaskResult<u64> {
        Ok(self.store.llen(&self.queue_key(queue)).await?)
    }

    /// Fan duplicate copies of a claimed payload out to every other node's
    /// local queue. The claiming node keeps the canonical original.
    pub(crate) async fn fan_out(&self, payload: &TaskPayload) -> TaskResult<usize> {
        let mut copies = 0;
        for node in self.nodes().await? {
            if node == self.node_id {
                continue;
            }
            let mut copy = payload.duplicate();
            copy.queue = Self::local_queue_name(&node);
            self.save_payload(&copy).await?;
            self.store.rpush(&self.local_key(&node), &copy.id).await?;
            copies += 1;
        }
        Ok(copies)
    }
}

/// Parse a `holder|expires_ms` lock value
fn parse_lock(value: &str) -> Option<(&str, i64)> {
    let (owner, expires) = value.rsplit_once('|')?;
    Some((owner, expires.parse().ok()?))
}
