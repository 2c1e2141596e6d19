//! Admission control for transfer queries.
//!
//! The [QueueManager] holds the pending and running sets, partitioned
//! by direction, and enforces a per-direction concurrency bound. When a
//! running query reaches a terminal state its slot frees and the oldest
//! eligible pending query of the same direction is promoted.
//!
//! The queue never retries on its own: a retryable failure code is
//! surfaced to the owning component, which re-derives parameters (such
//! as a new revision) and resubmits a fresh query. This keeps retry
//! semantics explicit and inspectable per call site.

use crate::query::TransferQuery;
use fcplink_api::*;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

/// QueueManager configuration types.
pub mod config {
    use fcplink_api::config::ModConfig;

    /// Configuration parameters for [QueueManager](super::QueueManager).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct QueueConfig {
        /// Maximum concurrently running fetches. Unbounded when <= 0.
        /// Default: 6.
        pub max_running_fetch: i32,
        /// Maximum concurrently running inserts. Unbounded when <= 0.
        /// Default: 3.
        pub max_running_insert: i32,
    }

    impl Default for QueueConfig {
        fn default() -> Self {
            Self {
                max_running_fetch: 6,
                max_running_insert: 3,
            }
        }
    }

    /// Module-level configuration for QueueManager.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct QueueModConfig {
        /// QueueManager configuration.
        pub queue: QueueConfig,
    }

    impl ModConfig for QueueModConfig {}
}

use config::*;

#[derive(Debug, Default)]
struct DirectionQueues {
    pending: VecDeque<Arc<TransferQuery>>,
    running: Vec<Arc<TransferQuery>>,
}

#[derive(Debug, Default)]
struct QueueState {
    fetch: DirectionQueues,
    insert: DirectionQueues,
    watch_tokens: HashMap<QueryId, u64>,
}

impl QueueState {
    fn for_direction(&mut self, direction: Direction) -> &mut DirectionQueues {
        match direction {
            Direction::Fetch => &mut self.fetch,
            Direction::Insert => &mut self.insert,
        }
    }
}

/// Pending/running bookkeeping with per-direction concurrency bounds.
#[derive(Debug)]
pub struct QueueManager {
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl QueueManager {
    /// Construct a queue manager with the given bounds.
    pub fn create(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(QueueState::default()),
        })
    }

    fn bound(&self, direction: Direction) -> Option<usize> {
        let bound = match direction {
            Direction::Fetch => self.config.max_running_fetch,
            Direction::Insert => self.config.max_running_insert,
        };
        (bound > 0).then_some(bound as usize)
    }

    /// How many queries of the direction are currently running.
    pub fn running_len(&self, direction: Direction) -> usize {
        self.state.lock().unwrap().for_direction(direction).running.len()
    }

    /// How many queries of the direction are currently pending.
    pub fn pending_len(&self, direction: Direction) -> usize {
        self.state.lock().unwrap().for_direction(direction).pending.len()
    }

    /// Submit a query to wait for a concurrency slot. Started
    /// immediately when a slot is free.
    pub async fn submit_pending(
        self: &Arc<Self>,
        query: Arc<TransferQuery>,
    ) {
        if !self.watch(&query) {
            return;
        }
        let direction = query.direction();
        self.state
            .lock()
            .unwrap()
            .for_direction(direction)
            .pending
            .push_back(query);
        self.pump(direction).await;
    }

    /// Submit a query meant to run immediately, still subject to the
    /// concurrency bound: when no slot is free it takes the front of
    /// the pending queue instead.
    pub async fn submit_running(
        self: &Arc<Self>,
        query: Arc<TransferQuery>,
    ) {
        if !self.watch(&query) {
            return;
        }
        let direction = query.direction();
        self.state
            .lock()
            .unwrap()
            .for_direction(direction)
            .pending
            .push_front(query);
        self.pump(direction).await;
    }

    /// Remove a query from whichever set currently holds it. Safe to
    /// call on an already-removed query (a no-op). A freed running slot
    /// promotes the next pending query.
    pub async fn remove(self: &Arc<Self>, query: &Arc<TransferQuery>) {
        let id = query.identifier();
        let direction = query.direction();
        let token = {
            let mut state = self.state.lock().unwrap();
            let queues = state.for_direction(direction);
            queues.pending.retain(|q| q.identifier() != id);
            queues.running.retain(|q| q.identifier() != id);
            state.watch_tokens.remove(&id)
        };
        if let Some(token) = token {
            query.remove_listener(token);
        }
        self.pump(direction).await;
    }

    /// Attach the terminal watch. False when the query is already
    /// tracked (a duplicate submission, refused).
    fn watch(self: &Arc<Self>, query: &Arc<TransferQuery>) -> bool {
        let id = query.identifier();
        if self.state.lock().unwrap().watch_tokens.contains_key(&id) {
            tracing::error!(
                %id,
                "{}",
                FcpError::contract("query was already submitted to the queue")
            );
            return false;
        }
        let watch: DynQueryListener = Arc::new(TerminalWatch {
            queue: Arc::downgrade(self),
        });
        let token = query.add_listener(watch);
        self.state.lock().unwrap().watch_tokens.insert(id, token);
        true
    }

    /// Promote pending queries of the direction into free running
    /// slots, oldest first, and start them.
    async fn pump(self: &Arc<Self>, direction: Direction) {
        loop {
            let next = {
                let mut state = self.state.lock().unwrap();
                let queues = state.for_direction(direction);
                let full = self
                    .bound(direction)
                    .map(|bound| queues.running.len() >= bound)
                    .unwrap_or(false);
                if full {
                    None
                } else {
                    match queues.pending.pop_front() {
                        Some(query) => {
                            queues.running.push(query.clone());
                            Some(query)
                        }
                        None => None,
                    }
                }
            };
            let query = match next {
                Some(query) => query,
                None => break,
            };
            // a restored query may already be underway on the node
            let started = if query.state() == QueryState::Created {
                query.start().await
            } else {
                true
            };
            if !started {
                tracing::warn!(
                    id = %query.identifier(),
                    "query could not start; dropping it from the running set"
                );
                self.release(&query.identifier(), direction);
            }
        }
    }

    /// Drop the query from our sets and detach the terminal watch.
    fn release(&self, id: &QueryId, direction: Direction) {
        let (token, query) = {
            let mut state = self.state.lock().unwrap();
            let queues = state.for_direction(direction);
            let query = queues
                .running
                .iter()
                .chain(queues.pending.iter())
                .find(|q| q.identifier() == *id)
                .cloned();
            queues.pending.retain(|q| q.identifier() != *id);
            queues.running.retain(|q| q.identifier() != *id);
            (state.watch_tokens.remove(id), query)
        };
        if let (Some(token), Some(query)) = (token, query) {
            query.remove_listener(token);
        }
    }
}

#[derive(Debug)]
struct TerminalWatch {
    queue: Weak<QueueManager>,
}

impl QueryListener for TerminalWatch {
    fn query_state_changed(&self, query: &dyn Query) {
        if !query.is_finished() {
            return;
        }
        let queue = match self.queue.upgrade() {
            Some(queue) => queue,
            None => return,
        };
        let direction = query.direction();
        queue.release(&query.identifier(), direction);
        // promotion sends a start message, which is async; hop onto the
        // runtime rather than blocking the notifying task
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { queue.pump(direction).await });
            }
            Err(_) => {
                tracing::warn!(
                    ?direction,
                    "terminal event arrived outside the runtime; \
                     promotion deferred to the next queue call"
                );
            }
        }
    }
}
