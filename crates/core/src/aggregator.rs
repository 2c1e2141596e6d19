//! Multiplexing ephemeral queries behind one dispatcher registration.
//!
//! Workloads that poll many keys keep hundreds or thousands of
//! short-lived, non-persistent queries outstanding at once. Giving each
//! of them its own dispatcher registration is the obvious structure,
//! but the population churns constantly; the [QueryAggregator] instead
//! holds a single catch-all registration and routes to members through
//! its own identifier index, O(1) per message.
//!
//! A member query is only ever reachable through the aggregator: on
//! acceptance its direct dispatcher registration is removed, so exactly
//! one routing path exists per query at any time.

use crate::dispatcher::MessageDispatcher;
use crate::query::TransferQuery;
use fcplink_api::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug)]
struct Member {
    query: Arc<TransferQuery>,
    listener_token: u64,
}

/// Multiplexes a population of non-persistent queries behind a single
/// catch-all registration with the dispatcher.
#[derive(Debug)]
pub struct QueryAggregator {
    dispatcher: Arc<MessageDispatcher>,
    index: Mutex<HashMap<QueryId, Member>>,
    listeners: Mutex<Vec<(u64, DynQueryListener)>>,
    next_listener: AtomicU64,
    registration: Mutex<Option<u64>>,
}

impl QueryAggregator {
    /// Construct an aggregator and register it as a catch-all with the
    /// dispatcher. Call [QueryAggregator::shutdown] when done with it;
    /// the dispatcher holds it alive until then.
    pub fn create(dispatcher: Arc<MessageDispatcher>) -> Arc<Self> {
        let out = Arc::new(Self {
            dispatcher: dispatcher.clone(),
            index: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            registration: Mutex::new(None),
        });
        let token = dispatcher.register_catch_all(out.clone());
        *out.registration.lock().unwrap() = Some(token);
        out
    }

    /// Stop all members and drop the dispatcher registration.
    pub async fn shutdown(self: &Arc<Self>) {
        self.stop_all().await;
        if let Some(token) = self.registration.lock().unwrap().take() {
            self.dispatcher.unregister_catch_all(token);
        }
    }

    /// How many queries are currently indexed.
    pub fn len(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    /// Whether no queries are currently indexed.
    pub fn is_empty(&self) -> bool {
        self.index.lock().unwrap().is_empty()
    }

    /// Whether the given identifier is indexed here.
    pub fn contains(&self, id: &QueryId) -> bool {
        self.index.lock().unwrap().contains_key(id)
    }

    /// Start a query and take ownership of its event routing.
    ///
    /// Persistent queries are refused: they must outlive any
    /// aggregator, so they are always individually registered. The
    /// refusal is a contract violation by the caller and is logged as
    /// an error, never silently tolerated.
    pub async fn start(self: &Arc<Self>, query: Arc<TransferQuery>) -> bool {
        if query.is_persistent() {
            tracing::error!(
                id = %query.identifier(),
                "{}",
                FcpError::contract(
                    "persistent queries must be individually registered, \
                     not aggregated"
                )
            );
            return false;
        }

        if !query.start().await {
            return false;
        }

        let watch: DynQueryListener = Arc::new(MemberWatch {
            aggregator: Arc::downgrade(self),
        });
        let listener_token = query.add_listener(watch);
        let id = query.identifier();
        self.index.lock().unwrap().insert(
            id.clone(),
            Member {
                query: query.clone(),
                listener_token,
            },
        );
        // from here on the aggregator is the only routing path
        self.dispatcher.unregister_handler(&id);

        // the node may already have answered on the reader task before
        // our watch was attached
        if query.is_finished() {
            self.on_member_finished(&*query);
        }
        true
    }

    /// Stop a member query. The aggregator detaches its own watch
    /// before stopping, so the stop transition is not re-broadcast; a
    /// failed stop re-indexes the entry rather than orphaning it.
    pub async fn stop(self: &Arc<Self>, query: &Arc<TransferQuery>) -> bool {
        let id = query.identifier();
        let member = self.index.lock().unwrap().remove(&id);
        if let Some(member) = member.as_ref() {
            query.remove_listener(member.listener_token);
        }

        if query.is_finished() {
            return true;
        }
        if query.stop().await {
            return true;
        }

        if let Some(member) = member {
            let watch: DynQueryListener = Arc::new(MemberWatch {
                aggregator: Arc::downgrade(self),
            });
            let listener_token = query.add_listener(watch);
            self.index.lock().unwrap().insert(
                id,
                Member {
                    query: member.query,
                    listener_token,
                },
            );
        }
        false
    }

    /// Stop every member. Operates on a snapshot of the index so member
    /// removal during iteration is safe.
    pub async fn stop_all(self: &Arc<Self>) {
        let snapshot: Vec<Arc<TransferQuery>> = self
            .index
            .lock()
            .unwrap()
            .values()
            .map(|m| m.query.clone())
            .collect();
        for query in snapshot {
            self.stop(&query).await;
        }
    }

    /// Register an observer of member completions. Returns a token for
    /// removal.
    pub fn add_listener(&self, listener: DynQueryListener) -> u64 {
        let token = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().push((token, listener));
        token
    }

    /// Remove a listener registration.
    pub fn remove_listener(&self, token: u64) {
        self.listeners.lock().unwrap().retain(|(t, _)| *t != token);
    }

    /// A member reached a terminal state: drop it from the index and
    /// re-broadcast the event to the aggregator's own listeners, so a
    /// higher layer sees completions without watching every member.
    fn on_member_finished(&self, query: &dyn Query) {
        let removed = self.index.lock().unwrap().remove(&query.identifier());
        let member = match removed {
            Some(member) => member,
            None => return,
        };
        member.query.remove_listener(member.listener_token);
        let listeners: Vec<DynQueryListener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener.query_state_changed(query);
        }
    }
}

impl BaseHandler for QueryAggregator {}

impl MessageHandler for QueryAggregator {
    fn recv_message(&self, message: NodeMessage) -> BoxFut<'_, bool> {
        Box::pin(async move {
            let target = message.identifier().and_then(|id| {
                self.index
                    .lock()
                    .unwrap()
                    .get(&QueryId::from(id))
                    .map(|m| m.query.clone())
            });
            match target {
                Some(query) => {
                    query.recv_message(message).await;
                    true
                }
                // not ours: no notification, let the dispatcher offer
                // the message elsewhere
                None => false,
            }
        })
    }
}

#[derive(Debug)]
struct MemberWatch {
    aggregator: Weak<QueryAggregator>,
}

impl QueryListener for MemberWatch {
    fn query_state_changed(&self, query: &dyn Query) {
        if !query.is_finished() {
            return;
        }
        if let Some(aggregator) = self.aggregator.upgrade() {
            aggregator.on_member_finished(query);
        }
    }
}
