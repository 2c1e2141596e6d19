//! Inbound message parsing and routing.
//!
//! The dispatcher owns the connection's reader task: a loop of
//! [WireChannel::read_line], incremental decoding into [NodeMessage]s,
//! and synchronous delivery to exactly one registered recipient per
//! message. Delivery being synchronous with the reader task is by
//! design: it preserves per-connection message ordering, at the cost
//! that a blocking handler delays subsequent messages.
//!
//! Routing is keyed on the message's `Identifier` field. A message
//! whose identifier has a direct registration goes to that handler
//! alone; otherwise it is offered to the catch-all handlers (the query
//! aggregator, the DDA probe) until one consumes it. A message nobody
//! consumes, such as the node's hello at session start, is broadcast
//! to every registered base listener.

use crate::channel::WireChannel;
use fcplink_api::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Routes each parsed inbound message to exactly one recipient and fans
/// connection lifecycle events out to every registered party.
#[derive(Debug)]
pub struct MessageDispatcher {
    handlers: Mutex<HashMap<QueryId, DynMessageHandler>>,
    catch_all: Mutex<Vec<(u64, DynMessageHandler)>>,
    listeners: Mutex<Vec<(u64, DynBaseHandler)>>,
    next_registration: AtomicU64,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for MessageDispatcher {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl MessageDispatcher {
    /// Construct a new dispatcher with no registrations.
    pub fn create() -> Arc<Self> {
        Arc::new(Self {
            handlers: Mutex::new(HashMap::new()),
            catch_all: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            next_registration: AtomicU64::new(1),
            reader_task: Mutex::new(None),
        })
    }

    /// Register the handler that owns the given identifier.
    ///
    /// Panics if you attempt to register a duplicate handler for an
    /// identifier.
    pub fn register_handler(&self, id: QueryId, handler: DynMessageHandler) {
        if self
            .handlers
            .lock()
            .unwrap()
            .insert(id.clone(), handler)
            .is_some()
        {
            panic!("Attempted to register duplicate handler! {id}");
        }
    }

    /// Remove a direct identifier registration. Returns false when the
    /// identifier had no registration (a no-op).
    pub fn unregister_handler(&self, id: &QueryId) -> bool {
        self.handlers.lock().unwrap().remove(id).is_some()
    }

    /// Whether the identifier currently has a direct registration.
    pub fn is_registered(&self, id: &QueryId) -> bool {
        self.handlers.lock().unwrap().contains_key(id)
    }

    /// Register a catch-all handler, offered every message no direct
    /// registration consumed. Returns a token for unregistration.
    pub fn register_catch_all(&self, handler: DynMessageHandler) -> u64 {
        let token = self.next_registration.fetch_add(1, Ordering::Relaxed);
        self.catch_all.lock().unwrap().push((token, handler));
        token
    }

    /// Remove a catch-all registration.
    pub fn unregister_catch_all(&self, token: u64) {
        self.catch_all.lock().unwrap().retain(|(t, _)| *t != token);
    }

    /// Register a base listener: a recipient of connection lifecycle
    /// events and of every parsed message no handler consumed. Returns
    /// a token for unregistration.
    pub fn register_listener(&self, listener: DynBaseHandler) -> u64 {
        let token = self.next_registration.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().push((token, listener));
        token
    }

    /// Remove a lifecycle listener registration.
    pub fn unregister_listener(&self, token: u64) {
        self.listeners.lock().unwrap().retain(|(t, _)| *t != token);
    }

    /// Spawn the reader task on the given channel, replacing any
    /// previous reader. The task finishes when the connection drops.
    pub fn start(self: &Arc<Self>, channel: Arc<WireChannel>) {
        let task = tokio::task::spawn(reader_loop(self.clone(), channel));
        if let Some(prev) = self.reader_task.lock().unwrap().replace(task) {
            prev.abort();
        }
    }

    /// Route one parsed message. Normally invoked from the reader task;
    /// exposed so the routing layer can be driven without a socket.
    pub async fn dispatch(&self, message: NodeMessage) {
        if let Some(id) = message.identifier() {
            let handler =
                self.handlers.lock().unwrap().get(&QueryId::from(id)).cloned();
            if let Some(handler) = handler {
                handler.recv_message(message).await;
                return;
            }
        }
        let catch_all: Vec<DynMessageHandler> = self
            .catch_all
            .lock()
            .unwrap()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in catch_all {
            if handler.recv_message(message.clone()).await {
                return;
            }
        }
        let listeners: Vec<DynBaseHandler> =
            self.listeners.lock().unwrap().iter().map(|(_, l)| l.clone()).collect();
        if listeners.is_empty() {
            tracing::trace!(name = message.name(), "no handler consumed message");
            return;
        }
        for listener in listeners {
            listener.recv_broadcast(&message);
        }
    }

    fn all_parties(&self) -> Vec<DynBaseHandler> {
        let mut out: Vec<DynBaseHandler> = Vec::new();
        out.extend(
            self.handlers
                .lock()
                .unwrap()
                .values()
                .map(|h| h.clone() as DynBaseHandler),
        );
        out.extend(
            self.catch_all
                .lock()
                .unwrap()
                .iter()
                .map(|(_, h)| h.clone() as DynBaseHandler),
        );
        out.extend(self.listeners.lock().unwrap().iter().map(|(_, l)| l.clone()));
        out
    }
}

impl BaseHandler for MessageDispatcher {
    fn connected(&self) {
        for party in self.all_parties() {
            party.connected();
        }
    }

    fn disconnected(&self) {
        for party in self.all_parties() {
            party.disconnected();
        }
    }
}

async fn reader_loop(this: Arc<MessageDispatcher>, channel: Arc<WireChannel>) {
    let mut decoder = MessageDecoder::default();
    loop {
        match channel.read_line().await {
            Ok(Some(line)) => match decoder.feed_line(&line) {
                Ok(Some(message)) => {
                    // the raw byte count must be on record before any
                    // further read so the channel's drain invariant holds
                    if let Some(len) = message.data_length() {
                        channel.announce_raw(len);
                    }
                    this.dispatch(message).await;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(%err, "dropping malformed protocol line");
                }
            },
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(%err, "reader stopping after fatal channel error");
                break;
            }
        }
    }
    tracing::debug!("reader task finished");
}
