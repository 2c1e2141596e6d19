//! The transfer request state machine.
//!
//! A [TransferQuery] represents one outstanding fetch or insert. It is
//! its own event sink: the same object registered with the dispatcher
//! (directly, or reachable through the aggregator) consumes the routed
//! messages that drive its state machine, and every transition notifies
//! the query's own listeners so presentation and storage layers never
//! touch the transport.

use crate::channel::WireChannel;
use crate::dispatcher::MessageDispatcher;
use crate::epoch::IdentifierGen;
use fcplink_api::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Protocol message and field names used by transfer queries.
pub mod protocol {
    /// Request a fetch.
    pub const CLIENT_GET: &str = "ClientGet";
    /// Request an insert.
    pub const CLIENT_PUT: &str = "ClientPut";
    /// Node acknowledgement of a fetch request.
    pub const PERSISTENT_GET: &str = "PersistentGet";
    /// Node acknowledgement of an insert request.
    pub const PERSISTENT_PUT: &str = "PersistentPut";
    /// Terminal fetch success: the node confirmed the key exists.
    pub const DATA_FOUND: &str = "DataFound";
    /// The fetched payload itself, carried as declared-length raw bytes.
    pub const ALL_DATA: &str = "AllData";
    /// Terminal fetch failure.
    pub const GET_FAILED: &str = "GetFailed";
    /// Terminal insert success.
    pub const PUT_SUCCESSFUL: &str = "PutSuccessful";
    /// Terminal insert failure.
    pub const PUT_FAILED: &str = "PutFailed";
    /// Best-effort cancellation of an outstanding request.
    pub const REMOVE_REQUEST: &str = "RemoveRequest";

    /// The target key of a request.
    pub const FIELD_URI: &str = "URI";
    /// The numeric failure code on a terminal failure message.
    pub const FIELD_CODE: &str = "Code";
    /// Request priority class.
    pub const FIELD_PRIORITY: &str = "PriorityClass";
    /// Node-side persistence tier of a request.
    pub const FIELD_PERSISTENCE: &str = "Persistence";
}

use protocol::*;

fn persistence_token(persistence: Persistence) -> &'static str {
    match persistence {
        Persistence::NonPersistent => "connection",
        Persistence::UntilDisconnect => "reboot",
        Persistence::Forever => "forever",
    }
}

/// Construction parameters for a [TransferQuery].
#[derive(Debug, Clone)]
pub struct QueryParams {
    /// Transfer direction.
    pub direction: Direction,
    /// Persistence tier.
    pub persistence: Persistence,
    /// Target key/URI on the node.
    pub uri: String,
    /// Local file the payload is read from (insert) or written to
    /// (fetch). Optional: a fetch without a path discards its payload.
    pub local_path: Option<PathBuf>,
    /// Request priority class.
    pub priority: u8,
    /// How many owner-driven retries remain for retryable failures.
    pub retry_budget: u32,
}

impl QueryParams {
    /// Parameters for a fetch of the given key.
    pub fn fetch(uri: impl Into<String>) -> Self {
        Self {
            direction: Direction::Fetch,
            persistence: Persistence::NonPersistent,
            uri: uri.into(),
            local_path: None,
            priority: 2,
            retry_budget: 0,
        }
    }

    /// Parameters for an insert of the given key.
    pub fn insert(uri: impl Into<String>) -> Self {
        Self {
            direction: Direction::Insert,
            ..Self::fetch(uri)
        }
    }

    /// Set the local payload path.
    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    /// Set the persistence tier.
    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    /// Set the priority class.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget.
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }
}

/// One outstanding fetch or insert request.
#[derive(Debug)]
pub struct TransferQuery {
    id: QueryId,
    params: QueryParams,
    channel: Arc<WireChannel>,
    dispatcher: Arc<MessageDispatcher>,
    state: Mutex<QueryState>,
    retries_left: AtomicU32,
    listeners: Mutex<Vec<(u64, DynQueryListener)>>,
    next_listener: AtomicU64,
}

impl TransferQuery {
    /// Construct a query. The identifier is assigned here, before any
    /// message is sent, so inbound correlation can never race ahead of
    /// registration.
    pub fn create(
        params: QueryParams,
        channel: Arc<WireChannel>,
        dispatcher: Arc<MessageDispatcher>,
        idgen: &IdentifierGen,
    ) -> Arc<Self> {
        let prefix = match params.direction {
            Direction::Fetch => "get",
            Direction::Insert => "put",
        };
        Arc::new(Self {
            id: idgen.next(prefix),
            retries_left: AtomicU32::new(params.retry_budget),
            params,
            channel,
            dispatcher,
            state: Mutex::new(QueryState::Created),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        })
    }

    /// The target key of this query.
    pub fn uri(&self) -> &str {
        &self.params.uri
    }

    /// The local payload path, if any.
    pub fn local_path(&self) -> Option<&PathBuf> {
        self.params.local_path.as_ref()
    }

    /// Consume one unit of the retry budget. Returns false once the
    /// budget is exhausted. Retry itself is the owner's responsibility:
    /// on a retryable failure code the owner re-derives parameters and
    /// submits a fresh query.
    pub fn consume_retry(&self) -> bool {
        self.retries_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
    }

    /// Register with the dispatcher and send the request message.
    /// Returns false (leaving the query unstarted) when the query
    /// already started or the send failed.
    pub async fn start(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state != QueryState::Created {
                tracing::error!(
                    id = %self.id,
                    state = ?*state,
                    "start called on a query that already started"
                );
                return false;
            }
            *state = QueryState::Waiting;
        }

        // registration precedes the send so the response cannot arrive
        // before anyone owns the identifier
        let handler: DynMessageHandler = self.clone();
        self.dispatcher.register_handler(self.id.clone(), handler);

        let sent = match self.params.direction {
            Direction::Fetch => self.send_get().await,
            Direction::Insert => self.send_put().await,
        };
        if let Err(err) = sent {
            tracing::warn!(id = %self.id, %err, "could not send start message");
            self.dispatcher.unregister_handler(&self.id);
            *self.state.lock().unwrap() = QueryState::Created;
            return false;
        }

        self.notify_listeners();
        true
    }

    /// Best-effort cancellation. A no-op returning true when the query
    /// already reached a terminal state: if the node's verdict raced
    /// ahead of the stop, the terminal state wins.
    pub async fn stop(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_terminal() {
                return true;
            }
            *state = QueryState::Stopped;
        }

        if self.channel.is_connected() {
            let msg = NodeMessage::new(REMOVE_REQUEST)
                .with_field(FIELD_IDENTIFIER, self.id.to_string());
            if let Err(err) = self.channel.write(&msg, true).await {
                tracing::warn!(
                    id = %self.id,
                    %err,
                    "could not send cancellation message"
                );
            }
        }

        self.dispatcher.unregister_handler(&self.id);
        self.notify_listeners();
        true
    }

    /// Register an observer of this query's state transitions. Returns
    /// a token for removal.
    pub fn add_listener(&self, listener: DynQueryListener) -> u64 {
        let token = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().push((token, listener));
        token
    }

    /// Remove a listener registration.
    pub fn remove_listener(&self, token: u64) {
        self.listeners.lock().unwrap().retain(|(t, _)| *t != token);
    }

    fn notify_listeners(&self) {
        let listeners: Vec<DynQueryListener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener.query_state_changed(self);
        }
    }

    async fn send_get(&self) -> FcpResult<()> {
        let msg = NodeMessage::new(CLIENT_GET)
            .with_field(FIELD_IDENTIFIER, self.id.to_string())
            .with_field(FIELD_URI, self.params.uri.as_str())
            .with_field(FIELD_PRIORITY, self.params.priority.to_string())
            .with_field(
                FIELD_PERSISTENCE,
                persistence_token(self.params.persistence),
            );
        self.channel.write(&msg, true).await
    }

    async fn send_put(&self) -> FcpResult<()> {
        let mut msg = NodeMessage::new(CLIENT_PUT)
            .with_field(FIELD_IDENTIFIER, self.id.to_string())
            .with_field(FIELD_URI, self.params.uri.as_str())
            .with_field(FIELD_PRIORITY, self.params.priority.to_string())
            .with_field(
                FIELD_PERSISTENCE,
                persistence_token(self.params.persistence),
            );

        let path = match self.params.local_path.as_ref() {
            None => return self.channel.write(&msg, true).await,
            Some(path) => path,
        };
        let data = tokio::fs::read(path).await.map_err(|err| {
            FcpError::other_src(
                format!("could not read insert payload {}", path.display()),
                err,
            )
        })?;
        msg.set_data_length(data.len() as u64);

        // the header and its payload own the channel as one unit so no
        // concurrent text write can land between them
        let _lock = self.channel.lock_writes_wait().await;
        self.channel.write(&msg, false).await?;
        self.channel.write_raw(bytes::Bytes::from(data))?;
        Ok(())
    }

    /// Transition to a terminal state unless one was already reached.
    fn advance_terminal(&self, to: QueryState) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.is_terminal() {
            return false;
        }
        *state = to;
        true
    }

    fn finish(&self, to: QueryState) {
        if self.advance_terminal(to) {
            self.dispatcher.unregister_handler(&self.id);
            self.notify_listeners();
        }
    }

    fn on_ack(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != QueryState::Waiting {
                return;
            }
            *state = QueryState::Running;
        }
        self.notify_listeners();
    }

    async fn consume_payload(&self) {
        if self.is_finished() {
            // leave the bytes for the channel's defensive drain
            tracing::trace!(id = %self.id, "payload arrived after terminal state");
            return;
        }
        match self.read_payload_to_file().await {
            Ok(()) => self.finish(QueryState::FinishedSuccess),
            Err(err) => {
                tracing::warn!(id = %self.id, %err, "payload download failed");
                self.finish(QueryState::FinishedFailure(
                    FailureCode::LOCAL_IO,
                ));
            }
        }
    }

    async fn read_payload_to_file(&self) -> FcpResult<()> {
        use tokio::io::AsyncWriteExt;

        let mut file = match self.params.local_path.as_ref() {
            Some(path) => {
                Some(tokio::fs::File::create(path).await.map_err(|err| {
                    FcpError::other_src(
                        format!("could not create {}", path.display()),
                        err,
                    )
                })?)
            }
            None => None,
        };
        let mut buf = [0_u8; 8192];
        loop {
            let n = self.channel.read_raw(&mut buf).await?;
            if n == 0 {
                break;
            }
            if let Some(file) = file.as_mut() {
                file.write_all(&buf[..n]).await.map_err(|err| {
                    FcpError::other_src("could not write payload", err)
                })?;
            }
        }
        if let Some(file) = file.as_mut() {
            file.flush()
                .await
                .map_err(|err| FcpError::other_src("could not flush", err))?;
        }
        Ok(())
    }
}

impl Query for TransferQuery {
    fn identifier(&self) -> QueryId {
        self.id.clone()
    }

    fn direction(&self) -> Direction {
        self.params.direction
    }

    fn persistence(&self) -> Persistence {
        self.params.persistence
    }

    fn state(&self) -> QueryState {
        *self.state.lock().unwrap()
    }
}

impl BaseHandler for TransferQuery {}

impl MessageHandler for TransferQuery {
    fn recv_message(&self, message: NodeMessage) -> BoxFut<'_, bool> {
        Box::pin(async move {
            match message.name() {
                PERSISTENT_GET | PERSISTENT_PUT => self.on_ack(),
                DATA_FOUND => {
                    // a fetch with a local destination gets its payload
                    // in a following AllData; the verdict alone does not
                    // end it
                    if self.params.direction == Direction::Fetch
                        && self.params.local_path.is_some()
                    {
                        self.on_ack();
                    } else {
                        self.finish(QueryState::FinishedSuccess);
                    }
                }
                PUT_SUCCESSFUL => self.finish(QueryState::FinishedSuccess),
                GET_FAILED | PUT_FAILED => {
                    let code = message
                        .field(FIELD_CODE)
                        .and_then(|c| c.parse().ok())
                        .map(FailureCode)
                        .unwrap_or(FailureCode(0));
                    if code.is_retryable() {
                        tracing::debug!(
                            id = %self.id,
                            %code,
                            "retryable failure; owner may resubmit with re-derived parameters"
                        );
                    }
                    self.finish(QueryState::FinishedFailure(code));
                }
                ALL_DATA => self.consume_payload().await,
                other => {
                    tracing::trace!(
                        id = %self.id,
                        name = other,
                        "ignoring message for this query"
                    );
                }
            }
            true
        })
    }
}

#[cfg(test)]
mod test;
