use super::*;
use crate::channel::config::WireChannelConfig;
use fcplink_test_utils::node::{TestNode, TestPeer};
use fcplink_test_utils::{enable_tracing, iter_check};

struct Harness {
    channel: Arc<WireChannel>,
    dispatcher: Arc<MessageDispatcher>,
    idgen: IdentifierGen,
    peer: TestPeer,
}

async fn harness() -> Harness {
    let node = TestNode::bind().await;
    let dispatcher = MessageDispatcher::create();
    let channel = WireChannel::create(
        WireChannelConfig::default(),
        dispatcher.clone(),
    );
    channel.connect("127.0.0.1", node.port()).await.unwrap();
    let peer = node.accept().await;
    Harness {
        channel,
        dispatcher,
        idgen: IdentifierGen::new(),
        peer,
    }
}

impl Harness {
    fn query(&self, params: QueryParams) -> Arc<TransferQuery> {
        TransferQuery::create(
            params,
            self.channel.clone(),
            self.dispatcher.clone(),
            &self.idgen,
        )
    }
}

#[derive(Debug, Default)]
struct StateRecorder {
    states: Mutex<Vec<QueryState>>,
}

impl StateRecorder {
    fn states(&self) -> Vec<QueryState> {
        self.states.lock().unwrap().clone()
    }
}

impl QueryListener for StateRecorder {
    fn query_state_changed(&self, query: &dyn Query) {
        self.states.lock().unwrap().push(query.state());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn start_registers_before_sending_the_request() {
    enable_tracing();

    let mut h = harness().await;
    let query = h.query(QueryParams::fetch("CHK@abc").with_priority(4));

    assert_eq!(QueryState::Created, query.state());
    assert!(query.start().await);
    assert_eq!(QueryState::Waiting, query.state());
    assert!(h.dispatcher.is_registered(&query.identifier()));

    let sent = h.peer.read_message().await;
    assert_eq!("ClientGet", sent.name());
    assert_eq!(Some("CHK@abc"), sent.field("URI"));
    assert_eq!(Some("4"), sent.field("PriorityClass"));
    assert_eq!(Some("connection"), sent.field("Persistence"));
    assert_eq!(
        Some(query.identifier().to_string().as_str()),
        sent.identifier()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn start_twice_is_refused() {
    enable_tracing();

    let h = harness().await;
    let query = h.query(QueryParams::fetch("CHK@abc"));

    assert!(query.start().await);
    assert!(!query.start().await);
    assert_eq!(QueryState::Waiting, query.state());
}

#[tokio::test(flavor = "multi_thread")]
async fn node_ack_moves_waiting_to_running() {
    enable_tracing();

    let h = harness().await;
    let query = h.query(QueryParams::fetch("CHK@abc"));
    let recorder = Arc::new(StateRecorder::default());
    query.add_listener(recorder.clone());
    query.start().await;

    h.dispatcher
        .dispatch(
            NodeMessage::new(PERSISTENT_GET)
                .with_field(FIELD_IDENTIFIER, query.identifier().to_string()),
        )
        .await;

    assert_eq!(QueryState::Running, query.state());
    assert_eq!(
        vec![QueryState::Waiting, QueryState::Running],
        recorder.states()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_success_unregisters_and_notifies() {
    enable_tracing();

    let h = harness().await;
    let query = h.query(QueryParams::fetch("CHK@abc"));
    let recorder = Arc::new(StateRecorder::default());
    query.add_listener(recorder.clone());
    query.start().await;

    h.dispatcher
        .dispatch(
            NodeMessage::new(DATA_FOUND)
                .with_field(FIELD_IDENTIFIER, query.identifier().to_string()),
        )
        .await;

    assert_eq!(QueryState::FinishedSuccess, query.state());
    assert!(query.is_successful());
    assert!(!h.dispatcher.is_registered(&query.identifier()));
    assert_eq!(
        Some(&QueryState::FinishedSuccess),
        recorder.states().last()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_after_finished_is_a_no_op_returning_true() {
    enable_tracing();

    let h = harness().await;
    let query = h.query(QueryParams::fetch("CHK@abc"));
    query.start().await;
    h.dispatcher
        .dispatch(
            NodeMessage::new(GET_FAILED)
                .with_field(FIELD_IDENTIFIER, query.identifier().to_string())
                .with_field(FIELD_CODE, "13"),
        )
        .await;

    assert_eq!(
        QueryState::FinishedFailure(FailureCode::DATA_NOT_FOUND),
        query.state()
    );
    // the node's verdict raced ahead, so the terminal state wins
    assert!(query.stop().await);
    assert_eq!(
        QueryState::FinishedFailure(FailureCode::DATA_NOT_FOUND),
        query.state()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_sends_a_cancellation_and_unregisters() {
    enable_tracing();

    let mut h = harness().await;
    let query = h.query(QueryParams::fetch("CHK@abc"));
    query.start().await;
    assert_eq!("ClientGet", h.peer.read_message().await.name());

    assert!(query.stop().await);
    assert_eq!(QueryState::Stopped, query.state());
    assert!(!h.dispatcher.is_registered(&query.identifier()));

    let sent = h.peer.read_message().await;
    assert_eq!(REMOVE_REQUEST, sent.name());
    assert_eq!(
        Some(query.identifier().to_string().as_str()),
        sent.identifier()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn collision_failure_is_reported_retryable_to_the_owner() {
    enable_tracing();

    let h = harness().await;
    let query = h
        .query(QueryParams::insert("USK@site/1").with_retry_budget(2));
    query.start().await;

    h.dispatcher
        .dispatch(
            NodeMessage::new(PUT_FAILED)
                .with_field(FIELD_IDENTIFIER, query.identifier().to_string())
                .with_field(FIELD_CODE, "9"),
        )
        .await;

    match query.state() {
        QueryState::FinishedFailure(code) => {
            assert_eq!(FailureCode::COLLISION, code);
            assert!(code.is_retryable());
        }
        other => panic!("unexpected state {other:?}"),
    }
    // resubmission is the owner's job, metered by the retry budget
    assert!(query.consume_retry());
    assert!(query.consume_retry());
    assert!(!query.consume_retry());
}

#[tokio::test(flavor = "multi_thread")]
async fn fetched_payload_is_downloaded_to_the_local_path() {
    enable_tracing();

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("fetched.bin");

    let mut h = harness().await;
    h.dispatcher.start(h.channel.clone());
    let query = h.query(
        QueryParams::fetch("CHK@abc").with_local_path(&target),
    );
    query.start().await;
    assert_eq!("ClientGet", h.peer.read_message().await.name());

    let id = query.identifier().to_string();
    h.peer
        .send(
            &NodeMessage::new(ALL_DATA)
                .with_field(FIELD_IDENTIFIER, id)
                .with_data_length(11),
        )
        .await;
    h.peer.send_raw(b"hello world").await;

    iter_check!({
        if query.is_finished() {
            return;
        }
    });
    assert_eq!(QueryState::FinishedSuccess, query.state());
    assert_eq!(b"hello world".to_vec(), std::fs::read(&target).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn data_found_then_all_data_writes_the_payload() {
    enable_tracing();

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("fetched.bin");

    let mut h = harness().await;
    h.dispatcher.start(h.channel.clone());
    let query = h.query(
        QueryParams::fetch("CHK@abc").with_local_path(&target),
    );
    query.start().await;
    assert_eq!("ClientGet", h.peer.read_message().await.name());
    let id = query.identifier().to_string();

    h.peer
        .send(
            &NodeMessage::new(DATA_FOUND)
                .with_field(FIELD_IDENTIFIER, id.clone()),
        )
        .await;

    // the verdict is progress, not the end: the query stays registered
    // for the payload that follows
    iter_check!({
        if query.state() == QueryState::Running {
            return;
        }
    });
    assert!(h.dispatcher.is_registered(&query.identifier()));

    h.peer
        .send(
            &NodeMessage::new(ALL_DATA)
                .with_field(FIELD_IDENTIFIER, id)
                .with_data_length(11),
        )
        .await;
    h.peer.send_raw(b"hello world").await;

    iter_check!({
        if query.is_finished() {
            return;
        }
    });
    assert_eq!(QueryState::FinishedSuccess, query.state());
    assert_eq!(b"hello world".to_vec(), std::fs::read(&target).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn insert_streams_the_local_file_after_its_header() {
    enable_tracing();

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("payload.bin");
    std::fs::write(&source, b"insert me").unwrap();

    let mut h = harness().await;
    let query = h.query(
        QueryParams::insert("CHK@")
            .with_local_path(&source)
            .with_persistence(Persistence::UntilDisconnect),
    );
    query.start().await;

    let sent = h.peer.read_message().await;
    assert_eq!("ClientPut", sent.name());
    assert_eq!(Some("reboot"), sent.field("Persistence"));
    assert_eq!(Some(9), sent.data_length());
    assert_eq!(b"insert me".to_vec(), h.peer.read_exact(9).await);
    assert!(!h.channel.is_write_locked());

    h.dispatcher
        .dispatch(
            NodeMessage::new(PUT_SUCCESSFUL)
                .with_field(FIELD_IDENTIFIER, query.identifier().to_string()),
        )
        .await;
    assert_eq!(QueryState::FinishedSuccess, query.state());
}

#[tokio::test(flavor = "multi_thread")]
async fn start_failure_leaves_the_query_startable() {
    enable_tracing();

    let h = harness().await;
    let query = h.query(QueryParams::fetch("CHK@abc"));
    h.channel.disconnect();

    assert!(!query.start().await);
    assert_eq!(QueryState::Created, query.state());
    assert!(!h.dispatcher.is_registered(&query.identifier()));
}
