use super::*;
use fcplink_test_utils::node::TestNode;
use fcplink_test_utils::{enable_tracing, iter_check};
use std::sync::atomic::AtomicUsize;

#[derive(Debug, Default)]
struct Lifecycle {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

impl BaseHandler for Lifecycle {
    fn connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

async fn connected_channel(
    node: &TestNode,
) -> (Arc<WireChannel>, Arc<Lifecycle>) {
    let lifecycle = Arc::new(Lifecycle::default());
    let channel =
        WireChannel::create(WireChannelConfig::default(), lifecycle.clone());
    channel.connect("127.0.0.1", node.port()).await.unwrap();
    (channel, lifecycle)
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_rejects_bad_parameters() {
    enable_tracing();

    let lifecycle = Arc::new(Lifecycle::default());
    let channel =
        WireChannel::create(WireChannelConfig::default(), lifecycle.clone());

    assert!(channel.connect("", 9481).await.is_err());
    assert!(channel.connect("127.0.0.1", 0).await.is_err());
    assert!(!channel.is_connected());
    assert_eq!(0, lifecycle.connected.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn double_connect_is_rejected() {
    enable_tracing();

    let node = TestNode::bind().await;
    let (channel, lifecycle) = connected_channel(&node).await;
    let _peer = node.accept().await;

    assert!(channel.connect("127.0.0.1", node.port()).await.is_err());
    assert_eq!(1, lifecycle.connected.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_notifies_exactly_once() {
    enable_tracing();

    let node = TestNode::bind().await;
    let (channel, lifecycle) = connected_channel(&node).await;
    let _peer = node.accept().await;

    assert!(channel.is_connected());
    assert_eq!(1, lifecycle.connected.load(Ordering::SeqCst));

    channel.disconnect();
    channel.disconnect();

    assert!(!channel.is_connected());
    assert_eq!(1, lifecycle.disconnected.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn write_reaches_the_node() {
    enable_tracing();

    let node = TestNode::bind().await;
    let (channel, _) = connected_channel(&node).await;
    let mut peer = node.accept().await;

    let msg = NodeMessage::new("ClientHello")
        .with_field("Name", "fcplink")
        .with_field("ExpectedVersion", "2.0");
    channel.write(&msg, true).await.unwrap();

    let got = peer.read_message().await;
    assert_eq!("ClientHello", got.name());
    assert_eq!(Some("fcplink"), got.field("Name"));
}

#[tokio::test(flavor = "multi_thread")]
async fn locked_payload_is_never_interleaved() {
    enable_tracing();

    let node = TestNode::bind().await;
    let (channel, _) = connected_channel(&node).await;
    let mut peer = node.accept().await;

    let lock = channel.lock_writes().unwrap();
    assert!(channel.is_write_locked());

    // a plain write issued while the lock is held must wait
    let contender = {
        let channel = channel.clone();
        tokio::task::spawn(async move {
            let msg = NodeMessage::new("ListPeers");
            channel.write(&msg, true).await.unwrap();
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!contender.is_finished());

    let header = NodeMessage::new("ClientPut")
        .with_field("Identifier", "put-1")
        .with_data_length(4);
    channel.write(&header, false).await.unwrap();
    channel.write_raw(bytes::Bytes::from_static(b"data")).unwrap();
    drop(lock);

    let got = peer.read_message().await;
    assert_eq!("ClientPut", got.name());
    assert_eq!(Some(4), got.data_length());
    assert_eq!(b"data".to_vec(), peer.read_exact(4).await);

    contender.await.unwrap();
    let got = peer.read_message().await;
    assert_eq!("ListPeers", got.name());
    assert!(!channel.is_write_locked());
}

#[tokio::test(flavor = "multi_thread")]
async fn second_lock_claim_is_refused() {
    enable_tracing();

    let node = TestNode::bind().await;
    let (channel, _) = connected_channel(&node).await;
    let _peer = node.accept().await;

    let lock = channel.lock_writes().unwrap();
    assert!(channel.lock_writes().is_err());
    drop(lock);
    assert!(channel.lock_writes().is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn read_line_returns_trimmed_lines() {
    enable_tracing();

    let node = TestNode::bind().await;
    let (channel, _) = connected_channel(&node).await;
    let mut peer = node.accept().await;

    peer.send_text("NodeHello\r\nEndMessage\n").await;

    assert_eq!(Some("NodeHello".to_string()), channel.read_line().await.unwrap());
    assert_eq!(
        Some("EndMessage".to_string()),
        channel.read_line().await.unwrap()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn eof_downgrades_to_disconnect() {
    enable_tracing();

    let node = TestNode::bind().await;
    let (channel, lifecycle) = connected_channel(&node).await;
    let peer = node.accept().await;

    drop(peer);

    assert_eq!(None, channel.read_line().await.unwrap());
    assert!(!channel.is_connected());
    assert_eq!(1, lifecycle.disconnected.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_unblocks_a_pending_read() {
    enable_tracing();

    let node = TestNode::bind().await;
    let (channel, _) = connected_channel(&node).await;
    let _peer = node.accept().await;

    let reader = {
        let channel = channel.clone();
        tokio::task::spawn(async move { channel.read_line().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    channel.disconnect();
    assert_eq!(None, reader.await.unwrap().unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn read_raw_consumes_announced_bytes() {
    enable_tracing();

    let node = TestNode::bind().await;
    let (channel, _) = connected_channel(&node).await;
    let mut peer = node.accept().await;

    channel.announce_raw(10);
    peer.send_raw(b"0123456789").await;

    let mut buf = [0_u8; 4];
    let mut got = Vec::new();
    loop {
        let n = channel.read_raw(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(b"0123456789".to_vec(), got);
    assert_eq!(0, channel.pending_raw());
}

#[tokio::test(flavor = "multi_thread")]
async fn unconsumed_raw_bytes_are_drained_before_the_next_line() {
    enable_tracing();

    let node = TestNode::bind().await;
    let (channel, _) = connected_channel(&node).await;
    let mut peer = node.accept().await;

    channel.announce_raw(1024);
    peer.send_raw(&[7_u8; 1024]).await;
    peer.send_text("NodeHello\n").await;

    // nobody consumed the payload; the channel must drain exactly the
    // announced amount and hand back the following line
    assert_eq!(Some("NodeHello".to_string()), channel.read_line().await.unwrap());
    assert_eq!(0, channel.pending_raw());
    assert!(channel.is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn error_mid_raw_read_is_fatal() {
    enable_tracing();

    let node = TestNode::bind().await;
    let (channel, lifecycle) = connected_channel(&node).await;
    let mut peer = node.accept().await;

    channel.announce_raw(1024);
    peer.send_raw(&[7_u8; 100]).await;
    drop(peer);

    let mut buf = [0_u8; 2048];
    let err = loop {
        match channel.read_raw(&mut buf).await {
            Ok(_) => continue,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, FcpError::FatalIo { .. }));
    iter_check!({
        if !channel.is_connected() {
            return;
        }
    });
    assert_eq!(1, lifecycle.disconnected.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn rate_limited_sends_are_paced() {
    enable_tracing();

    let node = TestNode::bind().await;
    let lifecycle = Arc::new(Lifecycle::default());
    let channel = WireChannel::create(
        WireChannelConfig {
            rate_limit_bytes_per_sec: 2048,
        },
        lifecycle,
    );
    channel.connect("127.0.0.1", node.port()).await.unwrap();
    let mut peer = node.accept().await;

    // the burst allowance covers the first chunk; the second chunk of a
    // further full second's budget has to wait
    let started = std::time::Instant::now();
    channel.write_raw(bytes::Bytes::from(vec![0_u8; 2048])).unwrap();
    channel.write_raw(bytes::Bytes::from(vec![0_u8; 2048])).unwrap();
    peer.read_exact(4096).await;
    assert!(started.elapsed() >= std::time::Duration::from_millis(800));
}
