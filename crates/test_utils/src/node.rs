//! An in-process stand-in for the remote node.
//!
//! Binds a loopback listener and hands out peers that speak the wire
//! protocol at the message level, so tests can script both sides of a
//! connection without a real node.

use fcplink_api::{MessageDecoder, NodeMessage};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

/// A loopback listener standing in for the node.
pub struct TestNode {
    listener: TcpListener,
}

impl TestNode {
    /// Bind on an ephemeral loopback port.
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    /// The bound port, for the client side to connect to.
    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Accept one client connection.
    pub async fn accept(&self) -> TestPeer {
        let (stream, _) = self.listener.accept().await.unwrap();
        let (read, write) = stream.into_split();
        TestPeer {
            read: BufReader::new(read),
            write,
        }
    }
}

/// The node's side of one accepted connection.
pub struct TestPeer {
    read: BufReader<OwnedReadHalf>,
    write: OwnedWriteHalf,
}

impl TestPeer {
    /// Read one protocol line, trimmed. None on EOF.
    pub async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        if self.read.read_line(&mut line).await.unwrap() == 0 {
            return None;
        }
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read lines until a whole message has been received.
    pub async fn read_message(&mut self) -> NodeMessage {
        let mut decoder = MessageDecoder::default();
        loop {
            let line = self.read_line().await.expect("eof mid message");
            if let Some(message) = decoder.feed_line(&line).unwrap() {
                return message;
            }
        }
    }

    /// Read exactly `len` raw payload bytes.
    pub async fn read_exact(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0_u8; len];
        self.read.read_exact(&mut buf).await.unwrap();
        buf
    }

    /// Send a whole message.
    pub async fn send(&mut self, message: &NodeMessage) {
        self.write.write_all(&message.encode()).await.unwrap();
        self.write.flush().await.unwrap();
    }

    /// Send raw payload bytes.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.write.write_all(bytes).await.unwrap();
        self.write.flush().await.unwrap();
    }

    /// Send literal text, exactly as given.
    pub async fn send_text(&mut self, text: &str) {
        self.write.write_all(text.as_bytes()).await.unwrap();
        self.write.flush().await.unwrap();
    }
}
