//! The socket-owning wire channel.
//!
//! A [WireChannel] frames outgoing text messages, reads response lines,
//! and drains or delivers raw binary sections on demand. Outgoing bytes
//! pass through a dedicated sender task paced by a token bucket; inbound
//! bytes are read by whichever task drives [WireChannel::read_line]
//! (normally the dispatcher's reader task).
//!
//! All socket failures downgrade to a logged warning plus a disconnect.
//! Callers observe this solely through the lifecycle event on the
//! channel's handler, never as an error propagating across the
//! boundary. The one exception is an I/O failure in the middle of a raw
//! payload read: it is ambiguous how much binary data was consumed, so
//! the error is also surfaced to the reading caller as fatal.

use fcplink_api::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::watch;

mod rate_limit;
pub use rate_limit::TokenBucket;

/// WireChannel configuration types.
pub mod config {
    use fcplink_api::config::ModConfig;

    /// Configuration parameters for [WireChannel](super::WireChannel).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WireChannelConfig {
        /// Outgoing byte budget per second. Unlimited when <= 0.
        /// Default: -1.
        pub rate_limit_bytes_per_sec: i64,
    }

    impl Default for WireChannelConfig {
        fn default() -> Self {
            Self {
                rate_limit_bytes_per_sec: -1,
            }
        }
    }

    /// Module-level configuration for WireChannel.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WireChannelModConfig {
        /// WireChannel configuration.
        pub wire_channel: WireChannelConfig,
    }

    impl ModConfig for WireChannelModConfig {}
}

use config::*;

#[derive(Debug)]
struct SenderHandle {
    tx: tokio::sync::mpsc::UnboundedSender<bytes::Bytes>,
    task: tokio::task::JoinHandle<()>,
}

/// Exclusive owner of the node socket.
///
/// Created disconnected. [WireChannel::connect] establishes the socket
/// and the rate-limited sender; [WireChannel::disconnect] tears both
/// down and notifies. Reconnect is a fresh connect after a full
/// disconnect.
#[derive(Debug)]
pub struct WireChannel {
    config: WireChannelConfig,
    handler: DynBaseHandler,
    connected: AtomicBool,
    pending_raw: AtomicU64,
    write_locked: AtomicBool,
    write_unlock: tokio::sync::Notify,
    sender: Mutex<Option<SenderHandle>>,
    reader: tokio::sync::Mutex<Option<BufReader<OwnedReadHalf>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl Drop for WireChannel {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.lock().unwrap().take() {
            sender.task.abort();
        }
    }
}

impl WireChannel {
    /// Construct a new, disconnected channel. The handler receives the
    /// connected/disconnected lifecycle events.
    pub fn create(
        config: WireChannelConfig,
        handler: DynBaseHandler,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            connected: AtomicBool::new(false),
            pending_raw: AtomicU64::new(0),
            write_locked: AtomicBool::new(false),
            write_unlock: tokio::sync::Notify::new(),
            sender: Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
            shutdown: Mutex::new(None),
        })
    }

    /// Whether the channel currently holds a live socket.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Establish the socket, the rate-limited sender task and the read
    /// half, then notify the handler with a connected event.
    pub async fn connect(
        self: &Arc<Self>,
        host: &str,
        port: u16,
    ) -> FcpResult<()> {
        if host.is_empty() {
            return Err(FcpError::connection("node host is not set"));
        }
        if port == 0 {
            return Err(FcpError::connection("node port is not set"));
        }
        if self.connected.load(Ordering::SeqCst) {
            return Err(FcpError::connection("already connected"));
        }

        let stream = TcpStream::connect((host, port)).await.map_err(|err| {
            FcpError::connection_src(
                format!("could not connect to {host}:{port}"),
                err,
            )
        })?;
        let (read_half, write_half) = stream.into_split();

        let bucket = if self.config.rate_limit_bytes_per_sec > 0 {
            Some(TokenBucket::new(
                self.config.rate_limit_bytes_per_sec as u64,
            ))
        } else {
            None
        };

        let (tx, rx) = unbounded_channel::<bytes::Bytes>();
        let task = tokio::task::spawn(sender_task(
            rx,
            write_half,
            bucket,
            Arc::downgrade(self),
        ));
        *self.sender.lock().unwrap() = Some(SenderHandle { tx, task });

        *self.reader.lock().await = Some(BufReader::new(read_half));

        let (shutdown_tx, _) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(shutdown_tx);

        self.pending_raw.store(0, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(%host, port, "connected to node");
        self.handler.connected();
        Ok(())
    }

    /// Tear down the socket and the sender task. Idempotent: exactly one
    /// disconnected notification is fired per connected-to-disconnected
    /// transition; further calls only log.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            tracing::debug!("disconnect called while already disconnected");
            return;
        }
        if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
            let _ = shutdown.send(true);
        }
        if let Some(sender) = self.sender.lock().unwrap().take() {
            sender.task.abort();
        }
        // If a reader call is in flight it observes the shutdown signal
        // and clears the read half itself.
        if let Ok(mut guard) = self.reader.try_lock() {
            *guard = None;
        }
        self.pending_raw.store(0, Ordering::SeqCst);
        tracing::debug!("disconnected from node");
        self.handler.disconnected();
    }

    /// Serialize a message and enqueue its bytes on the sender task.
    ///
    /// When `check_write_lock` is set and the write lock is held by a
    /// bulk binary transfer, this waits until the lock is released so
    /// that no text message can interleave with the locked writer's
    /// bytes on the wire.
    pub async fn write(
        &self,
        message: &NodeMessage,
        check_write_lock: bool,
    ) -> FcpResult<()> {
        if check_write_lock {
            while self.write_locked.load(Ordering::SeqCst) {
                let notified = self.write_unlock.notified();
                if !self.write_locked.load(Ordering::SeqCst) {
                    break;
                }
                notified.await;
            }
        }
        self.enqueue(message.encode())
    }

    /// Enqueue raw payload bytes on the sender task. Only the holder of
    /// the write lock streams raw bytes, immediately after the header
    /// that declared their length.
    pub fn write_raw(&self, data: bytes::Bytes) -> FcpResult<()> {
        self.enqueue(data)
    }

    fn enqueue(&self, data: bytes::Bytes) -> FcpResult<()> {
        match self.sender.lock().unwrap().as_ref() {
            Some(sender) => sender
                .tx
                .send(data)
                .map_err(|_| FcpError::connection("sender task is gone")),
            None => Err(FcpError::connection("not connected")),
        }
    }

    /// Claim exclusive write access for a bulk binary transfer. Held by
    /// at most one actor at a time; release wakes all waiting writers.
    pub fn lock_writes(self: &Arc<Self>) -> FcpResult<WriteLock> {
        if self.write_locked.swap(true, Ordering::SeqCst) {
            return Err(FcpError::contract("write lock is already held"));
        }
        Ok(WriteLock {
            channel: self.clone(),
        })
    }

    /// Wait until the write lock is free, then claim it.
    pub async fn lock_writes_wait(self: &Arc<Self>) -> WriteLock {
        loop {
            if let Ok(lock) = self.lock_writes() {
                return lock;
            }
            let notified = self.write_unlock.notified();
            if !self.write_locked.load(Ordering::SeqCst) {
                continue;
            }
            notified.await;
        }
    }

    /// Whether the write lock is currently held.
    pub fn is_write_locked(&self) -> bool {
        self.write_locked.load(Ordering::SeqCst)
    }

    /// Declare that `len` raw bytes follow on the socket. Called by the
    /// dispatcher before any further read, so the drain invariant in
    /// [WireChannel::read_line] holds.
    pub fn announce_raw(&self, len: u64) {
        self.pending_raw.store(len, Ordering::SeqCst);
    }

    /// How many announced raw bytes have not been consumed yet.
    pub fn pending_raw(&self) -> u64 {
        self.pending_raw.load(Ordering::SeqCst)
    }

    /// Block until a full line is available or the connection drops.
    ///
    /// If raw bytes were previously announced and never consumed, they
    /// are drained and discarded first and the condition is logged as
    /// abnormal; the connection stays alive. Returns `None` on EOF,
    /// local disconnect, or a socket error (which has already been
    /// converted to a disconnect).
    pub async fn read_line(&self) -> FcpResult<Option<String>> {
        let mut shutdown = match self
            .shutdown
            .lock()
            .unwrap()
            .as_ref()
            .map(|tx| tx.subscribe())
        {
            Some(rx) => rx,
            None => return Ok(None),
        };
        if *shutdown.borrow() {
            return Ok(None);
        }

        let mut guard = self.reader.lock().await;
        let reader = match guard.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };

        let pending = self.pending_raw.swap(0, Ordering::SeqCst);
        if pending > 0 {
            tracing::warn!("{}", FcpError::ProtocolDesync { pending });
            let mut remaining = pending;
            let mut buf = [0_u8; 4096];
            while remaining > 0 {
                let want = buf.len().min(remaining as usize);
                match reader.read_exact(&mut buf[..want]).await {
                    Ok(_) => remaining -= want as u64,
                    Err(err) => {
                        *guard = None;
                        drop(guard);
                        self.disconnect();
                        return Err(FcpError::fatal_io_src(
                            "io failure draining raw payload",
                            err,
                        ));
                    }
                }
            }
        }

        let mut line = String::new();
        let read = tokio::select! {
            _ = shutdown.changed() => None,
            res = reader.read_line(&mut line) => Some(res),
        };
        match read {
            // local disconnect
            None => {
                *guard = None;
                Ok(None)
            }
            Some(Ok(0)) => {
                *guard = None;
                drop(guard);
                tracing::debug!("node closed the connection");
                self.disconnect();
                Ok(None)
            }
            Some(Ok(_)) => {
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
            Some(Err(err)) => {
                *guard = None;
                drop(guard);
                tracing::warn!(?err, "socket read failed");
                self.disconnect();
                Ok(None)
            }
        }
    }

    /// Read up to `buf.len()` bytes of a previously announced raw
    /// section, decrementing the pending-raw counter. Returns 0 once no
    /// announced bytes remain. Any I/O failure here is fatal to the
    /// connection.
    pub async fn read_raw(&self, buf: &mut [u8]) -> FcpResult<usize> {
        let pending = self.pending_raw.load(Ordering::SeqCst);
        if pending == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(pending as usize);

        let mut guard = self.reader.lock().await;
        let reader = match guard.as_mut() {
            Some(reader) => reader,
            None => return Err(FcpError::connection("not connected")),
        };
        match reader.read_exact(&mut buf[..want]).await {
            Ok(_) => {
                self.pending_raw.fetch_sub(want as u64, Ordering::SeqCst);
                Ok(want)
            }
            Err(err) => {
                *guard = None;
                drop(guard);
                self.disconnect();
                Err(FcpError::fatal_io_src(
                    "io failure mid raw payload read",
                    err,
                ))
            }
        }
    }
}

/// Guard representing exclusive write access to the channel. Dropping
/// it releases the lock and wakes all writers waiting in
/// [WireChannel::write].
#[derive(Debug)]
pub struct WriteLock {
    channel: Arc<WireChannel>,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        self.channel.write_locked.store(false, Ordering::SeqCst);
        self.channel.write_unlock.notify_waiters();
    }
}

async fn sender_task(
    mut rx: UnboundedReceiver<bytes::Bytes>,
    mut write_half: OwnedWriteHalf,
    mut bucket: Option<TokenBucket>,
    channel: Weak<WireChannel>,
) {
    while let Some(chunk) = rx.recv().await {
        if let Some(bucket) = bucket.as_mut() {
            if let Some(delay) = bucket.pace(chunk.len()) {
                tokio::time::sleep(delay).await;
            }
        }
        if let Err(err) = write_half.write_all(&chunk).await {
            tracing::warn!(?err, "socket write failed");
            break;
        }
    }
    if let Some(channel) = channel.upgrade() {
        channel.disconnect();
    }
}

#[cfg(test)]
mod test;
