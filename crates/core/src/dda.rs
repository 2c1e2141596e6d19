//! Direct-disk-access capability probing.
//!
//! Before a directory may be used for direct disk access the node has
//! to prove it can touch the same filesystem: the client announces the
//! directory and which capabilities it wants, the node hands back
//! challenge filenames, the client performs the local I/O and answers,
//! and the node issues a verdict per capability.
//!
//! The probe messages carry no `Identifier`, so the probe registers as
//! a catch-all with the dispatcher and correlates on the `Directory`
//! field instead. An unsupported-protocol error from the node disables
//! direct disk access for the whole session rather than retrying.

use crate::channel::WireChannel;
use crate::dispatcher::MessageDispatcher;
use fcplink_api::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Protocol message and field names used by the capability probe.
pub mod protocol {
    /// Announce a directory and the wanted capabilities.
    pub const TEST_DDA_REQUEST: &str = "TestDDARequest";
    /// The node's challenge: filenames to write and read.
    pub const TEST_DDA_REPLY: &str = "TestDDAReply";
    /// The client's answer to the challenge.
    pub const TEST_DDA_RESPONSE: &str = "TestDDAResponse";
    /// The node's verdict per capability.
    pub const TEST_DDA_COMPLETE: &str = "TestDDAComplete";
    /// The node rejected the probe exchange outright.
    pub const PROTOCOL_ERROR: &str = "ProtocolError";

    /// The directory under test. Present on every probe message.
    pub const FIELD_DIRECTORY: &str = "Directory";
    /// Whether read capability is wanted.
    pub const FIELD_WANT_READ: &str = "WantReadDirectory";
    /// Whether write capability is wanted.
    pub const FIELD_WANT_WRITE: &str = "WantWriteDirectory";
    /// Challenge file the client must create.
    pub const FIELD_WRITE_FILENAME: &str = "WriteFilename";
    /// Content the client must write into it.
    pub const FIELD_CONTENT_TO_WRITE: &str = "ContentToWrite";
    /// Challenge file the client must read back.
    pub const FIELD_READ_FILENAME: &str = "ReadFilename";
    /// What the client read from the read challenge file.
    pub const FIELD_READ_CONTENT: &str = "ReadContent";
    /// Verdict: reading the directory is allowed.
    pub const FIELD_READ_ALLOWED: &str = "ReadDirectoryAllowed";
    /// Verdict: writing the directory is allowed.
    pub const FIELD_WRITE_ALLOWED: &str = "WriteDirectoryAllowed";
}

use protocol::*;

/// How long to wait for each node response within a probe.
const PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Session-wide direct-disk-access switch, shared by every probe on the
/// connection. Once the node signals the exchange is unsupported the
/// feature stays off for the session.
#[derive(Debug, Default)]
pub struct DdaSession {
    disabled: AtomicBool,
}

impl DdaSession {
    /// Construct an enabled session.
    pub fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether direct disk access has been disabled for this session.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Disable direct disk access for the rest of the session.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }
}

/// The node's verdict on a probed directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdaVerdict {
    /// Reading the directory directly is allowed.
    pub read_allowed: bool,
    /// Writing the directory directly is allowed. Always false when
    /// write capability was not requested.
    pub write_allowed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeState {
    Requested,
    AwaitingChallenge,
    Answered,
    Complete,
}

enum ProbeSignal {
    Message(NodeMessage),
    Unsupported,
}

/// One capability probe for one directory.
#[derive(Debug)]
pub struct DdaProbe {
    channel: Arc<WireChannel>,
    dispatcher: Arc<MessageDispatcher>,
    session: Arc<DdaSession>,
    directory: PathBuf,
    want_read: bool,
    want_write: bool,
}

impl DdaProbe {
    /// Set up a probe for the given directory and capability set.
    pub fn new(
        channel: Arc<WireChannel>,
        dispatcher: Arc<MessageDispatcher>,
        session: Arc<DdaSession>,
        directory: impl Into<PathBuf>,
        want_read: bool,
        want_write: bool,
    ) -> Self {
        Self {
            channel,
            dispatcher,
            session,
            directory: directory.into(),
            want_read,
            want_write,
        }
    }

    /// Run the handshake to its verdict.
    ///
    /// Challenge files are deleted after the verdict on every path,
    /// including failures. The returned verdict never grants write
    /// capability that was not requested.
    pub async fn run(self) -> FcpResult<DdaVerdict> {
        if self.session.is_disabled() {
            return Err(FcpError::other(
                "direct disk access is disabled for this session",
            ));
        }

        let (send, recv) = tokio::sync::mpsc::unbounded_channel();
        let handler: DynMessageHandler = Arc::new(ProbeHandler {
            directory: self.directory.display().to_string(),
            send,
        });
        let token = self.dispatcher.register_catch_all(handler);

        let mut challenge_files: Vec<PathBuf> = Vec::new();
        let result = self.exchange(recv, &mut challenge_files).await;

        self.dispatcher.unregister_catch_all(token);
        for path in challenge_files {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                tracing::debug!(
                    path = %path.display(),
                    %err,
                    "could not remove challenge file"
                );
            }
        }

        result
    }

    async fn exchange(
        &self,
        mut recv: tokio::sync::mpsc::UnboundedReceiver<ProbeSignal>,
        challenge_files: &mut Vec<PathBuf>,
    ) -> FcpResult<DdaVerdict> {
        let directory = self.directory.display().to_string();

        let request = NodeMessage::new(TEST_DDA_REQUEST)
            .with_field(FIELD_DIRECTORY, directory.as_str())
            .with_field(FIELD_WANT_READ, bool_token(self.want_read))
            .with_field(FIELD_WANT_WRITE, bool_token(self.want_write));
        self.channel.write(&request, true).await?;
        let mut state = ProbeState::Requested;
        tracing::debug!(%directory, ?state, "capability probe started");

        let reply = self.next_signal(&mut recv, TEST_DDA_REPLY).await?;
        state = ProbeState::AwaitingChallenge;
        tracing::trace!(%directory, ?state, "challenge received");

        let mut answer = NodeMessage::new(TEST_DDA_RESPONSE)
            .with_field(FIELD_DIRECTORY, directory.as_str());

        // the write challenge is only ever performed when write
        // capability was requested
        if self.want_write {
            if let Some(filename) = reply.field(FIELD_WRITE_FILENAME) {
                let content = reply
                    .field(FIELD_CONTENT_TO_WRITE)
                    .unwrap_or("")
                    .to_string();
                let path = PathBuf::from(filename);
                challenge_files.push(path.clone());
                if let Err(err) = tokio::fs::write(&path, content).await {
                    tracing::warn!(
                        path = %path.display(),
                        %err,
                        "could not write challenge file"
                    );
                }
            }
        }

        if let Some(filename) = reply.field(FIELD_READ_FILENAME) {
            let path = PathBuf::from(filename);
            let content = read_challenge(&path).await;
            challenge_files.push(path);
            answer = answer.with_field(FIELD_READ_CONTENT, content);
        }

        self.channel.write(&answer, true).await?;
        state = ProbeState::Answered;
        tracing::trace!(%directory, ?state, "challenge answered");

        let verdict = self.next_signal(&mut recv, TEST_DDA_COMPLETE).await?;
        state = ProbeState::Complete;

        let read_allowed =
            self.want_read && verdict.bool_field(FIELD_READ_ALLOWED);
        let write_allowed =
            self.want_write && verdict.bool_field(FIELD_WRITE_ALLOWED);
        tracing::debug!(
            %directory,
            ?state,
            read_allowed,
            write_allowed,
            "capability probe complete"
        );
        Ok(DdaVerdict {
            read_allowed,
            write_allowed,
        })
    }

    async fn next_signal(
        &self,
        recv: &mut tokio::sync::mpsc::UnboundedReceiver<ProbeSignal>,
        expect: &str,
    ) -> FcpResult<NodeMessage> {
        loop {
            let signal = tokio::time::timeout(PROBE_TIMEOUT, recv.recv())
                .await
                .map_err(|_| {
                    FcpError::other(format!("timed out waiting for {expect}"))
                })?
                .ok_or_else(|| {
                    FcpError::other("probe channel closed before verdict")
                })?;
            match signal {
                ProbeSignal::Message(message) if message.name() == expect => {
                    return Ok(message);
                }
                ProbeSignal::Message(message) => {
                    tracing::trace!(
                        name = message.name(),
                        "ignoring out-of-order probe message"
                    );
                }
                ProbeSignal::Unsupported => {
                    self.session.disable();
                    return Err(FcpError::other(
                        "node does not support direct disk access; \
                         disabled for this session",
                    ));
                }
            }
        }
    }
}

fn bool_token(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

async fn read_challenge(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) => {
            tracing::debug!(
                path = %path.display(),
                %err,
                "could not read challenge file"
            );
            String::new()
        }
    }
}

#[derive(Debug)]
struct ProbeHandler {
    directory: String,
    send: tokio::sync::mpsc::UnboundedSender<ProbeSignal>,
}

impl BaseHandler for ProbeHandler {}

impl MessageHandler for ProbeHandler {
    fn recv_message(&self, message: NodeMessage) -> BoxFut<'_, bool> {
        Box::pin(async move {
            match message.name() {
                TEST_DDA_REPLY | TEST_DDA_COMPLETE => {
                    // a reply without a directory can only belong to an
                    // in-flight probe, so claim it
                    let ours = message
                        .field(FIELD_DIRECTORY)
                        .map(|d| d == self.directory)
                        .unwrap_or(true);
                    if ours {
                        let _ = self.send.send(ProbeSignal::Message(message));
                    }
                    ours
                }
                PROTOCOL_ERROR => {
                    let _ = self.send.send(ProbeSignal::Unsupported);
                    true
                }
                _ => false,
            }
        })
    }
}
