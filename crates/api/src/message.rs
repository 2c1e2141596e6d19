//! The line-oriented wire message type and its text codec.
//!
//! A message on the wire is one command line, zero or more `Key=Value`
//! lines, then either a line containing only [END_MESSAGE], or (for
//! commands carrying a payload) a line `DataLength=<N>` followed
//! immediately by exactly N raw bytes.

use crate::{FcpError, FcpResult};

/// Sentinel line terminating a payload-less message.
pub const END_MESSAGE: &str = "EndMessage";

/// Field announcing that N raw payload bytes follow the header.
pub const FIELD_DATA_LENGTH: &str = "DataLength";

/// The correlation field carried by every request/response pair.
pub const FIELD_IDENTIFIER: &str = "Identifier";

/// One parsed or to-be-sent protocol message: a command name, an ordered
/// set of unique string keys and string values, and an optionally
/// declared raw payload length.
///
/// The payload bytes themselves never live on this type. The byte count
/// is always known before the payload is read, and the channel is
/// responsible for draining any declared bytes that no one consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMessage {
    name: String,
    fields: Vec<(String, String)>,
    data_length: Option<u64>,
}

impl NodeMessage {
    /// Construct a new message with the given command name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            data_length: None,
        }
    }

    /// Builder-style variant of [NodeMessage::set_field].
    pub fn with_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.set_field(key, value);
        self
    }

    /// Set a field value. Keys are unique: setting an existing key
    /// replaces its value in place, preserving field order.
    pub fn set_field(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.fields.push((key, value)),
        }
    }

    /// Get a field value by key.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Get a boolean field. Absent or unparseable values read as false.
    pub fn bool_field(&self, key: &str) -> bool {
        matches!(self.field(key), Some("true"))
    }

    /// The command name of this message.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The correlation identifier carried by this message, if any.
    pub fn identifier(&self) -> Option<&str> {
        self.field(FIELD_IDENTIFIER)
    }

    /// Declare that this message carries a raw payload of `len` bytes.
    pub fn set_data_length(&mut self, len: u64) {
        self.data_length = Some(len);
    }

    /// Builder-style variant of [NodeMessage::set_data_length].
    pub fn with_data_length(mut self, len: u64) -> Self {
        self.set_data_length(len);
        self
    }

    /// The declared raw payload length, if any.
    pub fn data_length(&self) -> Option<u64> {
        self.data_length
    }

    /// Iterate the fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialize the message header to wire bytes. When a payload length
    /// is declared, the caller is responsible for sending exactly that
    /// many raw bytes immediately after this header.
    pub fn encode(&self) -> bytes::Bytes {
        let mut out = String::with_capacity(64);
        out.push_str(&self.name);
        out.push('\n');
        for (k, v) in self.fields.iter() {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('\n');
        }
        match self.data_length {
            Some(len) => {
                out.push_str(FIELD_DATA_LENGTH);
                out.push('=');
                out.push_str(&len.to_string());
                out.push('\n');
            }
            None => {
                out.push_str(END_MESSAGE);
                out.push('\n');
            }
        }
        bytes::Bytes::from(out)
    }
}

/// Incremental message decoder. Feed inbound lines one at a time; a
/// complete [NodeMessage] is returned once its terminator line (either
/// [END_MESSAGE] or a `DataLength` declaration) has been seen.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    partial: Option<NodeMessage>,
}

impl MessageDecoder {
    /// Feed one line (without its trailing newline). Returns
    /// `Ok(Some(_))` when the line completed a message, `Ok(None)` when
    /// more lines are needed, and `Err(_)` for a malformed line. On
    /// error any partial message is discarded; the caller may keep
    /// feeding subsequent lines.
    pub fn feed_line(&mut self, line: &str) -> FcpResult<Option<NodeMessage>> {
        match self.partial.as_mut() {
            None => {
                if line.is_empty() {
                    return Ok(None);
                }
                if line.contains('=') || line == END_MESSAGE {
                    return Err(FcpError::other(format!(
                        "malformed message header line: {line:?}"
                    )));
                }
                self.partial = Some(NodeMessage::new(line));
                Ok(None)
            }
            Some(msg) => {
                if line == END_MESSAGE {
                    return Ok(self.partial.take());
                }
                match line.split_once('=') {
                    Some((key, value)) if key == FIELD_DATA_LENGTH => {
                        match value.parse::<u64>() {
                            Ok(len) => {
                                msg.set_data_length(len);
                                Ok(self.partial.take())
                            }
                            Err(err) => {
                                self.partial = None;
                                Err(FcpError::other_src(
                                    format!(
                                        "unparseable payload length: {value:?}"
                                    ),
                                    err,
                                ))
                            }
                        }
                    }
                    Some((key, value)) => {
                        msg.set_field(key, value);
                        Ok(None)
                    }
                    None => {
                        self.partial = None;
                        Err(FcpError::other(format!(
                            "field line without separator: {line:?}"
                        )))
                    }
                }
            }
        }
    }

    /// True while a message header has been started but not terminated.
    pub fn is_mid_message(&self) -> bool {
        self.partial.is_some()
    }
}
