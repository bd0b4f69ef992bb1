//! Message Factory: construction of well-formed Jupyter kernel messages.
//!
//! See the [Jupyter messaging
//! spec](https://jupyter-client.readthedocs.io/en/stable/messaging.html) for
//! the header/parent_header/metadata/content/buffers five-tuple this module
//! implements. Construction here is pure: no I/O, no socket access.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{Error, Result};

/// Protocol version this crate speaks on the wire.
pub const PROTOCOL_VERSION: &str = "5.0";

/// One of the four logical channels multiplexed over a kernel session's
/// websocket.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Requests and their replies: execute, complete, inspect, etc.
    Shell,
    /// Broadcast channel for side effects (stdout, status, comm traffic).
    IoPub,
    /// Requests from the kernel to the client for standard input.
    Stdin,
    /// Like shell, but kept separate so interrupts aren't queued behind it.
    Control,
}

impl Channel {
    /// The wire name for this channel, as used in the websocket framing and
    /// in `parent_header`/routing comparisons.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::IoPub => "iopub",
            Channel::Stdin => "stdin",
            Channel::Control => "control",
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shell" => Ok(Channel::Shell),
            "iopub" => Ok(Channel::IoPub),
            "stdin" => Ok(Channel::Stdin),
            "control" => Ok(Channel::Control),
            other => Err(Error::InvalidResponse(format!(
                "unrecognized channel {other:?}"
            ))),
        }
    }
}

/// Type of a kernel wire protocol message, either request or reply.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum KernelMessageType {
    /// Execute a block of code.
    ExecuteRequest,
    /// Return execution results.
    ExecuteReply,
    /// Request detailed information about a piece of code.
    InspectRequest,
    /// Return detailed information about the inspected code.
    InspectReply,
    /// Request code completions or suggestions.
    CompleteRequest,
    /// Return completions or suggestions for the code.
    CompleteReply,
    /// Request execution history.
    HistoryRequest,
    /// Return the requested execution history.
    HistoryReply,
    /// Request to check if code is complete.
    IsCompleteRequest,
    /// Reply indicating if code is complete.
    IsCompleteReply,
    /// Request information about existing comms.
    CommInfoRequest,
    /// Reply with information about existing comms.
    CommInfoReply,
    /// Request kernel information.
    KernelInfoRequest,
    /// Reply with kernel information.
    KernelInfoReply,
    /// Request kernel shutdown.
    ShutdownRequest,
    /// Reply to confirm kernel shutdown.
    ShutdownReply,
    /// Request to interrupt kernel execution.
    InterruptRequest,
    /// Reply to confirm kernel interruption.
    InterruptReply,
    /// Input requested from the client on the stdin channel.
    InputRequest,
    /// Input supplied by the client on the stdin channel.
    InputReply,
    /// Streams of output (stdout, stderr) from the kernel.
    Stream,
    /// Data to be displayed in frontends.
    DisplayData,
    /// Update display data with new information.
    UpdateDisplayData,
    /// Re-broadcast of code in an execute request.
    ExecuteInput,
    /// Results of a code execution.
    ExecuteResult,
    /// An error occurred during code execution.
    Error,
    /// Updates about kernel status.
    Status,
    /// Clear output visible on the frontend.
    ClearOutput,
    /// Open a new comm.
    CommOpen,
    /// Message on an existing comm.
    CommMsg,
    /// Close an existing comm.
    CommClose,
    /// Another kernel message type not otherwise recognized.
    #[serde(untagged)]
    Other(String),
}

/// Header of a message, part of the header/parent_header/metadata/content/
/// buffers five-tuple.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KernelHeader {
    /// Must be unique per message within a session's lifetime (a UUID).
    pub msg_id: String,
    /// Unique per client session (a UUID); shared by every message this
    /// client sends.
    pub session: String,
    /// The username of the user sending the message.
    pub username: String,
    /// ISO 8601 timestamp for when the message was created.
    #[serde(with = "time::serde::iso8601")]
    pub date: OffsetDateTime,
    /// The message type.
    pub msg_type: KernelMessageType,
    /// Message protocol version.
    pub version: String,
}

/// A message sent to or received from a Jupyter kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct Message<T = Value> {
    /// The message header.
    pub header: KernelHeader,
    /// The parent message header, if this message is a reply or a
    /// side-effect of a previous request. Empty for a freshly constructed
    /// request.
    pub parent_header: Option<KernelHeader>,
    /// The channel this message travels on.
    pub channel: Channel,
    /// The content of the message, a structured payload whose shape depends
    /// on `header.msg_type`.
    pub content: T,
    /// Structured metadata attached to the message, separate from content.
    pub metadata: BTreeMap<String, Value>,
    /// Ordered binary blobs attached to the message (used by extensions and
    /// by comm messages carrying large data).
    pub buffers: Vec<Bytes>,
}

impl<T> Message<T> {
    /// Construct a message with a freshly populated header: protocol
    /// version `"5.0"`, a generated `msg_id`, and an empty `parent_header`.
    ///
    /// This is pure construction — it performs no I/O and does not touch a
    /// session's outbound queue.
    pub fn new(
        msg_type: KernelMessageType,
        channel: Channel,
        username: impl Into<String>,
        session: impl Into<String>,
        content: T,
    ) -> Self {
        Self::with_msg_id(
            msg_type,
            channel,
            username,
            session,
            Uuid::new_v4().to_string(),
            content,
        )
    }

    /// Like [`Message::new`], but with an explicit `msg_id` instead of a
    /// freshly generated one.
    pub fn with_msg_id(
        msg_type: KernelMessageType,
        channel: Channel,
        username: impl Into<String>,
        session: impl Into<String>,
        msg_id: impl Into<String>,
        content: T,
    ) -> Self {
        Self {
            header: KernelHeader {
                msg_id: msg_id.into(),
                session: session.into(),
                username: username.into(),
                date: OffsetDateTime::now_utc(),
                msg_type,
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: None,
            channel,
            content,
            metadata: BTreeMap::new(),
            buffers: Vec::new(),
        }
    }

    /// Set the parent header, marking this message as caused by a previous
    /// one (used for replies and synthesized local messages).
    pub fn with_parent(mut self, parent: KernelHeader) -> Self {
        self.parent_header = Some(parent);
        self
    }

    /// Attach metadata to the message.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach binary buffers to the message.
    pub fn with_buffers(mut self, buffers: Vec<Bytes>) -> Self {
        self.buffers = buffers;
        self
    }
}

impl<T: Serialize> Message<T> {
    /// Produce a variant of this message with its content serialized to
    /// JSON, ready for wire framing.
    pub fn into_json(self) -> Result<Message<Value>> {
        Ok(Message {
            header: self.header,
            parent_header: self.parent_header,
            channel: self.channel,
            content: serde_json::to_value(&self.content)
                .map_err(|err| Error::InvalidResponse(err.to_string()))?,
            metadata: self.metadata,
            buffers: self.buffers,
        })
    }
}

impl Message<Value> {
    /// Deserialize the content of a JSON-valued message into a specific
    /// type.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<Message<T>> {
        Ok(Message {
            header: self.header,
            parent_header: self.parent_header,
            channel: self.channel,
            content: serde_json::from_value(self.content)
                .map_err(|err| Error::InvalidResponse(err.to_string()))?,
            metadata: self.metadata,
            buffers: self.buffers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_message_has_populated_header() {
        let msg = Message::new(
            KernelMessageType::KernelInfoRequest,
            Channel::Shell,
            "alice",
            "session-1",
            json!({}),
        );
        assert_eq!(msg.header.version, "5.0");
        assert_eq!(msg.header.username, "alice");
        assert_eq!(msg.header.session, "session-1");
        assert!(msg.parent_header.is_none());
        assert!(msg.metadata.is_empty());
        assert!(msg.buffers.is_empty());
        assert!(!msg.header.msg_id.is_empty());
    }

    #[test]
    fn each_message_gets_a_unique_msg_id() {
        let a = Message::new(
            KernelMessageType::KernelInfoRequest,
            Channel::Shell,
            "alice",
            "session-1",
            json!({}),
        );
        let b = Message::new(
            KernelMessageType::KernelInfoRequest,
            Channel::Shell,
            "alice",
            "session-1",
            json!({}),
        );
        assert_ne!(a.header.msg_id, b.header.msg_id);
    }

    #[test]
    fn channel_round_trips_through_str() {
        for ch in [Channel::Shell, Channel::IoPub, Channel::Stdin, Channel::Control] {
            let s = ch.as_str();
            let parsed: Channel = s.parse().unwrap();
            assert_eq!(ch, parsed);
        }
    }

    #[test]
    fn into_json_then_into_typed_round_trips_content() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Payload {
            x: i32,
        }
        let msg = Message::new(
            KernelMessageType::ExecuteRequest,
            Channel::Shell,
            "bob",
            "s",
            Payload { x: 42 },
        );
        let json_msg = msg.into_json().unwrap();
        let typed: Message<Payload> = json_msg.into_typed().unwrap();
        assert_eq!(typed.content, Payload { x: 42 });
    }
}
