//! Wire message types for the extension ↔ host protocol.
//!
//! Both directions carry length-prefixed JSON (see [`super::FrameCodec`]).
//! Every envelope carries a correlation id linking a request to its
//! response frames; a streaming `processContent` operation emits any
//! number of `content` frames followed by exactly one terminal frame
//! (`done`, `error`, or `cancelled`).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request sent from the extension to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Correlation id, generated by the peer, unique per logical operation.
    pub id: Uuid,

    /// Optional override for the fabric-ai executable path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(flatten)]
    pub payload: RequestPayload,
}

/// Operation-specific request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RequestPayload {
    /// Handshake: probe the tool and report its path, version, validity.
    Ping,

    /// Enumerate available patterns (single-shot invocation).
    ListPatterns,

    /// Enumerate available contexts (single-shot invocation).
    ListContexts,

    /// Run the tool over `content`, streaming stdout back line by line.
    #[serde(rename_all = "camelCase")]
    ProcessContent {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_prompt: Option<String>,
    },

    /// Terminate the in-flight operation identified by `request_id`.
    #[serde(rename_all = "camelCase")]
    CancelProcess { request_id: Uuid },
}

/// Response sent from the host to the extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Correlation id of the request this frame answers.
    pub id: Uuid,

    #[serde(flatten)]
    pub payload: ResponsePayload,
}

/// Operation-specific response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResponsePayload {
    /// Handshake result. `valid: false` means the tool is unusable and the
    /// peer should treat the connection as failed.
    #[serde(rename_all = "camelCase")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolved_path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        valid: bool,
    },

    /// Available pattern names.
    PatternsList { patterns: Vec<String> },

    /// Available context names.
    ContextsList { contexts: Vec<String> },

    /// One line of streamed tool output. Repeatable.
    Content { content: String },

    /// Terminal: the tool exited. `exit_code` is `None` when the process
    /// was terminated by a signal.
    #[serde(rename_all = "camelCase")]
    Done {
        #[serde(default)]
        exit_code: Option<i32>,
    },

    /// Terminal: the operation failed.
    Error { message: String },

    /// Terminal for the stream named by `request_id`; `id` correlates to
    /// the `cancelProcess` request itself.
    #[serde(rename_all = "camelCase")]
    Cancelled { request_id: Uuid },
}

impl ResponsePayload {
    /// Whether this frame ends a streaming operation.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done { .. } | Self::Error { .. } | Self::Cancelled { .. }
        )
    }
}
