//! Outbound delivery seam
//!
//! A [`Transport`] takes a fully built request and reports the final status
//! code later through a [`CompletionSender`], carrying back the
//! [`CompletionToken`] it was given. Tokens are plain values; nothing about
//! the queue's memory crosses the seam.

mod loopback;
mod test;

use std::{fmt::Debug, sync::Arc};

pub use loopback::LoopbackTransport;
use serde::Deserialize;
use silo_store::MessageId;
pub use test::TestTransport;
use tokio::sync::mpsc;

use crate::{error::TransportError, queue::EntryHandle};

/// Request method used for every outbound message
pub const MESSAGE_METHOD: &str = "MESSAGE";

/// A message ready to be handed to the transaction layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: &'static str,
    pub uri: String,
    pub to: String,
    pub from: String,
    /// Extra headers, each terminated by CRLF
    pub headers: String,
    pub body: String,
    pub outbound_proxy: Option<String>,
}

/// Which path issued a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Redelivery driven by the retry queue
    Queue,
    /// Scheduled reminder; never retried
    Reminder,
}

/// Identifies the attempt a completion belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionToken {
    /// Queue slot of the attempt; `None` for reminders
    pub handle: Option<EntryHandle>,
    pub message_id: MessageId,
    pub retry_count: u32,
    pub origin: Origin,
}

impl CompletionToken {
    pub const fn queued(handle: EntryHandle, message_id: MessageId, retry_count: u32) -> Self {
        Self {
            handle: Some(handle),
            message_id,
            retry_count,
            origin: Origin::Queue,
        }
    }

    pub const fn reminder(message_id: MessageId) -> Self {
        Self {
            handle: None,
            message_id,
            retry_count: 0,
            origin: Origin::Reminder,
        }
    }
}

/// Final outcome of one send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub token: CompletionToken,
    pub code: u16,
}

impl Completion {
    pub const fn is_success(&self) -> bool {
        self.code < 300
    }
}

/// Where transports report outcomes
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: mpsc::UnboundedSender<Completion>,
}

pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

/// Create the completion channel shared by every transport call
pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CompletionSender { tx }, rx)
}

impl CompletionSender {
    /// Report the outcome of an attempt
    ///
    /// Returns `false` if the pipeline has already stopped listening.
    pub fn complete(&self, token: CompletionToken, code: u16) -> bool {
        self.tx.send(Completion { token, code }).is_ok()
    }
}

/// Outbound transaction primitive
pub trait Transport: Send + Sync + Debug {
    /// Start sending `request`; the outcome arrives later via `completion`
    ///
    /// # Errors
    /// When the request cannot be started at all. No completion is reported
    /// in that case.
    fn request_send(
        &self,
        request: OutboundRequest,
        completion: CompletionSender,
        token: CompletionToken,
    ) -> Result<(), TransportError>;

    /// Send `request` without caring about its outcome
    ///
    /// # Errors
    /// When the request cannot be started.
    fn notify(&self, request: OutboundRequest) -> Result<(), TransportError>;
}

/// Transport selection for the binary
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum TransportConfig {
    /// Answer every send locally with a fixed status code
    Loopback {
        #[serde(default = "default_loopback_code")]
        code: u16,
    },
}

const fn default_loopback_code() -> u16 {
    200
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Loopback {
            code: default_loopback_code(),
        }
    }
}

impl TransportConfig {
    pub fn build(&self) -> Arc<dyn Transport> {
        match self {
            Self::Loopback { code } => Arc::new(LoopbackTransport::new(*code)),
        }
    }
}
