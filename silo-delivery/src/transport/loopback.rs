use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::{CompletionSender, CompletionToken, OutboundRequest, Transport};
use crate::error::TransportError;

/// Transport that never leaves the process
///
/// Every send completes immediately with the configured status code.
#[derive(Debug)]
pub struct LoopbackTransport {
    code: u16,
    sent: AtomicU64,
}

impl LoopbackTransport {
    pub const fn new(code: u16) -> Self {
        Self {
            code,
            sent: AtomicU64::new(0),
        }
    }

    /// Requests accepted so far, notifications included
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Transport for LoopbackTransport {
    fn request_send(
        &self,
        request: OutboundRequest,
        completion: CompletionSender,
        token: CompletionToken,
    ) -> Result<(), TransportError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        debug!(
            message_id = %token.message_id,
            uri = %request.uri,
            code = self.code,
            "loopback {}",
            request.method
        );

        if completion.complete(token, self.code) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn notify(&self, request: OutboundRequest) -> Result<(), TransportError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        debug!(uri = %request.uri, "loopback notification");
        Ok(())
    }
}
