use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use silo_store::MessageId;

use super::{CompletionSender, CompletionToken, OutboundRequest, Transport};
use crate::error::TransportError;

#[derive(Debug, Default)]
struct Script {
    default_code: u16,
    codes: VecDeque<u16>,
    reject: usize,
    sent: Vec<(OutboundRequest, CompletionToken)>,
    notified: Vec<OutboundRequest>,
}

/// Scriptable transport for tests
///
/// Records every request. Completions use queued codes first, then the
/// default.
#[derive(Debug, Clone)]
pub struct TestTransport {
    script: Arc<Mutex<Script>>,
}

impl TestTransport {
    #[must_use]
    pub fn new(default_code: u16) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                default_code,
                ..Script::default()
            })),
        }
    }

    /// Codes to answer the next sends with, in order
    pub fn push_codes(&self, codes: impl IntoIterator<Item = u16>) {
        self.script.lock().codes.extend(codes);
    }

    /// Refuse the next `times` sends synchronously
    pub fn reject_next(&self, times: usize) {
        self.script.lock().reject += times;
    }

    #[must_use]
    pub fn sent(&self) -> Vec<(OutboundRequest, CompletionToken)> {
        self.script.lock().sent.clone()
    }

    #[must_use]
    pub fn notified(&self) -> Vec<OutboundRequest> {
        self.script.lock().notified.clone()
    }

    /// Retry counters of every send for one message, oldest first
    #[must_use]
    pub fn attempts(&self, message_id: MessageId) -> Vec<u32> {
        self.script
            .lock()
            .sent
            .iter()
            .filter(|(_, token)| token.message_id == message_id)
            .map(|(_, token)| token.retry_count)
            .collect()
    }
}

impl Transport for TestTransport {
    fn request_send(
        &self,
        request: OutboundRequest,
        completion: CompletionSender,
        token: CompletionToken,
    ) -> Result<(), TransportError> {
        let mut script = self.script.lock();

        if script.reject > 0 {
            script.reject -= 1;
            return Err(TransportError::Rejected("scripted rejection".to_string()));
        }

        script.sent.push((request, token));

        let code = script.codes.pop_front().unwrap_or(script.default_code);
        drop(script);
        completion.complete(token, code);
        Ok(())
    }

    fn notify(&self, request: OutboundRequest) -> Result<(), TransportError> {
        self.script.lock().notified.push(request);
        Ok(())
    }
}
