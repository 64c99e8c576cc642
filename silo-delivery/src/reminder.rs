//! Scheduled reminders
//!
//! Messages stored with a send time are delivered as reminders once that
//! time has passed. Reminders bypass the retry queue: a failed reminder is
//! marked as such and the reconciler clears its send time.

use silo_store::{Condition, Connection, Op};
use tracing::{debug, info, warn};

use crate::{
    error::DeliveryError,
    ledger::Flags,
    message::{BodyKind, build_body, build_headers, sip_uri},
    processor::context::DeliveryContext,
    transport::{CompletionToken, MESSAGE_METHOD, OutboundRequest},
    worker::LOCAL_FAILURE_CODE,
};

const MID: usize = 0;
const USER: usize = 1;
const HOST: usize = 2;
const BODY: usize = 3;
const CTYPE: usize = 4;
const SND_TIME: usize = 5;

/// Send every reminder due at `now`
///
/// Does nothing unless a reminder address is configured. Returns how many
/// reminders were handed to the transport.
///
/// # Errors
/// If due reminders cannot be listed.
pub fn send_due(
    context: &DeliveryContext,
    conn: &mut dyn Connection,
    now: i64,
) -> Result<usize, DeliveryError> {
    let settings = &context.settings;
    let Some(reminder) = settings.reminder.as_deref() else {
        return Ok(0);
    };
    let schema = &settings.schema;

    let rows = conn.query(
        &[
            Condition::new(schema.snd_time.as_str(), Op::Neq, 0_i64),
            Condition::new(schema.snd_time.as_str(), Op::Leq, now),
        ],
        &[
            schema.mid.as_str(),
            schema.uri_user.as_str(),
            schema.uri_host.as_str(),
            schema.body.as_str(),
            schema.ctype.as_str(),
            schema.snd_time.as_str(),
        ],
        Some(schema.mid.as_str()),
    )?;

    let mut sent = 0;

    for row in &rows {
        let Some(message_id) = row.message_id(MID) else {
            continue;
        };

        if context.ledger.check_message(message_id).already_handled {
            debug!(%message_id, "Reminder already sent");
            continue;
        }

        let uri = sip_uri(
            &row.text(USER).unwrap_or_default(),
            &row.text(HOST).unwrap_or_default(),
        );
        let ctype = row.text(CTYPE).unwrap_or_default();

        let request = OutboundRequest {
            method: MESSAGE_METHOD,
            uri: uri.clone(),
            to: uri,
            from: reminder.to_string(),
            headers: build_headers(&ctype, settings.contact_hdr.as_deref()),
            body: build_body(
                &row.text(BODY).unwrap_or_default(),
                &ctype,
                BodyKind::Reminder,
                row.int(SND_TIME).unwrap_or_default(),
                settings.add_date,
            ),
            outbound_proxy: settings.outbound_proxy.clone(),
        };

        context.ledger.set_flag(message_id, Flags::REMINDER);
        let token = CompletionToken::reminder(message_id);

        debug!(%message_id, "Sending reminder to {}", request.uri);
        if let Err(e) = context
            .transport
            .request_send(request, context.completions.clone(), token)
        {
            warn!(%message_id, "Transport refused reminder: {e}");
            context.completions.complete(token, LOCAL_FAILURE_CODE);
        }
        sent += 1;
    }

    if sent > 0 {
        info!("Sent {sent} reminders");
    }

    Ok(sent)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        completion::{Outcome, handle_completion},
        processor::context::Settings,
        testing::Fixture,
    };

    fn with_reminder() -> Fixture {
        Fixture::with_settings(Settings {
            reminder: Some("sip:reminder@example.org".to_string()),
            ..Settings::default()
        })
    }

    #[test]
    fn test_disabled_without_address() {
        let fixture = Fixture::new();
        fixture.insert_with("alice", "due", 10_000, 50);
        let mut conn = fixture.context.connect().unwrap();

        assert_eq!(send_due(&fixture.context, conn.as_mut(), 100).unwrap(), 0);
        assert!(fixture.transport.sent().is_empty());
    }

    #[test]
    fn test_sends_only_due_reminders_once() {
        let fixture = with_reminder();
        let due = fixture.insert_with("alice", "due", 10_000, 1_700_000_000);
        fixture.insert_with("alice", "future", 10_000, 1_800_000_000);
        fixture.insert("alice", "plain");
        let mut conn = fixture.context.connect().unwrap();

        let now = 1_750_000_000;
        assert_eq!(send_due(&fixture.context, conn.as_mut(), now).unwrap(), 1);
        assert_eq!(send_due(&fixture.context, conn.as_mut(), now).unwrap(), 0);

        let sent = fixture.transport.sent();
        let (request, token) = &sent[0];
        assert_eq!(token, &CompletionToken::reminder(due));
        assert_eq!(request.uri, "sip:alice@example.org");
        assert_eq!(request.from, "sip:reminder@example.org");
        assert_eq!(
            request.body,
            "[Reminder message - Tue, 14 Nov 2023 22:13:20 +0000] due"
        );
        assert_eq!(
            fixture.context.ledger.get(due).unwrap().flags,
            Flags::SENT | Flags::REMINDER
        );
    }

    #[test]
    fn test_failed_reminder_is_not_queued() {
        let fixture = with_reminder();
        let id = fixture.insert_with("bob", "ping", 10_000, 10);
        fixture.transport.push_codes([486]);
        let mut conn = fixture.context.connect().unwrap();

        send_due(&fixture.context, conn.as_mut(), 100).unwrap();
        let completion = fixture.next_completion(std::time::Duration::from_secs(1)).unwrap();

        assert_eq!(handle_completion(&fixture.context, completion), Outcome::Failed);
        assert!(
            fixture
                .context
                .ledger
                .get(id)
                .unwrap()
                .flags
                .contains(Flags::REMINDER | Flags::ERROR)
        );
        assert_eq!(fixture.context.signal.with_queue(|q| q.len()), 0);
    }
}
