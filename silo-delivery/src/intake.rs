//! Producer paths: storing messages for offline recipients, and queueing
//! them once the recipient is reachable again

use silo_store::{Condition, Connection, MessageId, Value};
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, IntakeError},
    message::{DEFAULT_CONTENT_TYPE, build_headers, is_sip_uri},
    processor::context::DeliveryContext,
    transport::{MESSAGE_METHOD, OutboundRequest},
};

/// Delay before a freshly dumped message becomes eligible, in seconds
pub const DUMP_DELAY_SECS: i64 = 3;

/// An already parsed message to keep for an offline recipient
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreRequest {
    /// Sender address
    pub from: String,
    /// Recipient address, used as the request URI on redelivery
    pub to: String,
    /// User part of the recipient's address of record
    pub owner_user: String,
    /// Host part of the recipient's address of record
    pub owner_host: String,
    pub body: String,
    /// Defaults to `text/plain`
    pub content_type: Option<String>,
    /// Lifetime requested by the sender, in seconds
    pub expires: Option<i64>,
    /// Unix time a reminder should go out at
    pub send_time: Option<i64>,
    /// Sender's contact URI, the preferred target of the offline notification
    pub contact: Option<String>,
}

/// Persist `request`, optionally telling the sender it was stored
///
/// # Errors
/// [`IntakeError`] when the request is refused, or the store error if the
/// row cannot be written.
pub fn store_message(
    context: &DeliveryContext,
    conn: &mut dyn Connection,
    request: &StoreRequest,
    now: i64,
) -> Result<MessageId, DeliveryError> {
    let settings = &context.settings;
    let schema = &settings.schema;

    if request.body.is_empty() {
        return Err(IntakeError::EmptyBody.into());
    }
    if request.owner_user.is_empty() {
        return Err(IntakeError::MissingUser.into());
    }

    if settings.max_messages > 0 {
        let stored = conn
            .query(&owner_filter(context, request), &[schema.mid.as_str()], None)?
            .len();

        if stored >= settings.max_messages {
            return Err(IntakeError::QuotaExceeded {
                owner: format!("{}@{}", request.owner_user, request.owner_host),
                limit: settings.max_messages,
            }
            .into());
        }
    }

    let lifetime = match request.expires {
        Some(expires) if expires > 0 => expires.min(settings.expire_time_secs),
        _ => settings.expire_time_secs,
    };
    let content_type = request
        .content_type
        .as_deref()
        .filter(|c| !c.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE);

    let message_id = conn.insert(&[
        (schema.from.as_str(), Value::from(request.from.as_str())),
        (schema.to.as_str(), Value::from(request.to.as_str())),
        (schema.uri_user.as_str(), Value::from(request.owner_user.as_str())),
        (schema.uri_host.as_str(), Value::from(request.owner_host.as_str())),
        (schema.body.as_str(), Value::from(request.body.as_str())),
        (schema.ctype.as_str(), Value::from(content_type)),
        (schema.exp_time.as_str(), Value::Int(now + lifetime)),
        (schema.inc_time.as_str(), Value::Int(now)),
        (schema.snd_time.as_str(), Value::Int(request.send_time.unwrap_or(0))),
    ])?;

    context.stats.record_stored();
    info!(
        %message_id,
        "Stored message for {}@{}",
        request.owner_user,
        request.owner_host
    );

    notify_sender(context, request);

    Ok(message_id)
}

/// Tell the sender the recipient is offline, when configured to
fn notify_sender(context: &DeliveryContext, request: &StoreRequest) {
    let settings = &context.settings;
    let (Some(from), Some(body)) = (&settings.from_address, &settings.offline_message) else {
        return;
    };

    let uri = request
        .contact
        .as_deref()
        .filter(|contact| settings.use_contact && is_sip_uri(contact))
        .unwrap_or(request.from.as_str());

    let notification = OutboundRequest {
        method: MESSAGE_METHOD,
        uri: uri.to_string(),
        to: request.from.clone(),
        from: from.clone(),
        headers: build_headers(
            settings.content_type_hdr.as_deref().unwrap_or_default(),
            settings.contact_hdr.as_deref(),
        ),
        body: body.clone(),
        outbound_proxy: settings.outbound_proxy.clone(),
    };

    debug!("Sending offline notification to {uri}");
    if let Err(e) = context.transport.notify(notification) {
        warn!("Failed to send offline notification: {e}");
    }
}

fn owner_filter(context: &DeliveryContext, request: &StoreRequest) -> [Condition; 2] {
    let schema = &context.settings.schema;
    [
        Condition::eq(schema.uri_user.as_str(), request.owner_user.as_str()),
        Condition::eq(schema.uri_host.as_str(), request.owner_host.as_str()),
    ]
}

/// Queue every unscheduled message stored for `user@host`
///
/// Messages the ledger already knows about are skipped, so calling this
/// repeatedly never queues a message twice. Returns how many were queued.
///
/// # Errors
/// If the stored messages cannot be listed.
pub fn dump(
    context: &DeliveryContext,
    conn: &mut dyn Connection,
    user: &str,
    host: &str,
    now: i64,
) -> Result<usize, DeliveryError> {
    let schema = &context.settings.schema;

    let rows = conn.query(
        &[
            Condition::eq(schema.uri_user.as_str(), user),
            Condition::eq(schema.uri_host.as_str(), host),
            Condition::eq(schema.snd_time.as_str(), 0_i64),
        ],
        &[schema.mid.as_str()],
        Some(schema.mid.as_str()),
    )?;

    if rows.is_empty() {
        debug!("No stored messages for {user}@{host}");
        return Ok(0);
    }

    let not_before = now + DUMP_DELAY_SECS;
    let mut queued = 0;

    for message_id in rows.iter().filter_map(|row| row.message_id(0)) {
        if context.ledger.check_message(message_id).already_handled {
            debug!(%message_id, "Already handled, skipping");
            continue;
        }

        let added = context
            .signal
            .with_queue(|queue| queue.add(message_id, 0, not_before));

        match added {
            Ok(_) => queued += 1,
            Err(e) => {
                // Stays in the store for the next dump
                warn!(%message_id, "Unable to queue stored message: {e}");
                context.ledger.forget(&[message_id]);
            }
        }
    }

    if queued > 0 {
        context.signal.notify();
        info!("Queued {queued} of {} stored messages for {user}@{host}", rows.len());
    }

    Ok(queued)
}
