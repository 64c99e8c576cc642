//! Outbound request building: extra headers, body decoration, and URIs

use chrono::DateTime;

/// Content type assumed when none was stored
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// What a body is being decorated for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// Redelivery of a stored message; stamped with its arrival time
    Offline,
    /// Scheduled reminder; stamped with its send time
    Reminder,
}

impl BodyKind {
    const fn label(self) -> &'static str {
        match self {
            Self::Offline => "Offline message",
            Self::Reminder => "Reminder message",
        }
    }
}

/// Extra headers for an outbound message, each terminated by CRLF
pub fn build_headers(content_type: &str, contact: Option<&str>) -> String {
    let content_type = if content_type.is_empty() {
        DEFAULT_CONTENT_TYPE
    } else {
        content_type
    };

    let mut headers = format!("Content-Type: {content_type}\r\n");
    if let Some(contact) = contact.filter(|c| !c.is_empty()) {
        headers.push_str("Contact: ");
        headers.push_str(contact);
        headers.push_str("\r\n");
    }
    headers
}

/// Body to send for a stored message
///
/// Plain text bodies get a `[<kind> - <date>] ` prefix when `add_date` is set;
/// anything else is sent unchanged.
pub fn build_body(
    body: &str,
    content_type: &str,
    kind: BodyKind,
    at: i64,
    add_date: bool,
) -> String {
    let plain = content_type.is_empty()
        || content_type
            .split(';')
            .next()
            .is_some_and(|t| t.trim().eq_ignore_ascii_case(DEFAULT_CONTENT_TYPE));

    if !add_date || !plain || at <= 0 {
        return body.to_string();
    }

    match format_date(at) {
        Some(date) => format!("[{} - {date}] {body}", kind.label()),
        None => body.to_string(),
    }
}

/// RFC 2822 rendering of a unix timestamp
pub fn format_date(timestamp: i64) -> Option<String> {
    DateTime::from_timestamp(timestamp, 0).map(|dt| dt.to_rfc2822())
}

/// `sip:user@host`
pub fn sip_uri(user: &str, host: &str) -> String {
    format!("sip:{user}@{host}")
}

/// Whether `uri` can be used as a notification target
pub fn is_sip_uri(uri: &str) -> bool {
    uri.len() > 4 && uri.get(..4).is_some_and(|scheme| scheme.eq_ignore_ascii_case("sip:"))
}
