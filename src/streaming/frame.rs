//! SSE wire-format fragments.

use bytes::Bytes;

use super::session::ConnectionId;
use crate::config::ConfigValue;

/// Acknowledgment comment written right after the headers.
pub const ACK: &[u8] = b":ok\n\n";

/// Event name used when the caller gives none.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// Status code of every event-stream response.
pub const SSE_STATUS: u16 = 200;

/// Fixed response headers, in the order they are set.
pub const SSE_HEADERS: [(&str, &str); 3] = [
    ("Content-Type", "text/event-stream"),
    ("Cache-Control", "no-cache, no-transform"),
    ("Connection", "keep-alive"),
];

/// Header carrying the advisory buffer size.
pub const CONTENT_LENGTH: &str = "Content-Length";

pub fn ack() -> Bytes {
    Bytes::from_static(ACK)
}

/// `event: <type>\n`
pub fn event_fragment(event_type: &str) -> Bytes {
    format!("event: {}\n", event_type).into()
}

/// `retry: <ms>\n`
pub fn retry_fragment(retry: &ConfigValue) -> Bytes {
    format!("retry: {}\n", retry).into()
}

/// `id: <connection id>\n`
pub fn id_fragment(id: &ConnectionId) -> Bytes {
    format!("id: {}\n", id).into()
}

/// `data: <data>\n\n`. No escaping: a newline inside `data` breaks the frame.
pub fn data_fragment(data: &str) -> Bytes {
    format!("data: {}\n\n", data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragments() {
        assert_eq!(ack().as_ref(), b":ok\n\n");
        assert_eq!(event_fragment("error").as_ref(), b"event: error\n");
        assert_eq!(retry_fragment(&ConfigValue::Number(1000)).as_ref(), b"retry: 1000\n");
        assert_eq!(id_fragment(&ConnectionId::from("abc")).as_ref(), b"id: abc\n");
        assert_eq!(data_fragment("foo").as_ref(), b"data: foo\n\n");
    }

    #[test]
    fn test_data_is_not_escaped() {
        assert_eq!(data_fragment("a\nb").as_ref(), b"data: a\nb\n\n");
    }
}
