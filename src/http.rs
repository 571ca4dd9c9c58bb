//! Minimal HTTP/1.1 plumbing for the daemon: request-head reading and
//! response-head formatting.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::RequestError;

/// Parsed HTTP request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target without the query string.
    pub path: String,
    pub version: String,
}

/// Read bytes until the blank line that ends the request head.
///
/// Anything after the head is discarded; SSE requests carry no body.
pub async fn read_request_head<R>(reader: &mut R, max_bytes: usize) -> Result<RequestHead, RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(RequestError::Incomplete);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let head = String::from_utf8_lossy(&buf[..end]);
            let request_line = head.lines().next().unwrap_or_default();
            return parse_request_line(request_line);
        }
        if buf.len() > max_bytes {
            return Err(RequestError::TooLarge(max_bytes));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse `METHOD target HTTP/x.y`.
pub fn parse_request_line(line: &str) -> Result<RequestHead, RequestError> {
    let malformed = || RequestError::MalformedRequestLine(line.chars().take(128).collect());

    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => return Err(malformed()),
    };

    if !version.starts_with("HTTP/") || !target.starts_with('/') {
        return Err(malformed());
    }

    let path = target.split('?').next().unwrap_or(target);

    Ok(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        version: version.to_string(),
    })
}

/// Reason phrase for the status codes the daemon emits.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        431 => "Request Header Fields Too Large",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

/// Value of the first header called `name`, compared case-insensitively.
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Serialize a status line and header block.
pub fn format_response_head(status: u16, headers: &[(String, String)]) -> Bytes {
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head.into()
}

/// Format a plain-text HTTP error response with the given status code and reason.
/// The reason is sanitized to prevent HTTP response splitting.
pub fn format_error_response(status: u16, reason: &str) -> String {
    let status_text = reason_phrase(status);
    let safe_reason: String = reason.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    let body = format!("{}: {}\n", status_text, safe_reason);
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        status_text,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let head = parse_request_line("GET /events?last=3 HTTP/1.1").unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/events");
        assert_eq!(head.version, "HTTP/1.1");
    }

    #[test]
    fn test_parse_request_line_rejects_garbage() {
        assert!(parse_request_line("").is_err());
        assert!(parse_request_line("GET /events").is_err());
        assert!(parse_request_line("GET events HTTP/1.1").is_err());
        assert!(parse_request_line("GET /events FTP/1.0").is_err());
        assert!(parse_request_line("GET /a HTTP/1.1 extra").is_err());
    }

    #[tokio::test]
    async fn test_read_request_head() {
        let raw: &[u8] = b"GET /events HTTP/1.1\r\nHost: localhost\r\nAccept: text/event-stream\r\n\r\n";
        let mut reader = raw;
        let head = read_request_head(&mut reader, 8192).await.unwrap();
        assert_eq!(head.path, "/events");
    }

    #[tokio::test]
    async fn test_read_request_head_incomplete() {
        let raw: &[u8] = b"GET /events HTTP/1.1\r\nHost: local";
        let mut reader = raw;
        let err = read_request_head(&mut reader, 8192).await.unwrap_err();
        assert!(matches!(err, RequestError::Incomplete));
    }

    #[tokio::test]
    async fn test_read_request_head_too_large() {
        let mut raw = b"GET /events HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat(b'a').take(4096));
        let mut reader = raw.as_slice();
        let err = read_request_head(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, RequestError::TooLarge(1024)));
    }

    #[test]
    fn test_format_response_head() {
        let head = format_response_head(
            200,
            &[("Content-Type".to_string(), "text/event-stream".to_string())],
        );
        assert_eq!(
            head.as_ref(),
            b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n"
        );
    }

    #[test]
    fn test_header_value_ignores_case() {
        let headers = vec![("Content-Type".to_string(), "text/event-stream".to_string())];
        assert_eq!(header_value(&headers, "content-type"), Some("text/event-stream"));
        assert_eq!(header_value(&headers, "Content-Length"), None);
    }

    #[test]
    fn test_format_error_response_404() {
        let resp = format_error_response(404, "No stream at /nope");
        assert!(resp.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(resp.contains("Connection: close\r\n"));
        let body = "Not Found: No stream at /nope\n";
        assert!(resp.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(resp.ends_with(body));
    }

    #[test]
    fn test_format_error_response_strips_newlines() {
        let resp = format_error_response(400, "bad\r\nX-Injected: 1");
        assert!(!resp.contains("\r\nX-Injected"));
        assert!(resp.contains("Bad Request: badX-Injected: 1"));
    }

    #[test]
    fn test_format_error_response_unknown_status() {
        let resp = format_error_response(500, "Something broke");
        assert!(resp.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }
}
