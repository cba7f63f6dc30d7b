//! HTTP/1.1 request serialization.

/// Request line and headers for a single HTTP/1.1 request.
///
/// `host`, `content-length` and `transfer-encoding` are owned by the encoder:
/// caller-supplied copies of those headers are dropped so the framing always
/// matches the body actually written.
#[derive(Debug, Clone)]
pub struct RequestHead<'a> {
    pub method: &'a str,
    pub target: &'a str,
    pub host: &'a str,
    pub headers: Vec<(&'a str, &'a str)>,
}

impl<'a> RequestHead<'a> {
    pub fn new(method: &'a str, target: &'a str, host: &'a str) -> Self {
        Self {
            method,
            target,
            host,
            headers: Vec::new(),
        }
    }

    /// Append a header. Order is preserved on the wire.
    pub fn header(mut self, name: &'a str, value: &'a str) -> Self {
        self.headers.push((name, value));
        self
    }
}

/// Serialize `head` and `body` into `buf`, returning the number of bytes written.
pub fn encode_request(head: &RequestHead<'_>, body: &[u8], buf: &mut Vec<u8>) -> usize {
    let start = buf.len();
    buf.reserve(128 + body.len());

    buf.extend_from_slice(head.method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(head.target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    buf.extend_from_slice(b"host: ");
    buf.extend_from_slice(head.host.as_bytes());
    buf.extend_from_slice(b"\r\n");

    for (name, value) in &head.headers {
        if is_framing_header(name) {
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if !body.is_empty() || method_carries_body(head.method) {
        buf.extend_from_slice(b"content-length: ");
        buf.extend_from_slice(body.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);

    buf.len() - start
}

fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
}

fn method_carries_body(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "PATCH")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(head: &RequestHead<'_>, body: &[u8]) -> String {
        let mut buf = Vec::new();
        let n = encode_request(head, body, &mut buf);
        assert_eq!(n, buf.len());
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn get_without_body() {
        let head = RequestHead::new("GET", "/index.html", "example.com").header("accept", "*/*");
        assert_eq!(
            encode(&head, &[]),
            "GET /index.html HTTP/1.1\r\nhost: example.com\r\naccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn post_with_body_sets_length() {
        let head = RequestHead::new("POST", "/submit", "127.0.0.1:8080");
        let wire = encode(&head, b"hello");
        assert!(wire.contains("content-length: 5\r\n"));
        assert!(wire.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn empty_post_sends_zero_length() {
        let head = RequestHead::new("POST", "/", "h");
        assert!(encode(&head, &[]).contains("content-length: 0\r\n"));
    }

    #[test]
    fn framing_headers_from_caller_are_dropped() {
        let head = RequestHead::new("PUT", "/", "real-host")
            .header("Host", "spoofed")
            .header("Content-Length", "999")
            .header("Transfer-Encoding", "chunked")
            .header("x-keep", "1");
        let wire = encode(&head, b"ab");
        assert!(!wire.contains("spoofed"));
        assert!(!wire.contains("999"));
        assert!(!wire.contains("chunked"));
        assert!(wire.contains("x-keep: 1\r\n"));
        assert!(wire.contains("content-length: 2\r\n"));
    }

    #[test]
    fn appends_to_existing_buffer() {
        let mut buf = b"prefix".to_vec();
        let n = encode_request(&RequestHead::new("GET", "/", "h"), &[], &mut buf);
        assert_eq!(buf.len(), 6 + n);
        assert!(buf.starts_with(b"prefixGET / HTTP/1.1\r\n"));
    }
}
