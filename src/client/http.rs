//! HTTP/1.1 upstream client.
//!
//! Hand-rolled on top of [`ClientSession`]: requests are serialized
//! directly, responses are parsed with a streaming `httparse` loop under the
//! session's read deadline. The client stays usable across requests when the
//! server keeps the connection alive.

use std::io;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::client::future::TIMEOUT_ERR;
use crate::client::session::ClientSession;
use crate::types::HttpMethod;

const READ_CHUNK: usize = 32 * 1024;
const MAX_RESPONSE_HEADERS: usize = 64;

/// A parsed HTTP response.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub keep_alive: bool,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An outgoing request. `query` is appended to `path` with `?`.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub keep_alive: bool,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        HttpRequest {
            method,
            path: path.into(),
            query: String::new(),
            headers: Vec::new(),
            keep_alive: true,
            body: Bytes::new(),
        }
    }
}

/// HTTP/1.1 client bound to one upstream `host:port`.
pub struct HttpClient {
    session: ClientSession,
    buf: BytesMut,
    can_retry: bool,
}

impl HttpClient {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        HttpClient {
            session: ClientSession::new(host, port),
            buf: BytesMut::with_capacity(READ_CHUNK),
            can_retry: true,
        }
    }

    pub fn host(&self) -> &str {
        self.session.host()
    }

    pub fn port(&self) -> &str {
        self.session.port()
    }

    /// Whether the last failed exchange may be retried on another node.
    /// Only 400 and 404 responses clear this.
    pub fn can_retry(&self) -> bool {
        self.can_retry
    }

    /// Serializes and writes a request. `timeout_ms` sets the read deadline
    /// (connect gets twice that); zero disables both deadlines, which the
    /// discovery long-polls rely on.
    pub async fn send_http_request(&mut self, req: &HttpRequest, timeout_ms: u64) -> io::Result<()> {
        self.can_retry = true;
        self.session.set_timeout(timeout_ms * 2, timeout_ms);
        if !self.session.is_open() {
            // Stale bytes from a torn-down exchange must not leak into the
            // next response parse.
            self.buf.clear();
        }

        let mut target = req.path.clone();
        if !req.query.is_empty() {
            target.push('?');
            target.push_str(&req.query);
        }
        let mut head = format!("{} {} HTTP/1.1\r\n", req.method.as_str(), target);
        head.push_str(&format!("Host: {}:{}\r\n", self.host(), self.port()));
        head.push_str(&format!("Content-Length: {}\r\n", req.body.len()));
        head.push_str(if req.keep_alive {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        for (name, value) in &req.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");

        let mut wire = BytesMut::with_capacity(head.len() + req.body.len());
        wire.extend_from_slice(head.as_bytes());
        wire.extend_from_slice(&req.body);
        self.session.send_data(&wire).await
    }

    /// Convenience wrapper: splits an embedded query off `path` and sends a
    /// keep-alive request.
    pub async fn send_request(
        &mut self,
        path: &str,
        method: HttpMethod,
        body: Bytes,
        timeout_ms: u64,
    ) -> io::Result<()> {
        let (path_only, query) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (path.to_string(), String::new()),
        };
        let req = HttpRequest {
            method,
            path: path_only,
            query,
            headers: Vec::new(),
            keep_alive: true,
            body,
        };
        self.send_http_request(&req, timeout_ms).await
    }

    async fn read_more(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.session.read_some(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            ));
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Runs the streaming parser to one complete response. Closes the
    /// session on `Connection: close`, EOF, and deadline expiry.
    pub async fn get_http_response(&mut self) -> io::Result<HttpResponse> {
        loop {
            if let Some((rsp, consumed)) = self.try_parse_head()? {
                return self.finish_body(rsp, consumed).await;
            }
            if let Err(e) = self.read_more().await {
                self.session.shutdown(true);
                return Err(e);
            }
        }
    }

    fn try_parse_head(&self) -> io::Result<Option<(HttpResponse, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed.parse(&self.buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let status = parsed.code.unwrap_or(0);
                let minor = parsed.version.unwrap_or(1);
                let mut rsp = HttpResponse {
                    status,
                    reason: parsed.reason.unwrap_or("").to_string(),
                    keep_alive: minor == 1,
                    headers: parsed
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_string(),
                                String::from_utf8_lossy(h.value).into_owned(),
                            )
                        })
                        .collect(),
                    body: Bytes::new(),
                };
                if let Some(conn) = rsp.header("Connection") {
                    rsp.keep_alive = !conn.eq_ignore_ascii_case("close")
                        && (minor == 1 || conn.eq_ignore_ascii_case("keep-alive"));
                }
                Ok(Some((rsp, head_len)))
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(e) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed response: {e}"),
            )),
        }
    }

    async fn finish_body(&mut self, mut rsp: HttpResponse, head_len: usize) -> io::Result<HttpResponse> {
        let content_length = rsp
            .header("Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok());
        let chunked = rsp
            .header("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        if chunked {
            loop {
                match decode_chunked(&self.buf[head_len..]) {
                    ChunkedStatus::Complete(body, consumed) => {
                        rsp.body = Bytes::from(body);
                        let _ = self.buf.split_to(head_len + consumed);
                        break;
                    }
                    ChunkedStatus::Partial => {
                        if let Err(e) = self.read_more().await {
                            self.session.shutdown(true);
                            return Err(e);
                        }
                    }
                    ChunkedStatus::Error => {
                        self.session.shutdown(true);
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "malformed chunked body",
                        ));
                    }
                }
            }
        } else if let Some(len) = content_length {
            while self.buf.len() < head_len + len {
                if let Err(e) = self.read_more().await {
                    self.session.shutdown(true);
                    return Err(e);
                }
            }
            let _ = self.buf.split_to(head_len);
            rsp.body = self.buf.split_to(len).freeze();
        } else {
            // No framing: the body runs until the server closes.
            loop {
                match self.read_more().await {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                    Err(e) => {
                        self.session.shutdown(true);
                        return Err(e);
                    }
                }
            }
            let _ = self.buf.split_to(head_len);
            rsp.body = self.buf.split().freeze();
            rsp.keep_alive = false;
        }

        if !rsp.keep_alive {
            debug!("http session closed");
            self.session.shutdown(true);
            self.buf.clear();
        }
        Ok(rsp)
    }

    /// Reads one response and reduces it to the body-or-error contract the
    /// forward manager uses: `Ok(body)` on 200, otherwise the status/transport
    /// message. 400 and 404 clear `can_retry`.
    pub async fn get_response(&mut self) -> Result<Bytes, String> {
        self.can_retry = true;
        match self.get_http_response().await {
            Ok(rsp) => {
                if rsp.status == 200 {
                    Ok(rsp.body)
                } else {
                    debug!(status = rsp.status, "get http response failed");
                    if rsp.status == 400 || rsp.status == 404 {
                        self.can_retry = false;
                    }
                    if rsp.reason.is_empty() {
                        Err(format!("HTTP status {}", rsp.status))
                    } else {
                        Err(rsp.reason)
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(TIMEOUT_ERR.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}

enum ChunkedStatus {
    Complete(Vec<u8>, usize),
    Partial,
    Error,
}

/// Decodes a chunked body if it is complete in `data`, reporting how many
/// input bytes it spanned.
fn decode_chunked(data: &[u8]) -> ChunkedStatus {
    let mut body = Vec::new();
    let mut pos = 0usize;
    loop {
        let Some(line_end) = find_crlf(&data[pos..]) else {
            return ChunkedStatus::Partial;
        };
        let size_line = &data[pos..pos + line_end];
        let size_text = match std::str::from_utf8(size_line) {
            Ok(t) => t.split(';').next().unwrap_or("").trim(),
            Err(_) => return ChunkedStatus::Error,
        };
        let Ok(size) = usize::from_str_radix(size_text, 16) else {
            return ChunkedStatus::Error;
        };
        pos += line_end + 2;
        if size == 0 {
            // Trailer section: skip to the blank line.
            loop {
                let Some(end) = find_crlf(&data[pos..]) else {
                    return ChunkedStatus::Partial;
                };
                pos += end + 2;
                if end == 0 {
                    return ChunkedStatus::Complete(body, pos);
                }
            }
        }
        if data.len() < pos + size + 2 {
            return ChunkedStatus::Partial;
        }
        body.extend_from_slice(&data[pos..pos + size]);
        if &data[pos + size..pos + size + 2] != b"\r\n" {
            return ChunkedStatus::Error;
        }
        pos += size + 2;
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn one_shot_server(response: &'static [u8]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(response).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn parses_content_length_response() {
        let addr =
            one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong").await;
        let mut client = HttpClient::new(addr.ip().to_string(), addr.port().to_string());
        client
            .send_request("/ping", HttpMethod::Get, Bytes::new(), 1_000)
            .await
            .unwrap();
        let body = client.get_response().await.expect("expected 200");
        assert_eq!(body.as_ref(), b"pong");
        assert!(client.can_retry());
    }

    #[tokio::test]
    async fn chunked_bodies_are_reassembled() {
        let addr = one_shot_server(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\npo\r\n\r\n2\r\nng\r\n0\r\n\r\n",
        )
        .await;
        let mut client = HttpClient::new(addr.ip().to_string(), addr.port().to_string());
        client
            .send_request("/chunky", HttpMethod::Get, Bytes::new(), 1_000)
            .await
            .unwrap();
        let body = client.get_response().await.expect("expected 200");
        assert_eq!(body.as_ref(), b"po\r\nng");
    }

    #[tokio::test]
    async fn not_found_disables_retry() {
        let addr = one_shot_server(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        let mut client = HttpClient::new(addr.ip().to_string(), addr.port().to_string());
        client
            .send_request("/nope", HttpMethod::Get, Bytes::new(), 1_000)
            .await
            .unwrap();
        let err = client.get_response().await.unwrap_err();
        assert_eq!(err, "Not Found");
        assert!(!client.can_retry());
    }

    #[tokio::test]
    async fn stalled_server_yields_timeout_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });
        let mut client = HttpClient::new(addr.ip().to_string(), addr.port().to_string());
        client
            .send_request("/slow", HttpMethod::Get, Bytes::new(), 30)
            .await
            .unwrap();
        let err = client.get_response().await.unwrap_err();
        assert_eq!(err, TIMEOUT_ERR);
        assert!(client.can_retry());
    }

    #[test]
    fn chunked_decoder_handles_partial_input() {
        assert!(matches!(decode_chunked(b"4\r\npo"), ChunkedStatus::Partial));
        assert!(matches!(decode_chunked(b"zz\r\n"), ChunkedStatus::Error));
        match decode_chunked(b"2\r\nhi\r\n0\r\n\r\nleftover") {
            ChunkedStatus::Complete(body, consumed) => {
                assert_eq!(body, b"hi");
                assert_eq!(consumed, 12);
            }
            _ => panic!("expected complete"),
        }
    }
}
