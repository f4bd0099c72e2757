//! One-shot HTTP/1.1 responder for client tests.

use std::net::SocketAddr;
use tokio::io::{ AsyncReadExt, AsyncWriteExt };
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// What the stub received.
#[derive(Debug, Clone)]
pub struct StubRequest {
    pub method: String,
    /// Path plus query, still percent-encoded.
    pub target: String,
    pub headers: String,
    pub body: Vec<u8>,
}

impl StubRequest {
    pub fn body_contains(&self, needle: &[u8]) -> bool {
        self.body.windows(needle.len()).any(|w| w == needle)
    }
}

/// Answer exactly one request with `status`, `content_type` and `body`.
/// The handle resolves to the request as received.
pub async fn serve_once(status: &str, content_type: &str, body: Vec<u8>) -> (SocketAddr, JoinHandle<StubRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let status = status.to_string();
    let content_type = content_type.to_string();

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_request(&mut stream).await;

        let mut reply = format!(
            "HTTP/1.1 {}\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            status,
            content_type,
            body.len()
        ).into_bytes();
        reply.extend_from_slice(&body);
        stream.write_all(&reply).await.unwrap();
        let _ = stream.shutdown().await;
        request
    });

    (addr, handle)
}

/// JSON convenience wrapper around [`serve_once`].
pub async fn serve_json(body: &str) -> (SocketAddr, JoinHandle<StubRequest>) {
    serve_once("200 OK", "application/json", body.as_bytes().to_vec()).await
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> StubRequest {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find(&raw, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before request head");
        raw.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let lower = head.to_ascii_lowercase();
    let content_length = lower
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok());
    let chunked = lower.contains("transfer-encoding: chunked");

    loop {
        let have = raw.len() - header_end;
        let done = match content_length {
            Some(len) => have >= len,
            None if chunked => raw.ends_with(b"0\r\n\r\n"),
            None => true,
        };
        if done {
            break;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..n]);
    }

    let mut first = head.lines().next().unwrap_or_default().split_whitespace();
    StubRequest {
        method: first.next().unwrap_or_default().to_string(),
        target: first.next().unwrap_or_default().to_string(),
        headers: head.clone(),
        body: raw[header_end..].to_vec(),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
