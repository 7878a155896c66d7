//! Synchronous outbound HTTP client used to forward requests to backends
//!
//! A new client is built for every forward. Backends come and go between
//! scans, so there is nothing worth keeping warm per port.

use hyper::body::Bytes;
use hyper::{HeaderMap, StatusCode};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Request headers that describe the inbound body, which is never forwarded
const BODY_FRAMING_HEADERS: [&str; 2] = ["content-length", "transfer-encoding"];

/// A GET to be issued against `127.0.0.1:<port>`
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub port: u16,
    /// Path plus optional query string, starting with `/`
    pub path_and_query: String,
    pub headers: HeaderMap,
}

impl UpstreamRequest {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }

    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr(), self.path_and_query)
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("failed to connect to {addr}: {message}")]
    Connect { addr: SocketAddr, message: String },

    #[error("request to {addr} timed out after {} seconds", .timeout.as_secs())]
    Timeout { addr: SocketAddr, timeout: Duration },

    #[error("request to {addr} failed: {message}")]
    Transport { addr: SocketAddr, message: String },

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Performs the forward for the router
pub trait Upstream: Send + Sync {
    fn get(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}

/// Blocking HTTP/1.1 client, one per request
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn map_error(&self, addr: SocketAddr, e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            UpstreamError::Timeout {
                addr,
                timeout: self.timeout,
            }
        } else if e.is_connect() {
            UpstreamError::Connect {
                addr,
                message: e.to_string(),
            }
        } else {
            UpstreamError::Transport {
                addr,
                message: e.to_string(),
            }
        }
    }
}

impl Upstream for HttpUpstream {
    fn get(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let addr = request.addr();
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .pool_max_idle_per_host(0)
            .no_proxy()
            .build()
            .map_err(|e| UpstreamError::Client(e.to_string()))?;

        let response = client
            .get(request.url())
            .headers(convert_headers(&request.headers))
            .send()
            .map_err(|e| self.map_error(addr, e))?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let body = response.bytes().map_err(|e| self.map_error(addr, e))?;

        Ok(UpstreamResponse { status, body })
    }
}

/// Copy inbound headers into reqwest's header map
fn convert_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if BODY_FRAMING_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let name = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes());
        let value = reqwest::header::HeaderValue::from_bytes(value.as_bytes());
        if let (Ok(name), Ok(value)) = (name, value) {
            out.append(name, value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn request(port: u16, path: &str, headers: HeaderMap) -> UpstreamRequest {
        UpstreamRequest {
            port,
            path_and_query: path.to_string(),
            headers,
        }
    }

    #[test]
    fn test_url_targets_loopback() {
        let req = request(9005, "/produce?shift=1", HeaderMap::new());
        assert_eq!(req.url(), "http://127.0.0.1:9005/produce?shift=1");
    }

    #[test]
    fn test_convert_headers_keeps_duplicates_and_drops_framing() {
        let mut headers = HeaderMap::new();
        headers.append("x-token", HeaderValue::from_static("a"));
        headers.append("x-token", HeaderValue::from_static("b"));
        headers.insert("content-length", HeaderValue::from_static("12"));
        headers.insert("accept", HeaderValue::from_static("application/json"));

        let out = convert_headers(&headers);
        let tokens: Vec<_> = out.get_all("x-token").iter().collect();
        assert_eq!(tokens.len(), 2);
        assert_eq!(out.get("accept").unwrap(), "application/json");
        assert!(out.get("content-length").is_none());
    }

    #[test]
    fn test_get_against_local_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let backend = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let body = r#"{"ok":true}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
            request
        });

        let mut headers = HeaderMap::new();
        headers.insert("x-operator", HeaderValue::from_static("line-3"));
        let upstream = HttpUpstream::new(Duration::from_secs(5));
        let response = upstream
            .get(&request(port, "/produce?shift=2", headers))
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], br#"{"ok":true}"#);

        let seen = backend.join().unwrap();
        assert!(seen.starts_with("GET /produce?shift=2 HTTP/1.1\r\n"));
        assert!(seen.to_lowercase().contains("x-operator: line-3"));
    }

    #[test]
    fn test_connection_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let upstream = HttpUpstream::new(Duration::from_secs(2));
        let err = upstream
            .get(&request(port, "/produce", HeaderMap::new()))
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Connect { .. }), "got {err}");
    }
}
