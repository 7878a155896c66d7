//! Request routing by machine number
//!
//! A machine number `n` names the backend listening on `base_port + n`.
//! The router validates the query parameters, checks the resolved port
//! against the scanner's snapshot once, and forwards the GET to
//! `127.0.0.1:<port>` through an [`Upstream`].
//!
//! Everything here is synchronous; the transport calls [`ProxyRouter::dispatch`]
//! from a blocking worker thread.

use crate::config::MACHINE_LIST_PATH;
use crate::error::{json_error_response, GatewayErrorCode};
use crate::logger::SharedLogger;
use crate::scanner::OccupiedPorts;
use crate::upstream::{Upstream, UpstreamRequest};
use hyper::body::Bytes;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;
use std::num::IntErrorKind;
use std::sync::Arc;

pub const MACHINE_NO_PARAM: &str = "machine_no";
pub const SHIFT_PARAM: &str = "shift";
pub const MAX_SHIFT: u8 = 2;

/// Content type of every proxied response.
///
/// The backend's own content type is not looked at. Existing consumers rely on
/// this, even for non-JSON backends.
const PROXIED_CONTENT_TYPE: &str = "application/json";

/// Transport-neutral view of an inbound request
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
    pub request_id: String,
}

impl GatewayRequest {
    /// GET request for `path_and_query`, e.g. `/produce?machine_no=5`
    pub fn get(path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (path_and_query.to_string(), None),
        };
        Self {
            method: Method::GET,
            path,
            query,
            headers: HeaderMap::new(),
            remote_addr: None,
            request_id: String::new(),
        }
    }

    /// First value of query parameter `name`, percent-decoded
    pub fn param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .find(|(key, _)| decode_component(key) == name)
            .map(|(_, value)| decode_component(value))
    }

    fn peer(&self) -> String {
        match self.remote_addr {
            Some(addr) => addr.to_string(),
            None => "-".to_string(),
        }
    }
}

/// `+` is a space; invalid UTF-8 escapes are kept as written
fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// What the transport should send back
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    /// Set on error responses
    pub error_code: Option<GatewayErrorCode>,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn json(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: "application/json",
            error_code: None,
            body: body.into(),
        }
    }
}

/// A registered path: exact, or a `/prefix/*` pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Exact(String),
    Prefix(String),
}

impl RouteTarget {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) if prefix.ends_with('/') => RouteTarget::Prefix(prefix.to_string()),
            _ => RouteTarget::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            RouteTarget::Exact(exact) => path == exact,
            RouteTarget::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

impl std::fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteTarget::Exact(exact) => write!(f, "{}", exact),
            RouteTarget::Prefix(prefix) => write!(f, "{}*", prefix),
        }
    }
}

/// Per-request failures, answered with an `error_log` body
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("missing parameter machine_no")]
    MissingMachineNo,

    #[error("parameter machine_no[{0}] is not an integer")]
    InvalidMachineNo(String),

    #[error("parameter machine_no[{0}] is out of range")]
    MachineNoOutOfRange(String),

    #[error("parameter shift[{0}] is not an integer")]
    InvalidShift(String),

    #[error("parameter shift[{0}] must be between 0 and {}", MAX_SHIFT)]
    ShiftOutOfRange(String),

    #[error("machine[{0}] is offline")]
    Offline(i32),

    #[error("no route registered for {0}")]
    RouteNotFound(String),

    #[error("method {0} is not allowed, only GET is routed")]
    MethodNotAllowed(String),
}

impl RequestError {
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            RequestError::MissingMachineNo => GatewayErrorCode::MissingMachineNo,
            RequestError::InvalidMachineNo(_) | RequestError::MachineNoOutOfRange(_) => {
                GatewayErrorCode::InvalidMachineNo
            }
            RequestError::InvalidShift(_) | RequestError::ShiftOutOfRange(_) => {
                GatewayErrorCode::InvalidShift
            }
            RequestError::Offline(_) => GatewayErrorCode::MachineOffline,
            RequestError::RouteNotFound(_) => GatewayErrorCode::RouteNotFound,
            RequestError::MethodNotAllowed(_) => GatewayErrorCode::MethodNotAllowed,
        }
    }
}

/// A machine number resolved to an online backend port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub machine_no: i32,
    pub port: u16,
    pub shift: Option<u8>,
}

/// Body of `/machine-list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineList {
    pub cnt: usize,
    pub machine_list: Vec<i32>,
}

pub struct ProxyRouter {
    base_port: u16,
    targets: Vec<RouteTarget>,
    ports: Arc<dyn OccupiedPorts>,
    upstream: Arc<dyn Upstream>,
    logger: SharedLogger,
}

impl std::fmt::Debug for ProxyRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRouter")
            .field("base_port", &self.base_port)
            .field("targets", &self.targets)
            .finish()
    }
}

impl ProxyRouter {
    pub fn new(
        base_port: u16,
        ports: Arc<dyn OccupiedPorts>,
        upstream: Arc<dyn Upstream>,
        logger: SharedLogger,
    ) -> Self {
        Self {
            base_port,
            targets: Vec::new(),
            ports,
            upstream,
            logger,
        }
    }

    /// Register a forwarded path (builder pattern)
    pub fn with_target(mut self, pattern: &str) -> Self {
        let target = RouteTarget::parse(pattern);
        self.logger.info(&format!("registered proxy target {}", target));
        self.targets.push(target);
        self
    }

    pub fn with_targets<I, S>(self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        patterns
            .into_iter()
            .fold(self, |router, p| router.with_target(p.as_ref()))
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn targets(&self) -> &[RouteTarget] {
        &self.targets
    }

    /// Route one request to discovery, a proxy target or a 404
    pub fn dispatch(&self, req: &GatewayRequest) -> GatewayResponse {
        if req.method != Method::GET {
            return self.reject(req, RequestError::MethodNotAllowed(req.method.to_string()));
        }

        if req.path == MACHINE_LIST_PATH {
            return self.machine_list_response();
        }

        if self.targets.iter().any(|t| t.matches(&req.path)) {
            return self.resolve_and_forward(req);
        }

        self.reject(req, RequestError::RouteNotFound(req.path.clone()))
    }

    /// Online machine numbers, ascending
    pub fn machine_list(&self) -> MachineList {
        let base = i32::from(self.base_port);
        let machine_list: Vec<i32> = self
            .ports
            .occupied_ports()
            .into_iter()
            .map(|port| i32::from(port) - base)
            .collect();
        MachineList {
            cnt: machine_list.len(),
            machine_list,
        }
    }

    fn machine_list_response(&self) -> GatewayResponse {
        match serde_json::to_vec(&self.machine_list()) {
            Ok(body) => GatewayResponse::json(StatusCode::OK, body),
            Err(e) => {
                self.logger
                    .error(&format!("failed to serialize machine list: {}", e));
                json_error_response(GatewayErrorCode::InternalError, "failed to build machine list")
            }
        }
    }

    /// Validate parameters and check the snapshot; no network I/O
    pub fn resolve(&self, req: &GatewayRequest) -> Result<ResolvedTarget, RequestError> {
        let raw = req
            .param(MACHINE_NO_PARAM)
            .ok_or(RequestError::MissingMachineNo)?;
        let machine_no = parse_machine_no(&raw)?;

        let shift = match req.param(SHIFT_PARAM) {
            Some(raw) => Some(parse_shift(&raw)?),
            None => None,
        };

        let port = u16::try_from(i64::from(self.base_port) + i64::from(machine_no))
            .map_err(|_| RequestError::Offline(machine_no))?;

        // Checked once. The backend may still go away before we dial it.
        if !self.ports.occupied_ports().contains(&port) {
            return Err(RequestError::Offline(machine_no));
        }

        Ok(ResolvedTarget {
            machine_no,
            port,
            shift,
        })
    }

    /// Resolve the machine number and forward the GET to its backend
    pub fn resolve_and_forward(&self, req: &GatewayRequest) -> GatewayResponse {
        let target = match self.resolve(req) {
            Ok(target) => target,
            Err(e) => return self.reject(req, e),
        };

        let request = UpstreamRequest {
            port: target.port,
            path_and_query: forward_path(&req.path, target.shift),
            headers: req.headers.clone(),
        };

        match self.upstream.get(&request) {
            Ok(response) => {
                self.logger.info(&format!(
                    "{} [{}] GET {} -> {} ({})",
                    req.peer(),
                    req.request_id,
                    request.path_and_query,
                    request.addr(),
                    response.status
                ));
                GatewayResponse {
                    status: StatusCode::OK,
                    content_type: PROXIED_CONTENT_TYPE,
                    error_code: None,
                    body: response.body,
                }
            }
            Err(e) => {
                let message = format!("machine[{}] request failed: {}", target.machine_no, e);
                self.logger
                    .error(&format!("{} [{}] {}", req.peer(), req.request_id, message));
                json_error_response(GatewayErrorCode::UpstreamFailed, message)
            }
        }
    }

    fn reject(&self, req: &GatewayRequest, error: RequestError) -> GatewayResponse {
        let message = error.to_string();
        self.logger
            .error(&format!("{} [{}] {}", req.peer(), req.request_id, message));
        json_error_response(error.code(), message)
    }
}

fn parse_machine_no(raw: &str) -> Result<i32, RequestError> {
    raw.parse::<i32>().map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
            RequestError::MachineNoOutOfRange(raw.to_string())
        }
        _ => RequestError::InvalidMachineNo(raw.to_string()),
    })
}

fn parse_shift(raw: &str) -> Result<u8, RequestError> {
    let shift = raw.parse::<i64>().map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
            RequestError::ShiftOutOfRange(raw.to_string())
        }
        _ => RequestError::InvalidShift(raw.to_string()),
    })?;
    if !(0..=i64::from(MAX_SHIFT)).contains(&shift) {
        return Err(RequestError::ShiftOutOfRange(raw.to_string()));
    }
    Ok(shift as u8)
}

/// Inbound path without its query, plus `?shift=<n>` when given
fn forward_path(path: &str, shift: Option<u8>) -> String {
    match shift {
        Some(shift) => format!("{}?{}={}", path, SHIFT_PARAM, shift),
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{Level, MemoryLogger};
    use crate::scanner::PortSet;
    use crate::upstream::{UpstreamError, UpstreamResponse};
    use hyper::header::HeaderValue;
    use parking_lot::Mutex;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration;

    struct FixedPorts(PortSet);

    impl OccupiedPorts for FixedPorts {
        fn occupied_ports(&self) -> PortSet {
            self.0.clone()
        }
    }

    /// Records every dial and answers with a canned result
    struct RecordingUpstream {
        dials: Mutex<Vec<UpstreamRequest>>,
        fail: bool,
    }

    impl RecordingUpstream {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                dials: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn dials(&self) -> Vec<UpstreamRequest> {
            self.dials.lock().clone()
        }
    }

    impl Upstream for RecordingUpstream {
        fn get(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
            self.dials.lock().push(request.clone());
            if self.fail {
                return Err(UpstreamError::Timeout {
                    addr: request.addr(),
                    timeout: Duration::from_secs(30),
                });
            }
            Ok(UpstreamResponse {
                status: StatusCode::OK,
                body: Bytes::from_static(br#"{"produced":42}"#),
            })
        }
    }

    fn router(
        ports: &[u16],
        fail: bool,
    ) -> (ProxyRouter, Arc<RecordingUpstream>, Arc<MemoryLogger>) {
        let upstream = RecordingUpstream::new(fail);
        let logger = Arc::new(MemoryLogger::new());
        let router = ProxyRouter::new(
            9000,
            Arc::new(FixedPorts(ports.iter().copied().collect())),
            upstream.clone(),
            logger.clone(),
        )
        .with_targets(["/produce", "/status/*"]);
        (router, upstream, logger)
    }

    fn body_json(response: &GatewayResponse) -> serde_json::Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn test_online_machine_dials_once() {
        let (router, upstream, _) = router(&[9005], false);
        let response = router.dispatch(&GatewayRequest::get("/produce?machine_no=5"));

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.content_type, "application/json");
        assert!(response.error_code.is_none());
        assert_eq!(&response.body[..], br#"{"produced":42}"#);

        let dials = upstream.dials();
        assert_eq!(dials.len(), 1);
        assert_eq!(
            dials[0].addr(),
            SocketAddr::from((Ipv4Addr::LOCALHOST, 9005))
        );
        assert_eq!(dials[0].path_and_query, "/produce");
    }

    #[test]
    fn test_offline_machine_never_dials() {
        let (router, upstream, logger) = router(&[9005], false);
        let response = router.dispatch(&GatewayRequest::get("/produce?machine_no=6"));

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.error_code, Some(GatewayErrorCode::MachineOffline));
        let body = body_json(&response);
        assert!(body["error_log"].as_str().unwrap().contains('6'));
        assert!(upstream.dials().is_empty());
        assert!(logger.lines(Level::Error)[0].contains("machine[6] is offline"));
    }

    #[test]
    fn test_missing_machine_no() {
        let (router, upstream, _) = router(&[9005], false);
        for path in ["/produce", "/produce?shift=1", "/produce?machine_number=5"] {
            let response = router.dispatch(&GatewayRequest::get(path));
            assert_eq!(response.error_code, Some(GatewayErrorCode::MissingMachineNo));
            assert_eq!(body_json(&response)["error_log"], "missing parameter machine_no");
        }
        assert!(upstream.dials().is_empty());
    }

    #[test]
    fn test_bad_machine_no() {
        let (router, upstream, _) = router(&[9005], false);

        let response = router.dispatch(&GatewayRequest::get("/produce?machine_no=abc"));
        assert_eq!(response.error_code, Some(GatewayErrorCode::InvalidMachineNo));
        assert!(body_json(&response)["error_log"]
            .as_str()
            .unwrap()
            .contains("machine_no[abc]"));

        let response =
            router.dispatch(&GatewayRequest::get("/produce?machine_no=99999999999999999999"));
        assert_eq!(response.error_code, Some(GatewayErrorCode::InvalidMachineNo));
        assert!(body_json(&response)["error_log"]
            .as_str()
            .unwrap()
            .contains("out of range"));

        let response = router.dispatch(&GatewayRequest::get("/produce?machine_no="));
        assert_eq!(response.error_code, Some(GatewayErrorCode::InvalidMachineNo));

        assert!(upstream.dials().is_empty());
    }

    #[test]
    fn test_machine_no_outside_port_space_is_offline() {
        let (router, upstream, _) = router(&[9005], false);
        for n in ["60000", "-9001"] {
            let response =
                router.dispatch(&GatewayRequest::get(&format!("/produce?machine_no={n}")));
            assert_eq!(response.error_code, Some(GatewayErrorCode::MachineOffline));
        }
        assert!(upstream.dials().is_empty());
    }

    #[test]
    fn test_shift_validation() {
        let (router, upstream, _) = router(&[9005], false);

        for bad in ["3", "-1", "x", "1.5", "99999999999999999999999"] {
            let response = router.dispatch(&GatewayRequest::get(&format!(
                "/produce?machine_no=5&shift={bad}"
            )));
            assert_eq!(
                response.error_code,
                Some(GatewayErrorCode::InvalidShift),
                "shift={bad}"
            );
        }
        assert!(upstream.dials().is_empty());

        let response = router.dispatch(&GatewayRequest::get("/produce?machine_no=5&shift=1"));
        assert!(response.error_code.is_none());
        let dials = upstream.dials();
        assert_eq!(dials.len(), 1);
        assert_eq!(dials[0].path_and_query, "/produce?shift=1");
    }

    #[test]
    fn test_forwarded_query_is_rebuilt() {
        let (router, upstream, _) = router(&[9003], false);
        router.dispatch(&GatewayRequest::get(
            "/status/line?foo=bar&machine_no=3&shift=0&extra=1",
        ));
        assert_eq!(upstream.dials()[0].path_and_query, "/status/line?shift=0");
        assert_eq!(upstream.dials()[0].port, 9003);
    }

    #[test]
    fn test_headers_forwarded() {
        let (router, upstream, _) = router(&[9005], false);
        let mut req = GatewayRequest::get("/produce?machine_no=5");
        req.headers
            .insert("authorization", HeaderValue::from_static("Bearer abc"));
        req.headers.insert("x-line", HeaderValue::from_static("7"));
        router.dispatch(&req);

        let dial = &upstream.dials()[0];
        assert_eq!(dial.headers.get("authorization").unwrap(), "Bearer abc");
        assert_eq!(dial.headers.get("x-line").unwrap(), "7");
    }

    #[test]
    fn test_upstream_failure_is_structured() {
        let (router, upstream, logger) = router(&[9005], true);
        let response = router.dispatch(&GatewayRequest::get("/produce?machine_no=5"));

        assert_eq!(upstream.dials().len(), 1);
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert_eq!(response.error_code, Some(GatewayErrorCode::UpstreamFailed));
        assert!(body_json(&response)["error_log"]
            .as_str()
            .unwrap()
            .contains("machine[5]"));
        assert!(logger.contains("timed out"));
    }

    #[test]
    fn test_machine_list() {
        let (router, _, _) = router(&[9003, 9005, 9010], false);
        let response = router.dispatch(&GatewayRequest::get("/machine-list"));
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], br#"{"cnt":3,"machine_list":[3,5,10]}"#);
    }

    #[test]
    fn test_machine_list_empty_and_below_base() {
        let (empty, _, _) = router(&[], false);
        assert_eq!(
            empty.machine_list(),
            MachineList {
                cnt: 0,
                machine_list: vec![]
            }
        );

        let (below, _, _) = router(&[8998, 9000], false);
        assert_eq!(below.machine_list().machine_list, vec![-2, 0]);
    }

    #[test]
    fn test_unregistered_path_and_method() {
        let (router, upstream, _) = router(&[9005], false);

        let response = router.dispatch(&GatewayRequest::get("/other?machine_no=5"));
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.error_code, Some(GatewayErrorCode::RouteNotFound));

        let mut post = GatewayRequest::get("/produce?machine_no=5");
        post.method = Method::POST;
        let response = router.dispatch(&post);
        assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);

        assert!(upstream.dials().is_empty());
    }

    #[test]
    fn test_route_targets() {
        assert_eq!(
            RouteTarget::parse("/produce"),
            RouteTarget::Exact("/produce".into())
        );
        let prefix = RouteTarget::parse("/status/*");
        assert_eq!(prefix, RouteTarget::Prefix("/status/".into()));
        assert!(prefix.matches("/status/a/b"));
        assert!(!prefix.matches("/status"));
        assert_eq!(prefix.to_string(), "/status/*");

        let catch_all = RouteTarget::parse("/*");
        assert!(catch_all.matches("/anything"));

        assert!(!RouteTarget::parse("/produce").matches("/produce/extra"));
    }

    #[test]
    fn test_params_are_decoded() {
        let req = GatewayRequest::get("/p?machine%5Fno=%35&name=a+b&flag&empty=");
        assert_eq!(req.param("machine_no").as_deref(), Some("5"));
        assert_eq!(req.param("name").as_deref(), Some("a b"));
        assert_eq!(req.param("flag").as_deref(), Some(""));
        assert_eq!(req.param("empty").as_deref(), Some(""));
        assert_eq!(req.param("missing"), None);

        let undecodable = GatewayRequest::get("/p?note=line+3+%FF");
        assert_eq!(undecodable.param("note").as_deref(), Some("line 3 %FF"));

        let first_wins = GatewayRequest::get("/p?shift=1&shift=2");
        assert_eq!(first_wins.param("shift").as_deref(), Some("1"));
    }

    #[test]
    fn test_targets_registered_and_logged() {
        let (router, _, logger) = router(&[], false);
        assert_eq!(router.targets().len(), 2);
        assert!(logger.contains("registered proxy target /status/*"));
        assert_eq!(router.base_port(), 9000);
    }
}
