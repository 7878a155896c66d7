use crate::error::{json_error_response, GatewayErrorCode, X_GATEWAY_ERROR};
use crate::router::{GatewayRequest, GatewayResponse, ProxyRouter};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// HTTP front end of the gateway.
///
/// Connections are served on the tokio runtime; each request is handed to the
/// synchronous [`ProxyRouter`] on the blocking thread pool.
pub struct GatewayServer {
    listener: TcpListener,
    router: Arc<ProxyRouter>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    /// Bind the listening socket
    pub async fn bind(
        bind_addr: SocketAddr,
        router: Arc<ProxyRouter>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            router,
            shutdown_rx,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender counts as shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(stream: S, addr: SocketAddr, router: Arc<ProxyRouter>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { handle_request(req, router, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    router: Arc<ProxyRouter>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request = gateway_request(req, client_addr);
    debug!(
        method = %request.method,
        path = %request.path,
        request_id = %request.request_id,
        "Incoming request"
    );

    // Routing does blocking I/O (the forward), keep it off the async workers
    let response = match tokio::task::spawn_blocking(move || router.dispatch(&request)).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Request handler failed");
            json_error_response(GatewayErrorCode::InternalError, "Internal gateway error")
        }
    };

    Ok(into_hyper_response(response))
}

/// Strip the body and keep what the router needs
fn gateway_request(req: Request<Incoming>, client_addr: SocketAddr) -> GatewayRequest {
    let (parts, _body) = req.into_parts();

    let request_id = parts
        .headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    GatewayRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(String::from),
        headers: parts.headers,
        remote_addr: Some(client_addr),
        request_id,
    }
}

fn into_hyper_response(response: GatewayResponse) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Response::builder()
        .status(response.status)
        .header(CONTENT_TYPE, HeaderValue::from_static(response.content_type));

    if let Some(code) = response.error_code {
        builder = builder.header(X_GATEWAY_ERROR, code.as_header_value());
    }

    builder
        .body(Full::new(response.body).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
