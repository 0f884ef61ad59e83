//! HTTP listener.
//!
//! - `POST /rpc/{service}/{method}` with a JSON array of arguments
//! - `GET /capabilities` returns this node's capability snapshot
//! - `GET /health`
//!
//! Request headers named `x-rpc-<key>` become call attributes. The call id is
//! taken from `x-call-id` or generated.

use crate::dispatcher::{CallSource, Dispatcher};
use crate::metrics::text;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use plexrpc_core::{RpcError, TransportKind};
use plexrpc_protocol::message::InvocationDescriptor;
use plexrpc_protocol::{ErrorCode, NodeAddress, MAX_PAYLOAD_SIZE};
use serde_json::Value;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

const CALL_ID_HEADER: &str = "x-call-id";
const ATTRIBUTE_PREFIX: &str = "x-rpc-";
const JSON: &str = "application/json";

/// Serves RPC calls over HTTP/1.1.
pub struct HttpListener {
    dispatcher: Arc<Dispatcher>,
}

impl HttpListener {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Serves an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("HTTP listener on http://{}", addr);
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            let dispatcher = self.dispatcher.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let dispatcher = dispatcher.clone();
                                    async move { route(&dispatcher, req, remote).await }
                                });
                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    tracing::debug!("HTTP connection {} error: {}", remote, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("HTTP accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("HTTP listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn route<B>(
    dispatcher: &Dispatcher,
    req: Request<B>,
    remote: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    tracing::debug!("[{}] {} {}", remote, method, path);

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/capabilities") => match serde_json::to_vec(&dispatcher.snapshot()) {
            Ok(body) => text(StatusCode::OK, JSON, body),
            Err(e) => {
                tracing::error!("Failed to encode snapshot: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "encoding failed")
            }
        },
        (&Method::GET, "/health") => text(StatusCode::OK, "text/plain", "OK"),
        (method, path) => match path.strip_prefix("/rpc/").and_then(|p| p.split_once('/')) {
            Some(_) if *method != Method::POST => {
                text(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "Method Not Allowed")
            }
            Some((service, method)) if !service.is_empty() && !method.contains('/') => {
                let (service, method) = (service.to_string(), method.to_string());
                invoke(dispatcher, req, remote, service, method).await
            }
            _ => text(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
        },
    };
    Ok(response)
}

async fn invoke<B>(
    dispatcher: &Dispatcher,
    req: Request<B>,
    remote: SocketAddr,
    service: String,
    method: String,
) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();
    let call_id = parts
        .headers
        .get(CALL_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let body = match Limited::new(body, MAX_PAYLOAD_SIZE as usize).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return text(
                StatusCode::PAYLOAD_TOO_LARGE,
                "text/plain",
                "Payload Too Large",
            );
        }
        Err(e) => {
            tracing::debug!("[{}] Failed to read body: {}", remote, e);
            return text(StatusCode::BAD_REQUEST, "text/plain", "unreadable body");
        }
    };

    let result = match parse_args(&body) {
        Ok(args) => {
            let invocation =
                InvocationDescriptor::new(service, method, args).with_call_id(call_id.clone());
            let source = CallSource {
                peer: Some(NodeAddress::from(remote)),
                attributes: attributes(&parts.headers),
            };
            dispatcher.call(TransportKind::Http, invocation, source).await
        }
        Err(e) => Err(e),
    };

    let mut response = match result {
        Ok(value) => match serde_json::to_vec(&value) {
            Ok(body) => text(StatusCode::OK, JSON, body),
            Err(e) => error_response(dispatcher, RpcError::internal(e.to_string())),
        },
        Err(e) => error_response(dispatcher, e),
    };
    if let Ok(value) = HeaderValue::from_str(&call_id) {
        response.headers_mut().insert(CALL_ID_HEADER, value);
    }
    response
}

fn parse_args(body: &[u8]) -> Result<Vec<Value>, RpcError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(body)
        .map_err(|e| RpcError::validation(format!("body must be a JSON array: {}", e)))
}

fn attributes(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(ATTRIBUTE_PREFIX)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

fn error_response(dispatcher: &Dispatcher, error: RpcError) -> Response<Full<Bytes>> {
    let error = dispatcher.wire_error(error);
    let status = status_for(error.code);
    match serde_json::to_vec(&error) {
        Ok(body) => text(status, JSON, body),
        Err(_) => text(status, "text/plain", error.message),
    }
}

/// HTTP status an error code is reported with.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::ValidationFailed | ErrorCode::BadRequest | ErrorCode::UnsupportedProtocol => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::RoutingNotFound | ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict | ErrorCode::DuplicateRegistration => StatusCode::CONFLICT,
        ErrorCode::PeerUnreachable => StatusCode::BAD_GATEWAY,
        ErrorCode::HandlerFailed | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
