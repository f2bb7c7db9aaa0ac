//! HTTP surface
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | POST | `/build` | `{success, deploymentId, deploymentUrl, downloadUrl, fromCache}` |
//! | GET | `/health` | `{status: "ok"}` |
//!
//! Every error is a JSON object with a single `error` field.

use crate::error::{PreviewError, PreviewResult};
use crate::pipeline::{BuildOutcome, BuildPipeline};
use hyper::body::HttpBody;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `POST /build` request body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    #[serde(default)]
    pub component_code: Option<String>,
}

/// `POST /build` success body
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResponse {
    pub success: bool,
    pub deployment_id: String,
    pub deployment_url: String,
    pub download_url: String,
    pub from_cache: bool,
}

impl From<&BuildOutcome> for BuildResponse {
    fn from(outcome: &BuildOutcome) -> Self {
        Self {
            success: true,
            deployment_id: outcome.deployment.id.to_string(),
            deployment_url: outcome.deployment.deployment_url(),
            download_url: outcome.deployment.download_url(),
            from_cache: outcome.from_cache,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

struct AppState {
    pipeline: Arc<BuildPipeline>,
    max_body_bytes: usize,
}

/// Bound listener plus everything a request needs
pub struct PreviewServer {
    listener: TcpListener,
    pipeline: Arc<BuildPipeline>,
    max_body_bytes: usize,
}

impl PreviewServer {
    pub fn bind(
        addr: &str,
        pipeline: Arc<BuildPipeline>,
        max_body_bytes: usize,
    ) -> PreviewResult<Self> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| PreviewError::io(format!("binding {addr}"), e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| PreviewError::io("configuring listener", e))?;

        Ok(Self {
            listener,
            pipeline,
            max_body_bytes,
        })
    }

    pub fn local_addr(&self) -> PreviewResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| PreviewError::io("reading listener address", e))
    }

    /// Serve until `shutdown` is cancelled, then drain in-flight requests.
    ///
    /// Shutdown stops accepting connections but never cancels a running
    /// build; each build is still bounded by the bundler timeout. A client
    /// that disconnects drops its build, which kills the bundler.
    pub async fn run(self, shutdown: CancellationToken) -> PreviewResult<()> {
        let addr = self.local_addr()?;
        let state = Arc::new(AppState {
            pipeline: self.pipeline,
            max_body_bytes: self.max_body_bytes,
        });

        let make_svc = make_service_fn(move |_conn| {
            let state = Arc::clone(&state);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { Ok::<_, Infallible>(handle(state, req).await) }
                }))
            }
        });

        let server = Server::from_tcp(self.listener)
            .map_err(|e| PreviewError::Server(e.to_string()))?
            .serve(make_svc)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });

        info!("Listening on http://{}", addr);
        server
            .await
            .map_err(|e| PreviewError::Server(e.to_string()))?;
        info!("Server stopped");
        Ok(())
    }
}

async fn handle(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    match (method, path.as_str()) {
        (Method::POST, "/build") => build(&state, req).await,
        (Method::GET, "/health") => json(StatusCode::OK, &serde_json::json!({"status": "ok"})),
        (_, "/build" | "/health") => error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"),
        _ => error(StatusCode::NOT_FOUND, "Not found"),
    }
}

async fn build(state: &AppState, req: Request<Body>) -> Response<Body> {
    let request = match read_json::<BuildRequest>(req, state.max_body_bytes).await {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };
    let source = request.component_code.unwrap_or_default();

    match state
        .pipeline
        .build(&source, CancellationToken::new())
        .await
    {
        Ok(outcome) => json(StatusCode::OK, &BuildResponse::from(&outcome)),
        Err(e) => {
            if e.status_code() >= 500 {
                warn!("Build request failed: {}", e);
            }
            error_response(&e)
        }
    }
}

/// Read the whole body, refusing anything over `limit` bytes
async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Body>,
    limit: usize,
) -> PreviewResult<T> {
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(PreviewError::BodyTooLarge);
    }

    let mut body = req.into_body();
    let mut bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| PreviewError::InvalidBody(e.to_string()))?;
        if bytes.len() + chunk.len() > limit {
            return Err(PreviewError::BodyTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    serde_json::from_slice(&bytes).map_err(|e| PreviewError::InvalidBody(e.to_string()))
}

fn error_response(err: &PreviewError) -> Response<Body> {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error(status, &err.to_string())
}

fn error(status: StatusCode, message: &str) -> Response<Body> {
    json(
        status,
        &ErrorResponse {
            error: message.to_string(),
        },
    )
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to serialize response: {}", e);
            let mut response = Response::new(Body::from(r#"{"error":"Internal error"}"#));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return response;
        }
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
