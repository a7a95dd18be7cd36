//! Broker RPC server (axum).
//!
//! Every handler normalises request payloads with [`coerce_bytes`], runs the blocking
//! broker call on the blocking pool, and wraps byte replies with [`ensure_bytes`].
//!
//! Only `/acquire` constructs channels. Data routes address channels that are already
//! open and answer `channel_closed` for anything else, the same error a local
//! [`super::ChannelHandle`] reports after `close`.

use super::rpc::{
    AckResponse, AcquireResponse, BytesResponse, CloseResponse, DescriptorRequest,
    DescriptorsResponse, ErrorBody, HealthResponse, HttpCall, QueryRequest, ReadRequest,
    TimeoutRequest, WriteRequest, WriteResponse,
};
use super::ChannelBroker;
use crate::backend::{HttpBody, HttpMethod, HttpRequest};
use crate::codec::{coerce_bytes, ensure_bytes};
use crate::descriptor::parse_descriptor;
use crate::error::{AppResult, LabError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Error reply carrying the `LabError` kind tag.
struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl From<LabError> for ApiError {
    fn from(err: LabError) -> Self {
        let status = match &err {
            LabError::InvalidDescriptor(_) | LabError::Unsupported { .. } => {
                StatusCode::BAD_REQUEST
            }
            LabError::ChannelClosed(_) => StatusCode::CONFLICT,
            LabError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            LabError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ErrorBody::from_error(&err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run a blocking broker call off the async workers.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map(Json).map_err(ApiError::from),
        Err(join) => Err(ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorBody {
                error: format!("broker task failed: {join}"),
                kind: "internal".to_string(),
                descriptor: None,
                detail: None,
            },
        }),
    }
}

/// Routes of the broker RPC surface.
pub fn router(broker: Arc<ChannelBroker>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/descriptors", get(list_descriptors))
        .route("/acquire", post(acquire))
        .route("/write", post(write))
        .route("/read", post(read))
        .route("/readline", post(readline))
        .route("/close", post(close))
        .route("/serial/query", post(serial_query))
        .route("/visa/read_bytes", post(visa_read_bytes))
        .route("/visa/query", post(visa_query))
        .route("/visa/clear", post(visa_clear))
        .route("/visa/set_timeout", post(visa_set_timeout))
        .route("/http/{method}", post(http_call))
        .with_state(broker)
}

async fn health(State(broker): State<Arc<ChannelBroker>>) -> ApiResult<HealthResponse> {
    blocking(move || {
        Ok(HealthResponse {
            status: "ok".to_string(),
            channels: broker.len(),
        })
    })
    .await
}

async fn list_descriptors(
    State(broker): State<Arc<ChannelBroker>>,
) -> ApiResult<DescriptorsResponse> {
    blocking(move || {
        Ok(DescriptorsResponse {
            descriptors: broker.list_descriptors(),
        })
    })
    .await
}

async fn acquire(
    State(broker): State<Arc<ChannelBroker>>,
    Json(req): Json<DescriptorRequest>,
) -> ApiResult<AcquireResponse> {
    blocking(move || {
        let kind = parse_descriptor(&req.descriptor)?.kind().to_string();
        let handle = broker.get_or_create(&req.descriptor)?;
        info!(descriptor = %handle.descriptor(), "remote acquire");
        Ok(AcquireResponse {
            descriptor: handle.descriptor().to_string(),
            kind,
            simulated: handle.is_simulated(),
        })
    })
    .await
}

async fn write(
    State(broker): State<Arc<ChannelBroker>>,
    Json(req): Json<WriteRequest>,
) -> ApiResult<WriteResponse> {
    blocking(move || {
        let data = coerce_bytes(req.data);
        let written = broker.get(&req.descriptor)?.write(&data)?;
        Ok(WriteResponse { written })
    })
    .await
}

async fn read(
    State(broker): State<Arc<ChannelBroker>>,
    Json(req): Json<ReadRequest>,
) -> ApiResult<BytesResponse> {
    blocking(move || {
        let data = broker.get(&req.descriptor)?.read(req.size)?;
        Ok(BytesResponse {
            data: ensure_bytes(&data),
        })
    })
    .await
}

async fn readline(
    State(broker): State<Arc<ChannelBroker>>,
    Json(req): Json<DescriptorRequest>,
) -> ApiResult<BytesResponse> {
    blocking(move || {
        let data = broker.get(&req.descriptor)?.readline()?;
        Ok(BytesResponse {
            data: ensure_bytes(&data),
        })
    })
    .await
}

async fn close(
    State(broker): State<Arc<ChannelBroker>>,
    Json(req): Json<DescriptorRequest>,
) -> ApiResult<CloseResponse> {
    blocking(move || {
        let closed = broker.close(&req.descriptor)?;
        Ok(CloseResponse { closed })
    })
    .await
}

async fn serial_query(
    State(broker): State<Arc<ChannelBroker>>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<BytesResponse> {
    blocking(move || {
        let command = coerce_bytes(req.data);
        let reply = broker.get(&req.descriptor)?.query_line(&command)?;
        Ok(BytesResponse {
            data: ensure_bytes(&reply),
        })
    })
    .await
}

async fn visa_read_bytes(
    State(broker): State<Arc<ChannelBroker>>,
    Json(req): Json<ReadRequest>,
) -> ApiResult<BytesResponse> {
    blocking(move || {
        let data = broker.get(&req.descriptor)?.read(req.size)?;
        Ok(BytesResponse {
            data: ensure_bytes(&data),
        })
    })
    .await
}

async fn visa_query(
    State(broker): State<Arc<ChannelBroker>>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<BytesResponse> {
    blocking(move || {
        let command = coerce_bytes(req.data);
        let reply = broker.get(&req.descriptor)?.query(&command, req.size)?;
        Ok(BytesResponse {
            data: ensure_bytes(&reply),
        })
    })
    .await
}

async fn visa_clear(
    State(broker): State<Arc<ChannelBroker>>,
    Json(req): Json<DescriptorRequest>,
) -> ApiResult<AckResponse> {
    blocking(move || {
        broker.get(&req.descriptor)?.clear()?;
        Ok(AckResponse { ok: true })
    })
    .await
}

async fn visa_set_timeout(
    State(broker): State<Arc<ChannelBroker>>,
    Json(req): Json<TimeoutRequest>,
) -> ApiResult<AckResponse> {
    blocking(move || {
        if !req.timeout.is_finite() || req.timeout < 0.0 {
            return Err(LabError::Config(format!("invalid timeout {}", req.timeout)));
        }
        broker.get(&req.descriptor)?.set_timeout(Duration::from_secs_f64(req.timeout))?;
        Ok(AckResponse { ok: true })
    })
    .await
}

async fn http_call(
    State(broker): State<Arc<ChannelBroker>>,
    Path(method): Path<HttpMethod>,
    Json(call): Json<HttpCall>,
) -> ApiResult<BytesResponse> {
    blocking(move || {
        let body = match (call.json, call.data) {
            (Some(json), _) => Some(HttpBody::Json(json)),
            (None, Some(data)) => Some(HttpBody::Bytes(coerce_bytes(data))),
            (None, None) => None,
        };
        let mut request = HttpRequest::new(method, call.path);
        if let Some(body) = body {
            request = request.with_body(body);
        }
        let reply = broker.get(&call.descriptor)?.request(&request)?;
        Ok(BytesResponse {
            data: ensure_bytes(&reply),
        })
    })
    .await
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    broker: Arc<ChannelBroker>,
    shutdown: F,
) -> AppResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(address = %addr, "broker server listening");
    axum::serve(listener, router(broker))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!(address = %addr, "broker server stopped");
    Ok(())
}

/// A broker server running on its own thread and runtime.
pub struct RunningServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RunningServer {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://host:port` for [`super::BrokerClient`].
    pub fn uri(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting connections and wait for the server thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(address = %self.addr, "broker server thread panicked");
            }
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind `bind` (use port 0 for an ephemeral port) and serve `broker` on a
/// background thread. Returns once the listener is bound.
pub fn spawn_server(broker: Arc<ChannelBroker>, bind: &str) -> AppResult<RunningServer> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    let listener = runtime.block_on(tokio::net::TcpListener::bind(bind))?;
    let addr = listener.local_addr()?;
    let (tx, rx) = oneshot::channel::<()>();

    let thread = std::thread::Builder::new()
        .name("labwire-broker".to_string())
        .spawn(move || {
            let shutdown = async {
                let _ = rx.await;
            };
            if let Err(e) = runtime.block_on(serve(listener, broker, shutdown)) {
                error!(error = %e, "broker server failed");
            }
            debug!("broker runtime exiting");
        })?;

    Ok(RunningServer {
        addr,
        shutdown: Some(tx),
        thread: Some(thread),
    })
}
