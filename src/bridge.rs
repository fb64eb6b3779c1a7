//! JSON-RPC boundary between the UI process and the session managers.
//!
//! Requests are answered on the transport they arrived on. Session output
//! travels the other way as notifications whose method is the push
//! channel name.

use crate::error::{ApiError, BridgeError, BridgeResult, ErrorCode};
use crate::route_server::{RouteServerManager, RouteServerSummary};
use crate::session::{OutputSink, PushEvent};
use crate::terminal::{TerminalManager, TerminalSummary};
use axum::{
    Json, Router,
    extract::State,
    http::{
        HeaderValue, StatusCode,
        header::{AUTHORIZATION, WWW_AUTHENTICATE},
    },
    middleware,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const SERVER_ERROR: i64 = -32000;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ApiError>,
}

impl RpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, failure: RpcFailure) -> Self {
        let error = match failure {
            RpcFailure::MethodNotFound(method) => RpcError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {}", method),
                data: None,
            },
            RpcFailure::InvalidParams(message) => RpcError {
                code: INVALID_PARAMS,
                message,
                data: None,
            },
            RpcFailure::Bridge(err) => {
                let api = err.into_api();
                RpcError {
                    code: SERVER_ERROR,
                    message: api.message.clone(),
                    data: Some(api),
                }
            }
        };
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }

    fn protocol_error(code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Value::Null,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug)]
enum RpcFailure {
    MethodNotFound(String),
    InvalidParams(String),
    Bridge(BridgeError),
}

impl From<BridgeError> for RpcFailure {
    fn from(value: BridgeError) -> Self {
        RpcFailure::Bridge(value)
    }
}

impl From<ApiError> for RpcFailure {
    fn from(value: ApiError) -> Self {
        RpcFailure::Bridge(value.into())
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ConnectParams {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandParams {
    session_id: String,
    command: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisconnectParams {
    session_id: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct CreateTerminalParams {
    cols: Option<u16>,
    rows: Option<u16>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
enum Encoding {
    #[default]
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

#[derive(Debug, Deserialize)]
struct WriteTerminalParams {
    id: String,
    data: String,
    #[serde(default)]
    encoding: Encoding,
}

#[derive(Debug, Deserialize)]
struct ResizeTerminalParams {
    id: String,
    cols: u16,
    rows: u16,
}

#[derive(Debug, Deserialize)]
struct KillTerminalParams {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionList {
    route_servers: Vec<RouteServerSummary>,
    terminals: Vec<TerminalSummary>,
}

/// Wire form of a push event.
pub fn notification(event: &PushEvent) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": event.channel(),
        "params": event.payload(),
    })
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, RpcFailure> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params)
        .map_err(|err| RpcFailure::InvalidParams(format!("Invalid params: {}", err)))
}

fn decode_payload(data: String, encoding: Encoding) -> BridgeResult<Vec<u8>> {
    match encoding {
        Encoding::Utf8 => Ok(data.into_bytes()),
        Encoding::Base64 => {
            use base64::Engine;
            use base64::engine::general_purpose::STANDARD;
            STANDARD.decode(data.as_bytes()).map_err(|err| {
                ApiError::new(ErrorCode::InvalidArgument, "Invalid base64")
                    .with_details(err.to_string())
                    .into()
            })
        }
    }
}

#[derive(Clone)]
pub struct Bridge {
    route_servers: Arc<RouteServerManager>,
    terminals: Arc<TerminalManager>,
}

impl Bridge {
    pub fn new(route_servers: Arc<RouteServerManager>, terminals: Arc<TerminalManager>) -> Self {
        Self {
            route_servers,
            terminals,
        }
    }

    /// Answers one request. Sessions created by it push to `sink`.
    /// Requests without an id get no response.
    pub async fn handle(&self, request: RpcRequest, sink: OutputSink) -> Option<RpcResponse> {
        let id = request.id.clone();
        let method = request.method.clone();
        let result = self.dispatch(request, sink).await;
        let id = id?;
        Some(match result {
            Ok(value) => RpcResponse::success(id, value),
            Err(failure) => {
                tracing::debug!(method = %method, error = ?failure, "Request failed");
                RpcResponse::failure(id, failure)
            }
        })
    }

    async fn dispatch(&self, request: RpcRequest, sink: OutputSink) -> Result<Value, RpcFailure> {
        let params = request.params.unwrap_or(Value::Null);
        match request.method.as_str() {
            "connect-route-server" => {
                let req: ConnectParams = parse_params(params)?;
                let host = req
                    .host
                    .filter(|host| !host.trim().is_empty())
                    .unwrap_or_else(|| self.route_servers.config().default_host.clone());
                let result = self.route_servers.connect(&host, req.port, sink).await;
                Ok(to_value(result)?)
            }
            "send-route-server-command" => {
                let req: CommandParams = parse_params(params)?;
                let result = self
                    .route_servers
                    .send_command(&req.session_id, &req.command)
                    .await;
                Ok(to_value(result)?)
            }
            "disconnect-route-server" => {
                let req: DisconnectParams = parse_params(params)?;
                let result = self.route_servers.disconnect(&req.session_id).await;
                Ok(to_value(result)?)
            }
            "create-terminal" => {
                let req: CreateTerminalParams = parse_params(params)?;
                let created = self
                    .terminals
                    .create_terminal(req.cols, req.rows, sink)
                    .await?;
                Ok(to_value(created)?)
            }
            "write-terminal" => {
                let req: WriteTerminalParams = parse_params(params)?;
                let bytes = decode_payload(req.data, req.encoding)?;
                self.terminals.write(&req.id, bytes).await;
                Ok(Value::Null)
            }
            "resize-terminal" => {
                let req: ResizeTerminalParams = parse_params(params)?;
                self.terminals.resize(&req.id, req.cols, req.rows).await;
                Ok(Value::Null)
            }
            "kill-terminal" => {
                let req: KillTerminalParams = parse_params(params)?;
                Ok(Value::Bool(self.terminals.kill(&req.id).await))
            }
            "list-sessions" => {
                let list = SessionList {
                    route_servers: self.route_servers.list().await,
                    terminals: self.terminals.list().await,
                };
                Ok(to_value(list)?)
            }
            other => Err(RpcFailure::MethodNotFound(other.to_string())),
        }
    }

    /// Closes every route-server session and kills every terminal.
    pub async fn shutdown(&self) {
        let closed = self.route_servers.shutdown().await;
        let killed = self.terminals.kill_all().await;
        tracing::info!(closed, killed, "Sessions released");
    }

    pub async fn serve_stdio(self) -> BridgeResult<()> {
        self.serve_lines(tokio::io::stdin(), tokio::io::stdout())
            .await
    }

    /// Newline-delimited JSON-RPC over any byte stream. Requests run
    /// concurrently; responses and notifications leave through a single
    /// writer so lines never interleave.
    pub async fn serve_lines<R, W>(self, reader: R, writer: W) -> BridgeResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(write_lines(writer, out_rx));

        let (sink, events) = OutputSink::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let forwarder = tokio::spawn(forward_notifications(events, out_tx.clone(), stop_rx));

        let mut in_flight = JoinSet::new();
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let request = match serde_json::from_str::<Value>(line) {
                Err(err) => {
                    let response = RpcResponse::protocol_error(PARSE_ERROR, err.to_string());
                    let _ = out_tx.send(serde_json::to_string(&response)?);
                    continue;
                }
                Ok(value) => match serde_json::from_value::<RpcRequest>(value) {
                    Ok(request) => request,
                    Err(err) => {
                        let response =
                            RpcResponse::protocol_error(INVALID_REQUEST, err.to_string());
                        let _ = out_tx.send(serde_json::to_string(&response)?);
                        continue;
                    }
                },
            };
            let bridge = self.clone();
            let sink = sink.clone();
            let out_tx = out_tx.clone();
            in_flight.spawn(async move {
                if let Some(response) = bridge.handle(request, sink).await {
                    match serde_json::to_string(&response) {
                        Ok(line) => {
                            let _ = out_tx.send(line);
                        }
                        Err(err) => tracing::error!(error = %err, "Failed to encode response"),
                    }
                }
            });
        }

        while in_flight.join_next().await.is_some() {}
        let _ = stop_tx.send(());
        let _ = forwarder.await;
        drop(out_tx);
        let _ = writer_task.await;
        Ok(())
    }

    pub fn router(self, auth_token: &str) -> Router {
        let (sink, mut events) = OutputSink::channel();
        let hub = Arc::new(EventHub::default());
        let fanout = hub.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                fanout.publish(event);
            }
        });

        let state = HttpState {
            bridge: self,
            sink,
            events: hub,
        };
        let auth_token = auth_token.to_string();
        Router::new()
            .route("/rpc", post(rpc_handler))
            .route("/events", get(events_handler))
            .with_state(state)
            .layer(middleware::from_fn(
                move |req: axum::http::Request<axum::body::Body>, next: axum::middleware::Next| {
                    let auth_token = auth_token.clone();
                    async move {
                        if auth_token.is_empty() {
                            return next.run(req).await;
                        }
                        let expected = format!("Bearer {}", auth_token);
                        let authorized = req
                            .headers()
                            .get(AUTHORIZATION)
                            .and_then(|value| value.to_str().ok())
                            .is_some_and(|value| value == expected);
                        if authorized {
                            next.run(req).await
                        } else {
                            let mut response =
                                (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
                            response
                                .headers_mut()
                                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                            response
                        }
                    }
                },
            ))
    }

    pub async fn serve_http(self, listen: &str, auth_token: &str) -> BridgeResult<()> {
        let addr: SocketAddr = listen.parse().map_err(|_| {
            ApiError::new(ErrorCode::InvalidArgument, "Invalid HTTP listen address")
                .with_details(listen.to_string())
        })?;
        let router = self.router(auth_token);
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
            ApiError::new(ErrorCode::IoError, "HTTP bind failed").with_details(err.to_string())
        })?;
        tracing::info!(listen = %addr, "HTTP transport listening");
        axum::serve(listener, router).await.map_err(|err| {
            ApiError::new(ErrorCode::IoError, "HTTP server failed").with_details(err.to_string())
        })?;
        Ok(())
    }
}

fn to_value<T: Serialize>(value: T) -> BridgeResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Turns push events into notification lines until `stop` fires, then
/// flushes whatever is already queued.
async fn forward_notifications(
    mut events: mpsc::UnboundedReceiver<PushEvent>,
    out: mpsc::UnboundedSender<String>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => {
                    if out.send(notification(&event).to_string()).is_err() {
                        return;
                    }
                }
                None => return,
            },
            _ = &mut stop => break,
        }
    }
    while let Ok(event) = events.try_recv() {
        if out.send(notification(&event).to_string()).is_err() {
            return;
        }
    }
}

async fn write_lines<W>(mut writer: W, mut lines: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            tracing::warn!(error = %err, "Transport write failed");
            break;
        }
    }
}

/// Fan-out of push events to SSE subscribers. Every subscriber has its own
/// unbounded queue, so a slow reader delays only itself and loses nothing.
#[derive(Default)]
struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PushEvent>>>,
}

impl EventHub {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<PushEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscribers mutex poisoned")
            .push(tx);
        rx
    }

    /// Delivers `event` to every live subscriber and forgets closed ones.
    fn publish(&self, event: PushEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscribers mutex poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscribers mutex poisoned")
            .len()
    }
}

#[derive(Clone)]
struct HttpState {
    bridge: Bridge,
    sink: OutputSink,
    events: Arc<EventHub>,
}

async fn rpc_handler(State(state): State<HttpState>, Json(body): Json<Value>) -> impl IntoResponse {
    let request = match serde_json::from_value::<RpcRequest>(body) {
        Ok(request) => request,
        Err(err) => {
            return Json(RpcResponse::protocol_error(INVALID_REQUEST, err.to_string()))
                .into_response();
        }
    };
    match state.bridge.handle(request, state.sink.clone()).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn events_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let receiver = state.events.subscribe();
    tracing::debug!(subscribers = state.events.subscriber_count(), "Event stream opened");
    let stream = UnboundedReceiverStream::new(receiver).map(|event| {
        Ok::<Event, Infallible>(
            Event::default()
                .event(event.channel())
                .data(event.payload().to_string()),
        )
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
