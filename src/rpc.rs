//! JSON-RPC 2.0 server
//!
//! Serves the Ethereum endpoint over HTTP POST and WebSocket upgrade on a
//! single port. Requests are routed through the method registry; batches
//! come back in request order with notifications omitted.

use crate::qtum::QtumError;
use crate::registry::{MethodRegistry, RequestContext};
use crate::subscriptions::SubscriptionAgent;
use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Server configuration, validated once at startup.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Listen address
    pub bind: String,

    /// Listen port
    pub port: u16,

    /// Per-request deadline; also bounds upstream retries
    pub request_timeout: Duration,

    /// Largest accepted batch
    pub max_batch: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 23889,
            request_timeout: Duration::from_secs(10),
            max_batch: 50,
        }
    }
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,

    /// Method name
    pub method: String,

    /// Parameters; defaults to an empty array
    #[serde(default = "empty_params")]
    pub params: JsonValue,

    /// Request ID, echoed verbatim. A notification has no id member at
    /// all; an explicit `"id": null` is a regular request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonValue>,
}

fn empty_params() -> JsonValue {
    JsonValue::Array(Vec::new())
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version
    pub jsonrpc: String,

    /// Result (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,

    /// Error (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,

    /// Request ID
    pub id: JsonValue,
}

impl JsonRpcResponse {
    /// Success response echoing `id`.
    pub fn success(id: JsonValue, result: JsonValue) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Error response echoing `id`.
    pub fn failure(id: JsonValue, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code
    pub code: i32,

    /// Error message
    pub message: String,

    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl JsonRpcError {
    /// Create a new error
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create error with data
    pub fn with_data(code: i32, message: impl Into<String>, data: JsonValue) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Parse error (-32700)
    pub fn parse_error() -> Self {
        Self::new(-32700, "Parse error")
    }

    /// Invalid request (-32600)
    pub fn invalid_request() -> Self {
        Self::new(-32600, "Invalid request")
    }

    /// Method not found (-32601), naming the offending method
    pub fn method_not_found(method: &str) -> Self {
        Self::new(-32601, format!("method not found: {method}"))
    }

    /// Invalid params (-32602)
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::new(-32602, msg)
    }

    /// Internal error (-32603)
    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::new(-32603, msg)
    }

    /// Known upstream condition (-32000)
    pub fn server_error(msg: impl Into<String>) -> Self {
        Self::new(-32000, msg)
    }

    /// Deadline exceeded / caller gone (-32001)
    pub fn cancelled() -> Self {
        Self::new(-32001, "request cancelled")
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

impl From<QtumError> for JsonRpcError {
    fn from(err: QtumError) -> Self {
        match &err {
            QtumError::Cancelled => JsonRpcError::cancelled(),
            QtumError::Rpc { message, .. } => JsonRpcError::with_data(
                -32603,
                "unexpected upstream error",
                JsonValue::String(message.clone()),
            ),
            QtumError::Transport(msg) | QtumError::InvalidResponse(msg) => {
                JsonRpcError::with_data(
                    -32603,
                    "upstream unreachable",
                    JsonValue::String(msg.clone()),
                )
            }
            known => JsonRpcError::server_error(known.to_string()),
        }
    }
}

/// Shared server state handed to every axum handler.
#[derive(Clone)]
pub struct GatewayState {
    /// Server configuration
    pub config: RpcConfig,

    /// The immutable method table
    pub registry: Arc<MethodRegistry>,

    /// WebSocket subscription agent
    pub agent: Arc<SubscriptionAgent>,
}

/// The HTTP/WebSocket front end.
pub struct RpcServer {
    config: RpcConfig,
    state: GatewayState,
}

impl RpcServer {
    pub fn new(
        config: RpcConfig,
        registry: Arc<MethodRegistry>,
        agent: Arc<SubscriptionAgent>,
    ) -> Self {
        let state = GatewayState {
            config: config.clone(),
            registry,
            agent,
        };
        Self { config, state }
    }

    /// Bind the listener and start serving. Returns once the socket is
    /// bound; a bind failure is a startup error for the caller.
    pub async fn start(&self) -> Result<SocketAddr, std::io::Error> {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]);

        let app = Router::new()
            .route("/", get(handle_ws_upgrade).post(handle_http))
            .route("/health", get(handle_health))
            .layer(cors)
            .with_state(self.state.clone());

        let addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        info!("JSON-RPC endpoint listening on {local}");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("server error: {e}");
            }
        });

        Ok(local)
    }
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// HTTP POST entry point: single requests and batches.
async fn handle_http(State(state): State<GatewayState>, body: axum::body::Bytes) -> Response {
    let parsed: JsonValue = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return Json(JsonRpcResponse::failure(
                JsonValue::Null,
                JsonRpcError::parse_error(),
            ))
            .into_response()
        }
    };

    match parsed {
        JsonValue::Array(requests) => {
            if requests.is_empty() || requests.len() > state.config.max_batch {
                return Json(JsonRpcResponse::failure(
                    JsonValue::Null,
                    JsonRpcError::invalid_request(),
                ))
                .into_response();
            }

            // In order, notifications omitted.
            let mut responses = Vec::with_capacity(requests.len());
            for request in requests {
                if let Some(response) = process_value(request, &state, None).await {
                    responses.push(response);
                }
            }

            if responses.is_empty() {
                StatusCode::NO_CONTENT.into_response()
            } else {
                Json(responses).into_response()
            }
        }
        single => match process_value(single, &state, None).await {
            Some(response) => Json(response).into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        },
    }
}

/// Run one request body. `None` for notifications.
async fn process_value(
    value: JsonValue,
    state: &GatewayState,
    session: Option<Arc<crate::subscriptions::SubscriptionSession>>,
) -> Option<JsonRpcResponse> {
    // Serde folds an explicit `"id": null` and a missing id member into
    // the same `None`, so notification detection has to look at the raw
    // object: only an absent id member makes a notification.
    let has_id = value
        .as_object()
        .is_some_and(|object| object.contains_key("id"));
    let fallback_id = value.get("id").cloned().unwrap_or(JsonValue::Null);

    let request: JsonRpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(_) => {
            return Some(JsonRpcResponse::failure(
                fallback_id,
                JsonRpcError::invalid_request(),
            ))
        }
    };

    let is_notification = !has_id;
    let id = request.id.clone().unwrap_or(JsonValue::Null);

    if request.jsonrpc != "2.0" {
        if is_notification {
            return None;
        }
        return Some(JsonRpcResponse::failure(id, JsonRpcError::invalid_request()));
    }

    debug!(method = %request.method, "dispatching");

    let deadline = Instant::now() + state.config.request_timeout;
    let ctx = RequestContext {
        deadline: Some(deadline),
        session,
    };

    let outcome = tokio::time::timeout(
        state.config.request_timeout,
        state.registry.dispatch(&request.method, &request.params, &ctx),
    )
    .await;

    let result = match outcome {
        Ok(result) => result,
        Err(_) => {
            warn!(method = %request.method, "request deadline exceeded");
            Err(JsonRpcError::cancelled())
        }
    };

    if is_notification {
        return None;
    }

    Some(match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(err) => JsonRpcResponse::failure(id, err),
    })
}

/// WebSocket upgrade: same dispatch plus subscription support.
async fn handle_ws_upgrade(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws_session(socket, state))
}

async fn handle_ws_session(mut socket: WebSocket, state: GatewayState) {
    let (session, mut mailbox) = state.agent.register_session();
    info!(session = session.id, "websocket session opened");

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let parsed: JsonValue = match serde_json::from_str(&text) {
                            Ok(value) => value,
                            Err(_) => {
                                let response = JsonRpcResponse::failure(
                                    JsonValue::Null,
                                    JsonRpcError::parse_error(),
                                );
                                if send_json(&mut socket, &response).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };

                        if let Some(response) =
                            process_value(parsed, &state, Some(session.clone())).await
                        {
                            if send_json(&mut socket, &response).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(session = session.id, "websocket error: {e}");
                        break;
                    }
                }
            }
            notification = mailbox.recv() => {
                match notification {
                    Some(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Mailbox dropped: the agent kicked this session.
                    None => break,
                }
            }
        }
    }

    state.agent.remove_session(session.id);
    info!(session = session.id, "websocket session closed");
}

async fn send_json(socket: &mut WebSocket, response: &JsonRpcResponse) -> Result<(), ()> {
    match serde_json::to_string(response) {
        Ok(text) => socket.send(Message::Text(text)).await.map_err(|_| ()),
        Err(e) => {
            error!("failed to serialize response: {e}");
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EthHandler;
    use async_trait::async_trait;
    use serde_json::json;

    struct Ping;

    #[async_trait]
    impl EthHandler for Ping {
        fn method(&self) -> &'static str {
            "eth_ping"
        }

        async fn handle(
            &self,
            _params: &JsonValue,
            _ctx: &RequestContext,
        ) -> Result<JsonValue, JsonRpcError> {
            Ok(json!("pong"))
        }
    }

    struct Slow;

    #[async_trait]
    impl EthHandler for Slow {
        fn method(&self) -> &'static str {
            "eth_slow"
        }

        async fn handle(
            &self,
            _params: &JsonValue,
            _ctx: &RequestContext,
        ) -> Result<JsonValue, JsonRpcError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(JsonValue::Null)
        }
    }

    fn test_state(timeout: Duration) -> GatewayState {
        let mut registry = MethodRegistry::new();
        registry.register(Arc::new(Ping)).unwrap();
        registry.register(Arc::new(Slow)).unwrap();
        GatewayState {
            config: RpcConfig {
                request_timeout: timeout,
                ..RpcConfig::default()
            },
            registry: Arc::new(registry),
            agent: SubscriptionAgent::new(),
        }
    }

    #[tokio::test]
    async fn response_echoes_id_type() {
        let state = test_state(Duration::from_secs(5));

        for id in [json!(1), json!("x"), json!(null)] {
            let response = process_value(
                json!({"jsonrpc": "2.0", "id": id, "method": "eth_ping", "params": []}),
                &state,
                None,
            )
            .await
            .unwrap();
            assert_eq!(response.id, id);
            assert_eq!(response.result, Some(json!("pong")));
        }
    }

    #[tokio::test]
    async fn unknown_method_error_names_method() {
        let state = test_state(Duration::from_secs(5));
        let response = process_value(
            json!({"jsonrpc": "2.0", "id": 7, "method": "eth_foo", "params": []}),
            &state,
            None,
        )
        .await
        .unwrap();
        let err = response.error.unwrap();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "method not found: eth_foo");
        assert_eq!(response.id, json!(7));
    }

    #[tokio::test]
    async fn notification_produces_no_response() {
        let state = test_state(Duration::from_secs(5));
        let response = process_value(
            json!({"jsonrpc": "2.0", "method": "eth_ping", "params": []}),
            &state,
            None,
        )
        .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn explicit_null_id_is_answered() {
        // `"id": null` is a request, not a notification; the response
        // must echo the null id.
        let state = test_state(Duration::from_secs(5));
        let response = process_value(
            json!({"jsonrpc": "2.0", "id": null, "method": "eth_ping", "params": []}),
            &state,
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.id, JsonValue::Null);
        assert_eq!(response.result, Some(json!("pong")));
    }

    #[tokio::test]
    async fn deadline_produces_cancelled_error() {
        let state = test_state(Duration::from_millis(50));
        let started = Instant::now();
        let response = process_value(
            json!({"jsonrpc": "2.0", "id": 1, "method": "eth_slow", "params": []}),
            &state,
            None,
        )
        .await
        .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(response.error.unwrap().code, -32001);
    }

    #[tokio::test]
    async fn wrong_version_is_invalid_request() {
        let state = test_state(Duration::from_secs(5));
        let response = process_value(
            json!({"jsonrpc": "1.0", "id": 1, "method": "eth_ping", "params": []}),
            &state,
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.error.unwrap().code, -32600);
    }

    #[test]
    fn upstream_errors_map_to_codes() {
        let cancelled: JsonRpcError = QtumError::Cancelled.into();
        assert_eq!(cancelled.code, -32001);

        let known: JsonRpcError = QtumError::InsufficientFunds("Insufficient funds".into()).into();
        assert_eq!(known.code, -32000);

        let unknown: JsonRpcError = QtumError::Rpc {
            code: -8,
            message: "heights out of order".into(),
        }
        .into();
        assert_eq!(unknown.code, -32603);
        assert_eq!(unknown.data, Some(json!("heights out of order")));
    }
}
