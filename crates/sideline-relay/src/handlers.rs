//! HTTP and WebSocket handlers for the relay.
//!
//! Devices hold one WebSocket each at `/api/emergency-alerts/ws/:user_id/:role`.
//! Emergencies are raised and resolved over plain HTTP.

use crate::config::Config;
use crate::hub::{Hub, ResponseFrame, TriggerRequest};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sideline_protocol::{codec, Identity, Inbound, Role};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Path prefix of every relay route except `/health`.
pub const API_PREFIX: &str = "/api/emergency-alerts";

/// Shared relay state.
pub struct AppState {
    /// Connections and emergencies.
    pub hub: Hub,
    /// Relay configuration.
    pub config: Config,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            hub: Hub::new(),
            config,
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/ws/:user_id/:role", get(ws_handler))
        .route("/trigger-emergency", post(trigger_handler))
        .route("/active-emergencies", get(active_handler))
        .route("/resolve-emergency/:emergency_id", post(resolve_handler));

    Router::new()
        .nest(API_PREFIX, api)
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the relay.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Sideline relay listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}/ws/{{user_id}}/{{role}}", addr, API_PREFIX);

    serve(listener, Arc::new(AppState::new(config))).await
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Health check handler.
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TriggerRequest>,
) -> Json<Value> {
    let data = state.hub.trigger(request);
    Json(json!({
        "status": "Emergency alert triggered",
        "emergency_id": data.id
    }))
}

async fn active_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "emergencies": state.hub.active() }))
}

async fn resolve_handler(
    State(state): State<Arc<AppState>>,
    Path(emergency_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if state.hub.resolve(&emergency_id) {
        return Ok(Json(json!({
            "status": "Emergency resolved",
            "emergency_id": emergency_id
        })));
    }
    Err((
        StatusCode::NOT_FOUND,
        Json(json!({ "detail": "Emergency not found or already resolved" })),
    ))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((user_id, role)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Ok(role) = role.parse::<Role>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": format!("Invalid role: {}", role) })),
        )
            .into_response();
    };
    let identity = Identity::new(user_id, role);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, identity, state))
}

/// Handle a device connection.
async fn handle_websocket(socket: WebSocket, identity: Identity, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new(identity.role);
    let (handle, mut outbox) = state.hub.register(identity);
    let identity = &handle.identity;

    debug!(%identity, connections = state.hub.connection_count(), "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            biased;

            // Events routed to this identity by the hub
            Some(text) = outbox.recv() => {
                if sender.send(Message::Text(text.to_string())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => handle_text(&text, identity, &state.hub),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => handle_text(&text, identity, &state.hub),
                        Err(_) => Some(Inbound::error("Invalid JSON format")),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        None
                    }
                    Some(Ok(Message::Pong(_))) => None,
                    Some(Ok(Message::Close(_))) => {
                        debug!(%identity, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(%identity, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(%identity, "WebSocket stream ended");
                        break;
                    }
                };

                if let Some(reply) = reply {
                    if send_event(&mut sender, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    state.hub.unregister(&handle);
    debug!(identity = %handle.identity, "WebSocket disconnected");
}

/// Process one text frame from a device, returning the direct reply if any.
fn handle_text(text: &str, identity: &Identity, hub: &Hub) -> Option<Inbound> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!(%identity, error = %e, "Undecodable frame");
            metrics::record_error("json");
            return Some(Inbound::error("Invalid JSON format"));
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("ping") => {
            metrics::record_message("ping", "inbound");
            Some(Inbound::pong(value.get("timestamp").and_then(Value::as_u64)))
        }
        Some("emergency_response") => {
            metrics::record_message("emergency_response", "inbound");
            match serde_json::from_value::<ResponseFrame>(value) {
                Ok(frame) => {
                    hub.respond(identity, frame);
                    None
                }
                Err(e) => {
                    warn!(%identity, error = %e, "Malformed emergency_response");
                    metrics::record_error("response");
                    Some(Inbound::error(format!("Invalid emergency_response: {}", e)))
                }
            }
        }
        other => {
            debug!(%identity, kind = ?other, "Ignoring frame");
            None
        }
    }
}

/// Send an event to the WebSocket.
async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &Inbound,
) -> Result<()> {
    let text = codec::encode_inbound(event)?;
    metrics::record_message(event.kind(), "outbound");
    sender.send(Message::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start() -> (SocketAddr, Arc<AppState>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(AppState::new(Config::default()));
        tokio::spawn(serve(listener, Arc::clone(&state)));
        (addr, state)
    }

    async fn device(addr: SocketAddr, id: &str, role: &str) -> Client {
        let url = format!("ws://{}{}/ws/{}/{}", addr, API_PREFIX, id, role);
        let (mut socket, _) = connect_async(url).await.unwrap();
        // A pong proves the socket is registered with the hub
        socket
            .send(WsMessage::Text(r#"{"type":"ping","timestamp":1}"#.into()))
            .await
            .unwrap();
        assert_eq!(next(&mut socket).await, Inbound::pong(Some(1)));
        socket
    }

    async fn next(socket: &mut Client) -> Inbound {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = msg {
                return codec::decode_inbound(&text).unwrap();
            }
        }
    }

    fn trigger_request() -> TriggerRequest {
        serde_json::from_value(json!({
            "athlete_id": "42",
            "athlete_name": "Mike Chen",
            "location": {"latitude": 40.71, "longitude": -74.0}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let Json(body) = health_handler().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_trigger_list_and_resolve() {
        let state = Arc::new(AppState::new(Config::default()));

        let Json(body) = trigger_handler(State(Arc::clone(&state)), Json(trigger_request())).await;
        let id = body["emergency_id"].as_str().unwrap().to_string();

        let Json(active) = active_handler(State(Arc::clone(&state))).await;
        assert_eq!(active["emergencies"][&id]["athlete_id"], "42");
        assert_eq!(active["emergencies"][&id]["location"]["latitude"], 40.71);

        let resolved = resolve_handler(State(Arc::clone(&state)), Path(id.clone())).await;
        assert!(resolved.is_ok());

        let Err((status, Json(body))) = resolve_handler(State(state), Path(id)).await else {
            panic!("Expected 404 on second resolve");
        };
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["detail"], "Emergency not found or already resolved");
    }

    #[test]
    fn test_handle_text_replies() {
        let hub = Hub::new();
        let coach = Identity::new("5", Role::Coach);

        assert_eq!(
            handle_text("{nope", &coach, &hub),
            Some(Inbound::error("Invalid JSON format"))
        );
        assert_eq!(
            handle_text(r#"{"type":"ping"}"#, &coach, &hub),
            Some(Inbound::pong(None))
        );
        assert_eq!(handle_text(r#"{"type":"team_huddle"}"#, &coach, &hub), None);
        assert_eq!(
            handle_text(r#"{"type":"emergency_response","emergency_id":"e1"}"#, &coach, &hub),
            None
        );
        assert!(matches!(
            handle_text(r#"{"type":"emergency_response"}"#, &coach, &hub),
            Some(Inbound::Error { .. })
        ));
    }

    #[tokio::test]
    async fn test_alert_and_response_over_websocket() {
        let (addr, state) = start().await;
        let mut athlete = device(addr, "42", "athlete").await;
        let mut coach = device(addr, "5", "coach").await;
        let mut teammate = device(addr, "7", "teammate").await;

        let data = state.hub.trigger(trigger_request());
        for socket in [&mut athlete, &mut coach, &mut teammate] {
            match next(socket).await {
                Inbound::EmergencyAlert { data: got, .. } => assert_eq!(got.id, data.id),
                other => panic!("Expected alert, got {:?}", other),
            }
        }

        let response = json!({
            "type": "emergency_response",
            "emergency_id": data.id,
            "user_id": "7",
            "role": "teammate",
            "status": "responding",
            "eta": 3,
            "athlete_id": "42",
            "timestamp": "2024-05-01T14:03:22.512Z"
        });
        teammate
            .send(WsMessage::Text(response.to_string()))
            .await
            .unwrap();

        for socket in [&mut athlete, &mut coach] {
            match next(socket).await {
                Inbound::EmergencyUpdate { emergency_id, responder } => {
                    assert_eq!(emergency_id, data.id);
                    assert_eq!(responder.identity_id, "7");
                    assert_eq!(responder.role, Role::Teammate);
                    assert_eq!(responder.eta, Some(3));
                }
                other => panic!("Expected update, got {:?}", other),
            }
        }

        assert!(state.hub.resolve(&data.id));
        assert_eq!(next(&mut teammate).await, Inbound::resolved(data.id.clone()));
    }

    #[tokio::test]
    async fn test_invalid_json_and_bad_role() {
        let (addr, _state) = start().await;
        let mut coach = device(addr, "5", "coach").await;

        coach.send(WsMessage::Text("{nope".into())).await.unwrap();
        assert_eq!(next(&mut coach).await, Inbound::error("Invalid JSON format"));

        let url = format!("ws://{}{}/ws/5/medic", addr, API_PREFIX);
        assert!(connect_async(url).await.is_err());
    }
}
