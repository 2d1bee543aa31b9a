//! WebSocket endpoint for the channel hub.

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::{
    hub::ChannelHub,
    protocol::{CHANNEL_ROUTE, ClientMessage, Inbound, ServerMessage, parse_client_frame},
};

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler on a path with a `client_id` segment.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    State(hub): State<ChannelHub>,
) -> impl IntoResponse {
    tracing::info!(client_id, "Channel connection requested");
    ws.on_upgrade(move |socket| handle_socket(socket, client_id, hub))
}

async fn handle_socket(socket: WebSocket, client_id: String, hub: ChannelHub) {
    let (mut sender, mut receiver) = socket.split();
    let (generation, mut outbound) = hub.connect(&client_id).await;

    // Forward queued frames to the socket until the hub drops this connection
    let send_task = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let heartbeat = {
        let hub = hub.clone();
        let client_id = client_id.clone();
        let period = hub.config().heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if hub.send_message(&client_id, &ServerMessage::ping()).await.is_err() {
                    break;
                }
            }
        })
    };

    if let Err(e) = hub
        .send_message(&client_id, &ServerMessage::connected(&client_id))
        .await
    {
        tracing::warn!("Failed to greet client: {e}");
    }

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(client_id, "WebSocket error: {e}");
                break;
            }
        };

        let reply = match parse_client_frame(&text) {
            Inbound::Message(ClientMessage::Ping { timestamp }) => {
                Some(ServerMessage::Pong { timestamp })
            }
            Inbound::Message(ClientMessage::Pong { .. }) => {
                tracing::trace!(client_id, "Heartbeat acknowledged");
                None
            }
            Inbound::Message(ClientMessage::Status) => Some(ServerMessage::Status {
                connected: hub.is_connected(&client_id).await,
                total_connections: hub.connection_count().await,
            }),
            Inbound::Unknown(kind) => {
                tracing::warn!(client_id, "Unknown message type: {kind}");
                None
            }
            Inbound::Invalid => {
                tracing::warn!(client_id, "Invalid JSON frame");
                Some(ServerMessage::protocol_error("Invalid JSON"))
            }
        };

        if let Some(reply) = reply {
            if hub.send_message(&client_id, &reply).await.is_err() {
                break;
            }
        }
    }

    // Cleanup
    heartbeat.abort();
    hub.disconnect(&client_id, generation).await;
    send_task.abort();
    tracing::info!(client_id, "Channel connection closed");
}

/// Create the channel router, mounted at `/ws/{client_id}`.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(channel_router(hub.clone()));
/// ```
#[must_use]
pub fn channel_router(hub: ChannelHub) -> axum::Router {
    axum::Router::new()
        .route(CHANNEL_ROUTE, get(ws_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(hub)
}
