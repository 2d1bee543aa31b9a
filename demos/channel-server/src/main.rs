//! Example server streaming simulated speech-synthesis progress.
//!
//! Run with: cargo run -p channel-server
//!
//! Clients connect to `ws://localhost:8000/ws/{client_id}` and submit jobs
//! with `POST /api/tts/generate`.

use std::{net::SocketAddr, time::Duration};

use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use serde::{Deserialize, Serialize};
use tasklink_session::new_task_id;
use tasklink_transport::{ChannelHub, HubConfig, channel_router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const STEPS: [(f64, &str); 4] = [
    (10.0, "Loading voice model"),
    (35.0, "Normalizing text"),
    (70.0, "Synthesizing audio"),
    (90.0, "Encoding output"),
];

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    text: String,
    client_id: String,
    #[serde(default)]
    task_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    success: bool,
    task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let hub = ChannelHub::new(HubConfig::from_env());

    let api = Router::new()
        .route("/api/tts/generate", post(generate_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(hub.clone());

    let app = Router::new()
        .merge(api)
        .merge(channel_router(hub))
        .layer(CorsLayer::permissive());

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000u16);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn generate_handler(
    State(hub): State<ChannelHub>,
    Json(request): Json<GenerateRequest>,
) -> (StatusCode, Json<GenerateResponse>) {
    let task_id = request.task_id.unwrap_or_else(new_task_id);

    if request.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(GenerateResponse {
                success: false,
                task_id,
                result: None,
                message: "Text is empty".to_string(),
            }),
        );
    }

    hub.register_task(&task_id, &request.client_id).await;
    if let Err(e) = hub.send_start(&task_id).await {
        tracing::warn!(%task_id, "Client will miss start: {e}");
    }

    let report = hub.progress_reporter(&task_id);
    for (progress, message) in STEPS {
        tokio::time::sleep(Duration::from_millis(400)).await;
        report(progress, message);
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    let result = format!("/outputs/{task_id}.wav");
    if let Err(e) = hub.send_complete(&task_id, &result).await {
        tracing::warn!(%task_id, "Client will miss completion: {e}");
    }
    tracing::info!(%task_id, chars = request.text.len(), "Generation finished");

    (
        StatusCode::OK,
        Json(GenerateResponse {
            success: true,
            task_id,
            result: Some(result),
            message: "Audio generated".to_string(),
        }),
    )
}
