//! Example client that submits a job and prints its progress.
//!
//! Run with: cargo run -p channel-watch -- "Hello there"
//!
//! Expects `channel-server` on `TASKLINK_URL` (default `ws://127.0.0.1:8000`)
//! with its HTTP API on `TASKLINK_API_URL` (default `http://127.0.0.1:8000`).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tasklink_core::{
    ConnectionEvent, Identity, SubmitError, Task, TaskId, TaskPresenter, TaskSubmitter,
};
use tasklink_session::{ChannelConfig, Session};
use tasklink_transport::WsConnector;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Posts jobs to the server's generation endpoint.
struct HttpSubmitter {
    client: reqwest::Client,
    endpoint: String,
}

#[async_trait]
impl TaskSubmitter for HttpSubmitter {
    async fn submit(
        &self,
        identity: &Identity,
        task_id: &TaskId,
        payload: &Value,
    ) -> Result<Value, SubmitError> {
        let mut body = payload.clone();
        if let Some(fields) = body.as_object_mut() {
            fields.insert("client_id".into(), identity.as_str().into());
            fields.insert("task_id".into(), task_id.clone().into());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| SubmitError::Failed(e.to_string()))?;
        let status = response.status();
        let reply: Value = response
            .json()
            .await
            .map_err(|e| SubmitError::Failed(e.to_string()))?;

        if !status.is_success() {
            let message = reply
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request rejected");
            return Err(SubmitError::Rejected(format!("{status}: {message}")));
        }
        Ok(reply)
    }
}

struct StdoutPresenter;

impl TaskPresenter for StdoutPresenter {
    fn render(&self, task: &Task) {
        println!(
            "[{}] {:>3}% {:?} {}",
            task.id, task.progress, task.status, task.message
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let text = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let text = if text.is_empty() {
        "The quick brown fox jumps over the lazy dog.".to_string()
    } else {
        text
    };

    let config = ChannelConfig::from_env();
    let api_url =
        std::env::var("TASKLINK_API_URL").unwrap_or_else(|_| "http://127.0.0.1:8000".to_string());
    let connector = WsConnector::new(config.url.clone(), config.channel_path.clone());
    let session = Session::new(config, Arc::new(connector));

    session.on_connection(None, |event| match event {
        ConnectionEvent::Open { identity } => println!("connected as {identity}"),
        ConnectionEvent::Close { reason } => println!("connection closed: {reason:?}"),
        ConnectionEvent::Error { message } => eprintln!("connection error: {message}"),
    });
    let presenter = session.attach(Arc::new(StdoutPresenter));

    session.connect().await?;

    let submitter = HttpSubmitter {
        client: reqwest::Client::new(),
        endpoint: format!("{}/api/tts/generate", api_url.trim_end_matches('/')),
    };
    let task_id = session.submit(&submitter, &json!({ "text": text })).await?;

    if let Some(task) = session.wait_for(&task_id).await {
        match task.result {
            Some(result) => println!("done: {result}"),
            None => println!("finished without result: {:?}", task.error),
        }
    }

    presenter.abort();
    session.destroy().await;
    Ok(())
}
