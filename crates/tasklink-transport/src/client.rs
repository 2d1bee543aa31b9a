//! WebSocket client connector.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tasklink_core::{Connector, Identity, Link, TransportError};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Opens channel connections with `tokio-tungstenite`.
///
/// Each link gets a writer task fed by the link's outbound queue and a
/// reader task feeding its inbound queue. Dropping the link stops both.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
    path: String,
}

impl WsConnector {
    /// `path` may contain `{identity}`, replaced on every connect.
    #[must_use]
    pub fn new(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path: path.into(),
        }
    }

    /// Full URL for an identity.
    #[must_use]
    pub fn url_for(&self, identity: &Identity) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.path.replace("{identity}", identity.as_str())
        )
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, identity: &Identity) -> Result<Link, TransportError> {
        let url = self.url_for(identity);
        tracing::debug!(url, "Connecting");
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::debug!("WebSocket write failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let item = match frame {
                    Ok(Message::Text(text)) => Ok(text.as_str().to_owned()),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(s) => Ok(s),
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => Err(TransportError::Io(e.to_string())),
                };
                let failed = item.is_err();
                if in_tx.send(item).is_err() || failed {
                    break;
                }
            }
        });

        Ok(Link::new(out_tx, in_rx).with_reader(reader.abort_handle()))
    }
}
