//! WebSocket transport
//!
//! Connects to a websocket and yields text frames. Knows nothing about
//! Jetstream events or cursors.

use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::LedgerError;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct Transport {
    sink: futures_util::stream::SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
}

impl Transport {
    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        debug!(url = %url, "Connecting to WebSocket");

        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| LedgerError::Stream(format!("WebSocket connect failed: {}", e)))?;
        let (sink, stream) = ws.split();

        debug!(url = %url, "WebSocket connected");
        Ok(Self { sink, stream })
    }

    /// Next text frame, or None once the server closes the connection.
    ///
    /// Binary frames are decoded as UTF-8 when possible; control frames are
    /// skipped (pongs are sent by tungstenite).
    pub async fn recv(&mut self) -> Result<Option<String>, LedgerError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => {
                        debug!("Skipping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(LedgerError::Stream(format!("WebSocket error: {}", e))),
                None => return Ok(None),
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}
