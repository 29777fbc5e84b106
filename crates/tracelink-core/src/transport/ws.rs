//! WebSocket transport. Text and binary frames are trace bytes; commands go
//! out as text frames.

use super::{Transport, TransportPair, TransportReader, TransportStream, TransportWriter};
use crate::{Result, TracelinkError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracelink_types::{TraceSource, WebSocketConfig};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport over a WebSocket connection.
pub struct WebSocketTransport {
    config: WebSocketConfig,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&mut self) -> Result<TransportPair> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TracelinkError::Transport(e.to_string()))?;

        if !self.config.subprotocols.is_empty() {
            let protocols = self.config.subprotocols.join(", ");
            request.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                protocols
                    .parse()
                    .map_err(|_| TracelinkError::Transport("invalid subprotocol".to_string()))?,
            );
        }
        for (name, value) in &self.config.headers {
            let name: tokio_tungstenite::tungstenite::http::header::HeaderName = name
                .parse()
                .map_err(|_| TracelinkError::Transport(format!("invalid header name: {}", name)))?;
            let value = value
                .parse()
                .map_err(|_| TracelinkError::Transport("invalid header value".to_string()))?;
            request.headers_mut().insert(name, value);
        }

        debug!(target: "tracelink::ws", url = %self.config.url, "connecting");
        let (socket, response) = connect_async(request)
            .await
            .map_err(|e| TracelinkError::Transport(e.to_string()))?;
        debug!(target: "tracelink::ws", status = %response.status(), "connected");

        let (sink, stream) = socket.split();
        Ok(TransportPair {
            streams: vec![TransportStream {
                source: TraceSource::Ws,
                reader: Box::new(WsReader { stream }),
            }],
            writer: Some(Box::new(WsWriter { sink })),
            exit: None,
            control: None,
        })
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl TransportReader for WsReader {
    async fn read_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Binary(data))) => return Ok(Some(data.into())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Control frames carry no trace bytes.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(target: "tracelink::ws", "read failed: {}", e);
                    return Err(std::io::Error::other(e));
                }
            }
        }
    }
}

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportWriter for WsWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        let text = String::from_utf8_lossy(data).into_owned();
        self.sink
            .send(Message::text(text))
            .await
            .map_err(std::io::Error::other)
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        let _ = self.sink.send(Message::Close(None)).await;
        self.sink.close().await.map_err(std::io::Error::other)
    }
}
