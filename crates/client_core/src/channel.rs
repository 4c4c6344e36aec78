use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{MonitorDescriptor, MonitorFrame};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

/// One open push channel delivering evaluation frames.
#[async_trait]
pub trait EvaluationChannel: Send {
    /// Next decoded frame; `None` once the peer closes the stream.
    async fn next_frame(&mut self) -> Option<Result<MonitorFrame>>;
}

/// Seam between the monitor and the transport, so the state machine can be
/// driven by scripted frames in tests and disabled entirely where the
/// environment has no channel support.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Whether the running environment can open push channels at all.
    fn is_available(&self) -> bool {
        true
    }

    /// Open the channel and perform the `channel_id` handshake.
    async fn connect(&self, descriptor: &MonitorDescriptor) -> Result<Box<dyn EvaluationChannel>>;
}

pub struct WebSocketChannelConnector;

#[async_trait]
impl ChannelConnector for WebSocketChannelConnector {
    async fn connect(&self, descriptor: &MonitorDescriptor) -> Result<Box<dyn EvaluationChannel>> {
        let url = Url::parse(&descriptor.url)
            .with_context(|| format!("invalid monitor url: {}", descriptor.url))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(anyhow!("unsupported monitor url scheme: {other}")),
        }

        let (mut stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect monitor channel: {url}"))?;
        stream
            .send(Message::Text(descriptor.channel_id.clone()))
            .await
            .with_context(|| {
                format!(
                    "monitor handshake failed for channel {}",
                    descriptor.channel_id
                )
            })?;

        Ok(Box::new(WebSocketEvaluationChannel { stream }))
    }
}

struct WebSocketEvaluationChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl EvaluationChannel for WebSocketEvaluationChannel {
    async fn next_frame(&mut self) -> Option<Result<MonitorFrame>> {
        loop {
            let message = self.stream.next().await?;
            match message {
                Ok(Message::Text(text)) => {
                    return Some(
                        serde_json::from_str::<MonitorFrame>(&text)
                            .map_err(|err| anyhow!("invalid monitor frame: {err}")),
                    );
                }
                Ok(Message::Close(_)) => return None,
                // Ping/pong and binary frames are not part of the protocol.
                Ok(_) => continue,
                Err(err) => return Some(Err(anyhow!("monitor channel receive failed: {err}"))),
            }
        }
    }
}

/// Connector for environments without push-channel support; the monitor
/// never attempts a connection and reports the degraded state instead.
pub struct MissingChannelConnector;

#[async_trait]
impl ChannelConnector for MissingChannelConnector {
    fn is_available(&self) -> bool {
        false
    }

    async fn connect(&self, _descriptor: &MonitorDescriptor) -> Result<Box<dyn EvaluationChannel>> {
        Err(anyhow!("push channel support is unavailable in this environment"))
    }
}
