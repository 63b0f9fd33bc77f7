use anyhow::Context;
use bytes::Bytes;
use zeromq::{PubSocket, Socket, SocketSend, ZmqMessage};

/// PUB socket speaking the tool's metric wire format.
pub struct MetricPublisher {
    socket: PubSocket,
    endpoint: String,
}

impl std::fmt::Debug for MetricPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricPublisher")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl MetricPublisher {
    /// Bind to `endpoint`, e.g. `tcp://127.0.0.1:6001`.
    pub async fn bind(endpoint: &str) -> anyhow::Result<Self> {
        let mut socket = PubSocket::new();
        let bound = socket
            .bind(endpoint)
            .await
            .with_context(|| format!("failed to bind publisher to {endpoint}"))?;
        Ok(Self {
            socket,
            endpoint: bound.to_string(),
        })
    }

    /// Bind to an ephemeral localhost port.
    pub async fn bind_local() -> anyhow::Result<Self> {
        Self::bind("tcp://127.0.0.1:0").await
    }

    /// Resolved endpoint, with the real port when bound to port 0.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send a metric on `topic`; the `$` sentinel is appended here.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(payload)?;
        self.publish_raw(format!("{topic}$").as_bytes(), &payload)
            .await
    }

    /// Send a two-frame message with arbitrary bytes.
    pub async fn publish_raw(&mut self, topic: &[u8], payload: &[u8]) -> anyhow::Result<()> {
        self.publish_frames(&[topic, payload]).await
    }

    /// Send any number of frames, for malformed-message tests.
    pub async fn publish_frames(&mut self, frames: &[&[u8]]) -> anyhow::Result<()> {
        let frames: Vec<Bytes> = frames.iter().map(|f| Bytes::copy_from_slice(f)).collect();
        let message = ZmqMessage::try_from(frames)
            .map_err(|e| anyhow::anyhow!("failed to build message: {e}"))?;
        self.socket.send(message).await?;
        Ok(())
    }

    pub async fn close(self) {
        let _ = self.socket.close().await;
    }
}
