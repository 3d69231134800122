//! A thin WebSocket JSON client for driving the gateway in tests.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl TestClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    pub async fn send_json(&mut self, value: &Value) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(value)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Receive the next JSON text frame, answering pings along the way.
    pub async fn recv_json(&mut self) -> Result<Value, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(serde_json::from_str(&text)?);
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Receive the next frame and assert its `cmd` field.
    pub async fn recv_cmd(&mut self, cmd: &str) -> Result<Value, Box<dyn std::error::Error>> {
        let frame = self.recv_json().await?;
        if frame["cmd"] != cmd {
            return Err(format!("expected cmd {cmd:?}, got frame {frame}").into());
        }
        Ok(frame)
    }

    /// True when the server closes the connection (close frame, error or
    /// EOF) before sending another text frame.
    pub async fn closed_by_server(&mut self) -> bool {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return true,
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Text(_))) => return false,
                Some(Ok(_)) => {}
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
