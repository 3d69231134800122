//! Per-connection WebSocket session task.
//!
//! The task is a socket pump: inbound text frames go to the worker, the
//! worker pushes outbound frames through an mpsc queue.  The queue is
//! strictly FIFO; frames flagged `persist` that cannot be delivered are
//! collected at teardown and handed back to the worker, which returns
//! them to the user's mailbox.
//!
//! The task also enforces the liveness policy: periodic pings, an idle
//! deadline, and the login grace (a session still unauthenticated after
//! `login_grace_pongs` pong replies is kicked).

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;

use crate::table::SessionId;
use crate::worker::WorkerEvent;

/// Frames and control messages from the worker to the session task.
#[derive(Debug)]
pub enum Outbound {
    Frame { payload: Utf8Bytes, persist: bool },
    /// Authentication completed; disarms the login grace kick.
    LoggedIn,
    /// Close the connection.  Idempotent.
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SessionTiming {
    pub idle: Duration,
    pub login_grace_pongs: u32,
}

pub async fn run<S>(
    ws: WebSocketStream<S>,
    id: SessionId,
    timing: SessionTiming,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let mut ping = interval(timing.idle / 2);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    let mut last_activity = Instant::now();
    let mut pongs: u32 = 0;
    let mut logged_in = false;
    let mut closing = false;
    let mut undelivered: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Frame { payload, persist }) => {
                    if closing {
                        if persist {
                            undelivered.push(payload.as_str().to_owned());
                        }
                    } else if sink.send(Message::Text(payload.clone())).await.is_err() {
                        if persist {
                            undelivered.push(payload.as_str().to_owned());
                        }
                        break;
                    }
                }
                Some(Outbound::LoggedIn) => logged_in = true,
                Some(Outbound::Shutdown) => {
                    if !closing {
                        closing = true;
                        let _ = sink.send(Message::Close(None)).await;
                        // Keep reading until the peer acknowledges the close.
                    }
                }
                None => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    last_activity = Instant::now();
                    let _ = events.send(WorkerEvent::Frame {
                        id,
                        text: text.as_str().to_owned(),
                    });
                }
                Some(Ok(Message::Ping(data))) => {
                    last_activity = Instant::now();
                    if !closing {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    last_activity = Instant::now();
                    pongs += 1;
                    if !logged_in && !closing && pongs >= timing.login_grace_pongs {
                        debug!(session = %id, "login grace expired");
                        closing = true;
                        let _ = sink.send(Message::Close(None)).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = %id, error = %e, "read failed");
                    break;
                }
            },
            _ = ping.tick() => {
                if last_activity.elapsed() >= timing.idle {
                    debug!(session = %id, "idle timeout");
                    break;
                }
                if !closing && sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Collect persistable frames still queued; the worker returns them to
    // the user's mailbox.
    outbound.close();
    while let Ok(out) = outbound.try_recv() {
        if let Outbound::Frame {
            payload,
            persist: true,
        } = out
        {
            undelivered.push(payload.as_str().to_owned());
        }
    }
    let _ = events.send(WorkerEvent::SessionClosed { id, undelivered });
}
