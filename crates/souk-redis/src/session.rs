//! One reconnecting, pipelined TCP connection to Redis.
//!
//! The session runs as a spawned actor; callers hold a cheap [`RedisHandle`]
//! and receive [`SessionEvent`]s on the channel supplied at spawn time.
//!
//! # Send queue
//!
//! Each queue element is either *unsent* or *sent-awaiting-reply*; the head
//! element is the one on the wire.  Sends arriving while the head is in
//! flight concatenate onto the unsent tail element (pipelining) up to
//! `max_pipeline_size` commands, after which a new element is started.
//! Request tags ride on the elements; one tag is consumed per reply.
//!
//! # Reconnect
//!
//! EOF or reset closes the socket and reconnects after
//! `conn_retry_interval`.  Unsent elements (with their tags) survive and
//! are flushed before the `Connected` event fires; the sent head element
//! is dropped, so in-flight tags are never replayed and callers must
//! tolerate missing replies.  An explicit `close()` never reconnects.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, info};

use crate::cmd;
use crate::codec::{RespCodec, parse_reply};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Sentinel addresses (`host:port`).  Empty means connect directly.
    pub sentinels: Vec<String>,
    /// Logical master name resolved through the sentinels.
    pub master_name: String,
    pub conn_retry_interval: Duration,
    /// Commands concatenated into one queue element before a new element
    /// is started.
    pub max_pipeline_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            host: "127.0.0.1".to_owned(),
            port: 6379,
            sentinels: Vec::new(),
            master_name: "mymaster".to_owned(),
            conn_retry_interval: Duration::from_millis(500),
            max_pipeline_size: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Events and handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SessionEvent<T> {
    /// Connection (re)established and the surviving queue flushed.
    Connected,
    /// Unsolicited pub/sub push (`message` / `pmessage`).
    Push(Vec<String>),
    /// Reply matched to a request tag supplied with `send`.
    Reply { tag: T, data: Vec<String> },
}

enum Command<T> {
    Send { payload: Vec<u8>, tags: Vec<T> },
    Close,
}

/// Handle to a spawned session.  Dropping every handle closes the session.
pub struct RedisHandle<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
}

impl<T> Clone for RedisHandle<T> {
    fn clone(&self) -> Self {
        RedisHandle {
            tx: self.tx.clone(),
        }
    }
}

impl<T> RedisHandle<T> {
    /// Queue `payload` for sending.  `tags` must hold exactly one tag per
    /// command in the payload; each reply consumes one tag.
    pub fn send(&self, payload: Vec<u8>, tags: Vec<T>) {
        let _ = self.tx.send(Command::Send { payload, tags });
    }

    /// Close the connection without reconnecting.
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

pub struct RedisSession;

impl RedisSession {
    /// Spawn the session actor.  Events are wrapped through `wrap` so the
    /// caller can multiplex several sessions onto one channel.
    pub fn spawn<T, E, F>(
        cfg: SessionConfig,
        label: impl Into<String>,
        events: mpsc::UnboundedSender<E>,
        wrap: F,
    ) -> RedisHandle<T>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: Fn(SessionEvent<T>) -> E + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            cfg,
            label: label.into(),
            events,
            wrap,
            queue: VecDeque::new(),
        };
        tokio::spawn(actor.run(rx));
        RedisHandle { tx }
    }
}

struct QueueItem<T> {
    payload: Vec<u8>,
    tags: VecDeque<T>,
    commands: usize,
    sent: bool,
}

enum Drive {
    Close,
    Reconnect,
}

struct Actor<T, E, F> {
    cfg: SessionConfig,
    label: String,
    events: mpsc::UnboundedSender<E>,
    wrap: F,
    queue: VecDeque<QueueItem<T>>,
}

impl<T, E, F> Actor<T, E, F>
where
    T: Send + 'static,
    E: Send + 'static,
    F: Fn(SessionEvent<T>) -> E + Send + 'static,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command<T>>) {
        loop {
            let stream = match self.connect().await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(session = %self.label, error = %e, "connect failed");
                    if self.wait_retry(&mut rx).await {
                        return;
                    }
                    continue;
                }
            };
            match self.drive(stream, &mut rx).await {
                Drive::Close => return,
                Drive::Reconnect => {
                    // The head element was on the wire when the connection
                    // died; its remaining replies will never arrive.  Drop
                    // it so the tags are not replayed against fresh replies.
                    if self.queue.front().is_some_and(|item| item.sent) {
                        self.queue.pop_front();
                    }
                    if self.wait_retry(&mut rx).await {
                        return;
                    }
                }
            }
        }
    }

    async fn drive(&mut self, stream: TcpStream, rx: &mut mpsc::UnboundedReceiver<Command<T>>) -> Drive {
        let (read, mut write) = stream.into_split();
        let mut replies = FramedRead::new(read, RespCodec::new());

        // Flush whatever survived the previous connection before announcing
        // the connect, so that queued commands precede anything the
        // on-connect reaction sends.
        if !self.queue.is_empty() {
            debug!(session = %self.label, queued = self.queue.len(), "flushing queued commands");
            if self.write_head(&mut write).await.is_err() {
                return Drive::Reconnect;
            }
        }
        self.emit(SessionEvent::Connected);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Send { payload, tags }) => {
                        self.enqueue(payload, tags);
                        if self.write_head(&mut write).await.is_err() {
                            return Drive::Reconnect;
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = write.shutdown().await;
                        info!(session = %self.label, "closed");
                        return Drive::Close;
                    }
                },
                reply = replies.next() => match reply {
                    Some(Ok(data)) => {
                        if self.on_reply(data, &mut write).await.is_err() {
                            return Drive::Reconnect;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(session = %self.label, error = %e, "read failed");
                        return Drive::Reconnect;
                    }
                    None => {
                        debug!(session = %self.label, "connection closed by peer");
                        return Drive::Reconnect;
                    }
                },
            }
        }
    }

    /// Append to the unsent tail element if the pipeline has room,
    /// otherwise start a new element.
    fn enqueue(&mut self, payload: Vec<u8>, tags: Vec<T>) {
        let commands = tags.len();
        let limit = self.cfg.max_pipeline_size.max(1);
        if let Some(tail) = self.queue.back_mut() {
            if !tail.sent && tail.commands + commands <= limit {
                tail.payload.extend_from_slice(&payload);
                tail.tags.extend(tags);
                tail.commands += commands;
                return;
            }
        }
        self.queue.push_back(QueueItem {
            payload,
            tags: tags.into(),
            commands,
            sent: false,
        });
    }

    /// Put the head element on the wire if it is not there already.
    async fn write_head(&mut self, write: &mut OwnedWriteHalf) -> io::Result<()> {
        if let Some(head) = self.queue.front_mut() {
            if !head.sent {
                write.write_all(&head.payload).await?;
                head.sent = true;
            }
        }
        Ok(())
    }

    async fn on_reply(&mut self, data: Vec<String>, write: &mut OwnedWriteHalf) -> io::Result<()> {
        // Pub/sub pushes do not consume request tags.
        if matches!(
            data.first().map(String::as_str),
            Some("message" | "pmessage")
        ) {
            self.emit(SessionEvent::Push(data));
            return Ok(());
        }

        let tag = match self.queue.front_mut() {
            Some(head) if head.sent => head.tags.pop_front(),
            _ => {
                debug!(session = %self.label, "reply with no request in flight");
                return Ok(());
            }
        };
        match tag {
            Some(tag) => self.emit(SessionEvent::Reply { tag, data }),
            None => debug!(session = %self.label, "reply without a pending tag"),
        }

        if self
            .queue
            .front()
            .is_some_and(|head| head.sent && head.tags.is_empty())
        {
            self.queue.pop_front();
            self.write_head(write).await?;
        }
        Ok(())
    }

    fn emit(&self, event: SessionEvent<T>) {
        let _ = self.events.send((self.wrap)(event));
    }

    /// Sleep out the retry interval, still accepting commands.  Returns
    /// true when the session was closed while waiting.
    async fn wait_retry(&mut self, rx: &mut mpsc::UnboundedReceiver<Command<T>>) -> bool {
        let sleep = tokio::time::sleep(self.cfg.conn_retry_interval);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return false,
                command = rx.recv() => match command {
                    Some(Command::Send { payload, tags }) => self.enqueue(payload, tags),
                    Some(Command::Close) | None => return true,
                },
            }
        }
    }

    async fn connect(&mut self) -> io::Result<TcpStream> {
        if self.cfg.sentinels.is_empty() {
            return TcpStream::connect((self.cfg.host.as_str(), self.cfg.port)).await;
        }
        for idx in 0..self.cfg.sentinels.len() {
            let addr = self.cfg.sentinels[idx].clone();
            let (host, port) = match query_master(&addr, &self.cfg.master_name).await {
                Ok(master) => master,
                Err(e) => {
                    debug!(session = %self.label, sentinel = %addr, error = %e, "sentinel did not answer");
                    continue;
                }
            };
            // The first sentinel that answers moves to the head of the
            // list for the next attempt.
            if idx != 0 {
                self.cfg.sentinels.swap(0, idx);
            }
            info!(session = %self.label, host = %host, port, "sentinel resolved master");
            return TcpStream::connect((host.as_str(), port)).await;
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no sentinel could resolve the master",
        ))
    }
}

/// Ask one sentinel for the master address.
async fn query_master(sentinel_addr: &str, master_name: &str) -> io::Result<(String, u16)> {
    let mut stream = TcpStream::connect(sentinel_addr).await?;
    stream
        .write_all(&cmd::sentinel_get_master(master_name))
        .await?;
    let mut buf = BytesMut::with_capacity(256);
    loop {
        if let Some((tokens, _)) = parse_reply(&buf).map_err(io::Error::other)? {
            if tokens.len() < 2 {
                return Err(io::Error::other("unexpected sentinel reply"));
            }
            let port = tokens[1]
                .parse()
                .map_err(|_| io::Error::other("sentinel returned a bad port"))?;
            return Ok((tokens[0].clone(), port));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
}
