//! The worker core: one task owning every piece of per-node state.
//!
//! Sessions, the Redis facade and the acceptor all run as separate tasks,
//! but the state they coordinate on (session table, user map, channel,
//! in-flight queues) lives here and is touched only between awaits of the
//! worker's event loop, so none of it needs a lock.
//!
//! Inbound application commands and Redis completions both arrive as
//! [`WorkerEvent`]s; every handler runs to completion before the next
//! event is taken.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use souk_protocol::{
    AckResult, DeleteCmd, LoginCmd, Post, PublishCmd, RegisterCmd, ServerFrame, SubscribeCmd,
};
use souk_redis::facade::{Conn, DbEvent, RedisFacade, RequestTag};
use souk_redis::session::SessionEvent;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::{debug, error, info, warn};

use crate::acceptor::{self, AcceptorConfig, ClientStream};
use crate::channel::{ChannelConfig, ChannelStore};
use crate::config::{CoreConfig, GatewayConfig, TimeoutConfig};
use crate::crypto::{self, PwdGen};
use crate::filter::SubscriptionFilter;
use crate::session::{self, SessionTiming};
use crate::table::{SessionId, SessionTable};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub enum WorkerEvent {
    /// A connection that completed the WebSocket handshake.
    NewConnection(ClientStream),
    /// One inbound text frame from a session.
    Frame { id: SessionId, text: String },
    /// A session task finished; `undelivered` holds persistable frames it
    /// could not deliver.
    SessionClosed {
        id: SessionId,
        undelivered: Vec<String>,
    },
    /// Anything coming back from the Redis facade's connections.
    Redis(Conn, SessionEvent<RequestTag>),
}

struct PendingPost {
    session: SessionId,
    post: Post,
}

struct PendingReg {
    session: SessionId,
    password: String,
    token: Option<String>,
}

struct PendingLogin {
    session: SessionId,
    password: String,
    token: Option<String>,
}

/// Outcome of one inbound command.
#[derive(Debug, PartialEq, Eq)]
enum EvRes {
    Ok,
    /// The command was refused but the session stays open (quota, empty
    /// publish).
    Rejected,
    /// Protocol violation; the session is shut down.
    Fatal,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub sessions: usize,
    pub post_queue: usize,
    pub reg_queue: usize,
    pub login_queue: usize,
    pub posts: usize,
}

pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct Worker {
    core: CoreConfig,
    channel_cfg: ChannelConfig,
    timeouts: TimeoutConfig,
    facade: RedisFacade,
    table: SessionTable,
    /// user id -> live session handle; the invariant is that the slot's
    /// `user_id` equals the key.
    sessions: HashMap<String, SessionId>,
    channel: ChannelStore,
    post_queue: VecDeque<PendingPost>,
    reg_queue: VecDeque<PendingReg>,
    login_queue: VecDeque<PendingLogin>,
    /// Highest post id seen on the posts channel; catch-up retrieval
    /// resumes just above it.
    last_post_id: i64,
    pwd_gen: PwdGen,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    /// Held until the first posts load completes, then spawned.
    acceptor: Option<(AcceptorConfig, TcpListener)>,
    acceptor_stop: watch::Sender<bool>,
}

impl Worker {
    pub fn new(
        core: CoreConfig,
        channel_cfg: ChannelConfig,
        timeouts: TimeoutConfig,
        facade: RedisFacade,
        acceptor_cfg: AcceptorConfig,
        listener: TcpListener,
        events_tx: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Worker {
            core,
            channel_cfg,
            timeouts,
            facade,
            table: SessionTable::new(),
            sessions: HashMap::new(),
            channel: ChannelStore::new(),
            post_queue: VecDeque::new(),
            reg_queue: VecDeque::new(),
            login_queue: VecDeque::new(),
            last_post_id: -1,
            pwd_gen: PwdGen::new(),
            events_tx,
            acceptor: Some((acceptor_cfg, listener)),
            acceptor_stop: watch::channel(false).0,
        }
    }

    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.shutdown();
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => return,
                }
            }
        }
        // Give sessions a moment to finish their close handshakes and
        // report back.
        let drain = async {
            while !self.table.is_empty() {
                match events.recv().await {
                    Some(event) => self.handle_event(event),
                    None => break,
                }
            }
        };
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), drain).await;
        info!(stats = ?self.stats(), "worker stopped");
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            sessions: self.table.len(),
            post_queue: self.post_queue.len(),
            reg_queue: self.reg_queue.len(),
            login_queue: self.login_queue.len(),
            posts: self.channel.post_count(),
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::NewConnection(client) => self.on_new_connection(client),
            WorkerEvent::Frame { id, text } => self.on_app(id, &text),
            WorkerEvent::SessionClosed { id, undelivered } => {
                self.on_session_closed(id, undelivered);
            }
            WorkerEvent::Redis(conn, event) => {
                if let Some(db_event) = self.facade.process(conn, event) {
                    self.on_db_event(db_event);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    fn on_new_connection(&mut self, client: ClientStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.table.insert(tx);
        let timing = SessionTiming {
            idle: self.timeouts.idle,
            login_grace_pongs: self.timeouts.login_grace_pongs,
        };
        let events = self.events_tx.clone();
        match client {
            ClientStream::Plain(ws) => {
                tokio::spawn(session::run(ws, id, timing, rx, events));
            }
            ClientStream::Tls(ws) => {
                tokio::spawn(session::run(ws, id, timing, rx, events));
            }
        }
        debug!(session = %id, sessions = self.table.len(), "session opened");
    }

    fn on_session_closed(&mut self, id: SessionId, undelivered: Vec<String>) {
        let Some(slot) = self.table.remove(id) else {
            return;
        };
        debug!(session = %id, sessions = self.table.len(), "session closed");
        let Some(user_id) = slot.user_id else {
            return;
        };
        // A kicked session had its identity cleared; only the map's
        // current owner cleans up.
        if self.sessions.get(&user_id) != Some(&id) {
            return;
        }
        self.sessions.remove(&user_id);
        self.facade.on_user_offline(&user_id);
        if !undelivered.is_empty() {
            debug!(user_id = %user_id, count = undelivered.len(),
                "returning undelivered messages to the mailbox");
            self.facade.store_chat_msgs(&user_id, undelivered);
        }
    }

    fn shutdown_session(&self, id: SessionId) {
        if let Some(slot) = self.table.get(id) {
            slot.shutdown();
        }
    }

    fn shutdown(&mut self) {
        info!(sessions = self.table.len(), "shutdown requested");
        let _ = self.acceptor_stop.send(true);
        self.acceptor = None;
        for (_, slot) in self.table.iter() {
            slot.shutdown();
        }
        self.facade.close_all();
    }

    // -----------------------------------------------------------------------
    // Inbound application commands
    // -----------------------------------------------------------------------

    fn on_app(&mut self, id: SessionId, text: &str) {
        if self.dispatch_app(id, text) == EvRes::Fatal {
            self.shutdown_session(id);
        }
    }

    fn dispatch_app(&mut self, id: SessionId, text: &str) -> EvRes {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            debug!(session = %id, "invalid JSON frame");
            return EvRes::Fatal;
        };
        let Some(cmd) = frame.get("cmd").and_then(Value::as_str).map(str::to_owned) else {
            debug!(session = %id, "frame without cmd");
            return EvRes::Fatal;
        };
        let logged_in = self
            .table
            .get(id)
            .is_some_and(|slot| slot.user_id.is_some());
        if logged_in {
            match cmd.as_str() {
                "presence" => self.on_app_presence(id, frame),
                "message" => self.on_app_chat_msg(id, frame),
                "subscribe" => self.on_app_subscribe(id, &frame),
                "filenames" => self.on_app_filenames(id),
                "publish" => self.on_app_publish(id, frame),
                "delete" => self.on_app_delete(id, &frame),
                _ => {
                    debug!(session = %id, cmd = %cmd, "unknown command");
                    EvRes::Fatal
                }
            }
        } else {
            match cmd.as_str() {
                "login" => self.on_app_login(id, &frame),
                "register" => self.on_app_register(id, &frame),
                _ => {
                    debug!(session = %id, cmd = %cmd, "command requires login");
                    EvRes::Fatal
                }
            }
        }
    }

    fn on_app_register(&mut self, id: SessionId, frame: &Value) -> EvRes {
        let Ok(cmd) = serde_json::from_value::<RegisterCmd>(frame.clone()) else {
            return EvRes::Fatal;
        };
        let was_idle = self.reg_queue.is_empty();
        self.reg_queue.push_back(PendingReg {
            session: id,
            password: String::new(),
            token: cmd.token,
        });
        if was_idle {
            self.facade.request_user_id();
        }
        EvRes::Ok
    }

    fn on_app_login(&mut self, id: SessionId, frame: &Value) -> EvRes {
        let Ok(cmd) = serde_json::from_value::<LoginCmd>(frame.clone()) else {
            debug!(session = %id, "malformed login");
            return EvRes::Fatal;
        };
        let Some(slot) = self.table.get_mut(id) else {
            return EvRes::Ok;
        };
        slot.user_id = Some(cmd.user.clone());
        self.login_queue.push_back(PendingLogin {
            session: id,
            password: cmd.password,
            token: cmd.token,
        });
        self.facade.retrieve_user_data(&cmd.user);
        EvRes::Ok
    }

    fn on_app_subscribe(&mut self, id: SessionId, frame: &Value) -> EvRes {
        let Ok(cmd) = serde_json::from_value::<SubscribeCmd>(frame.clone()) else {
            debug!(session = %id, "malformed subscribe");
            return EvRes::Fatal;
        };
        let Some(slot) = self.table.get_mut(id) else {
            return EvRes::Ok;
        };
        slot.filter = SubscriptionFilter::new(cmd.any_of_features, cmd.filters, &cmd.ranges);
        self.channel
            .add_member(id, self.channel_cfg.cleanup_rate, &self.table);

        let items = match self.table.get(id) {
            Some(slot) => self.channel.get_posts(
                cmd.last_post_id,
                self.core.max_posts_on_sub,
                |post| slot.filter.accepts(post),
            ),
            None => Vec::new(),
        };
        self.send_frame(
            id,
            &ServerFrame::SubscribeAck {
                result: AckResult::Ok,
            },
            false,
        );
        if !items.is_empty() {
            self.send_frame(id, &ServerFrame::Post { items }, false);
        }
        EvRes::Ok
    }

    fn on_app_publish(&mut self, id: SessionId, frame: Value) -> EvRes {
        let Ok(cmd) = serde_json::from_value::<PublishCmd>(frame) else {
            debug!(session = %id, "malformed publish");
            return EvRes::Fatal;
        };
        let Some(slot) = self.table.get(id) else {
            return EvRes::Ok;
        };
        let Some(mut post) = cmd.items.into_iter().next() else {
            self.send_frame(id, &publish_fail(), false);
            return EvRes::Rejected;
        };
        if slot.remaining_posts < 1 {
            self.send_frame(id, &publish_fail(), false);
            return EvRes::Rejected;
        }
        // Never trust `from` or `date` from the client.
        post.from = slot.user_id.clone().unwrap_or_default();
        post.date = now_epoch();
        debug!(user_id = %post.from, "new post");
        self.post_queue.push_back(PendingPost { session: id, post });
        self.facade.request_post_id();
        EvRes::Ok
    }

    fn on_app_chat_msg(&mut self, id: SessionId, mut frame: Value) -> EvRes {
        let Some(user_id) = self.table.get(id).and_then(|slot| slot.user_id.clone()) else {
            return EvRes::Ok;
        };
        let Some(obj) = frame.as_object_mut() else {
            return EvRes::Fatal;
        };
        obj.insert("from".to_owned(), Value::String(user_id));
        let to = frame.get("to").and_then(Value::as_str).map(str::to_owned);
        let post_id = frame.get("post_id").and_then(Value::as_i64);
        let msg_id = frame.get("id").and_then(Value::as_i64);
        let (Some(to), Some(post_id), Some(msg_id)) = (to, post_id, msg_id) else {
            debug!(session = %id, "malformed chat message");
            return EvRes::Fatal;
        };

        let payload = frame.to_string();
        match self.sessions.get(&to).copied() {
            // Online on this node: skip Redis entirely.
            Some(peer) => self.send_raw(peer, payload, true),
            // Offline or on another node: into the mailbox.
            None => self.facade.store_chat_msgs(&to, [payload]),
        }

        // The sender re-sends on reconnect, so the ack is not persisted.
        self.send_frame(id, &ServerFrame::server_ack(to, post_id, msg_id), false);
        EvRes::Ok
    }

    fn on_app_presence(&mut self, id: SessionId, mut frame: Value) -> EvRes {
        let Some(user_id) = self.table.get(id).and_then(|slot| slot.user_id.clone()) else {
            return EvRes::Ok;
        };
        let Some(obj) = frame.as_object_mut() else {
            return EvRes::Fatal;
        };
        obj.insert("from".to_owned(), Value::String(user_id));
        let Some(to) = frame.get("to").and_then(Value::as_str).map(str::to_owned) else {
            debug!(session = %id, "malformed presence");
            return EvRes::Fatal;
        };
        let payload = frame.to_string();
        match self.sessions.get(&to).copied() {
            Some(peer) => self.send_raw(peer, payload, false),
            None => self.facade.send_presence(&to, &payload),
        }
        EvRes::Ok
    }

    fn on_app_delete(&mut self, id: SessionId, frame: &Value) -> EvRes {
        let Ok(cmd) = serde_json::from_value::<DeleteCmd>(frame.clone()) else {
            debug!(session = %id, "malformed delete");
            return EvRes::Fatal;
        };
        let Some(user_id) = self.table.get(id).and_then(|slot| slot.user_id.clone()) else {
            return EvRes::Ok;
        };
        // Removal happens when the broadcast command comes back through
        // the posts channel, here and on every peer worker alike.
        self.delete_post(cmd.id, &user_id);
        self.send_frame(
            id,
            &ServerFrame::DeleteAck {
                result: AckResult::Ok,
            },
            true,
        );
        EvRes::Ok
    }

    fn on_app_filenames(&mut self, id: SessionId) -> EvRes {
        let names = (0..self.core.filenames_count)
            .map(|_| crypto::filename_url(&self.core.mms_host, &self.core.mms_key, &mut self.pwd_gen))
            .collect();
        self.send_frame(
            id,
            &ServerFrame::FilenamesAck {
                result: AckResult::Ok,
                names,
            },
            false,
        );
        EvRes::Ok
    }

    // -----------------------------------------------------------------------
    // Redis completions
    // -----------------------------------------------------------------------

    fn on_db_event(&mut self, event: DbEvent) {
        match event {
            DbEvent::MenuConnected => {
                // Fresh start or reconnect; either way, pick up whatever
                // was published while we were not listening.
                self.facade.retrieve_posts(self.last_post_id + 1);
            }
            DbEvent::ChatSubConnected => {
                for user_id in self.sessions.keys() {
                    self.facade.on_user_online(user_id);
                }
            }
            DbEvent::ChannelPost(msg) => self.on_channel_post(&msg),
            DbEvent::Posts(msgs) => self.on_posts_loaded(msgs),
            DbEvent::PostId(post_id) => self.on_post_id(post_id),
            DbEvent::UserId(user_id) => self.on_user_id(&user_id),
            DbEvent::UserData(fields) => self.on_user_data(&fields),
            DbEvent::Registered => self.on_registered(),
            DbEvent::PostStored => {}
            DbEvent::PostRemoved { removed } => {
                if !removed {
                    debug!("delete command removed no stored post");
                }
            }
            DbEvent::ChatMsgs { user_id, msgs } => self.on_chat_msgs(&user_id, msgs),
            DbEvent::Presence { user_id, msg } => self.on_presence(&user_id, msg),
        }
    }

    /// A frame from the posts channel: either a delete command or a post.
    fn on_channel_post(&mut self, msg: &str) {
        let value: Value = match serde_json::from_str(msg) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, payload = msg, "bad frame on the posts channel");
                return;
            }
        };
        if value.get("cmd").is_some() {
            let post_id = value.get("id").and_then(Value::as_i64);
            let from = value.get("from").and_then(Value::as_str);
            let (Some(post_id), Some(from)) = (post_id, from) else {
                error!(payload = msg, "malformed delete command");
                return;
            };
            if !self.channel.remove_post(post_id, from) {
                // Normal for the originating worker's own echo of an
                // expiry deletion, and for posts already dropped by age.
                debug!(post_id, user_id = %from, "failed to remove post");
            }
            return;
        }

        let post: Post = match serde_json::from_value(value) {
            Ok(post) => post,
            Err(e) => {
                error!(error = %e, payload = msg, "malformed post on the posts channel");
                return;
            }
        };
        if post.id > self.last_post_id {
            self.last_post_id = post.id;
        }

        // Serialize the delivery frame once; every recipient gets the
        // same shared buffer.
        let frame = ServerFrame::Post {
            items: vec![post.clone()],
        };
        let payload = match serde_json::to_string(&frame) {
            Ok(json) => Utf8Bytes::from(json),
            Err(e) => {
                error!(error = %e, "failed to serialize post frame");
                return;
            }
        };
        let (_, dead) =
            self.channel
                .broadcast(&post, &payload, &self.table, self.channel_cfg.max_posts);
        if dead > 0 {
            debug!(removed = dead, "dropped dead channel members");
        }

        let expired = self
            .channel
            .remove_expired_posts(now_epoch(), self.channel_cfg.post_expiration);
        // Deleting an expired post echoes a delete command back to this
        // worker too; the duplicate removal fails harmlessly.
        for (post_id, from) in &expired {
            self.delete_post(*post_id, from);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired posts removed");
        }
    }

    fn on_posts_loaded(&mut self, msgs: Vec<String>) {
        info!(count = msgs.len(), "posts loaded from the registry");
        for msg in &msgs {
            if !msg.is_empty() {
                self.on_channel_post(msg);
            }
        }
        // First load complete: the node is caught up and may accept
        // connections.
        self.start_acceptor();
    }

    fn start_acceptor(&mut self) {
        let Some((cfg, listener)) = self.acceptor.take() else {
            return;
        };
        let events = self.events_tx.clone();
        let stop = self.acceptor_stop.subscribe();
        tokio::spawn(acceptor::run(cfg, listener, events, stop));
    }

    fn on_post_id(&mut self, post_id: i64) {
        let Some(pending) = self.post_queue.pop_front() else {
            warn!("post id reply without a pending publish");
            return;
        };
        let mut post = pending.post;
        post.id = post_id;
        let json = match serde_json::to_string(&post) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to serialize post");
                return;
            }
        };
        self.facade.publish_post(&json, post_id);

        // The publisher must receive this ack before any chat message
        // about the post: both ride the same reply path, and peers only
        // learn of the post through the PUBLISH issued above.
        let ack = ServerFrame::PublishAck {
            result: AckResult::Ok,
            id: Some(post_id),
            date: Some(post.date),
        };
        let target = self.table.get_mut(pending.session).map(|slot| {
            slot.remaining_posts -= 1;
            (slot.remaining_posts, slot.user_id.clone())
        });
        match target {
            Some((remaining, user_id)) => {
                self.send_frame(pending.session, &ack, true);
                if let Some(user_id) = user_id {
                    self.facade.update_remaining(&user_id, remaining);
                }
            }
            None => {
                // The publisher disconnected while the id was in flight;
                // spool the ack into the mailbox for the next login.
                info!(user_id = %post.from, "spooling publish ack to the mailbox");
                if let Ok(json) = serde_json::to_string(&ack) {
                    self.facade.store_chat_msgs(&post.from, [json]);
                }
            }
        }
    }

    fn on_user_id(&mut self, user_id: &str) {
        loop {
            let Some(entry) = self.reg_queue.front() else {
                return;
            };
            let session = entry.session;
            if self.table.get(session).is_none() {
                // Gone before the id arrived; try the next applicant.  If
                // none is left the requested id is simply lost.
                self.reg_queue.pop_front();
                continue;
            }

            let password = self.pwd_gen.generate(self.core.pwd_size);
            if let Some(front) = self.reg_queue.front_mut() {
                front.password = password.clone();
            }
            let digest = crypto::hex_digest(&password);
            let deadline = now_epoch() + self.core.post_interval;
            self.facade
                .register_user(user_id, &digest, self.core.allowed_posts, deadline);
            if let Some(slot) = self.table.get_mut(session) {
                slot.user_id = Some(user_id.to_owned());
                slot.remaining_posts = self.core.allowed_posts;
            }
            info!(user_id = %user_id, remaining = self.core.allowed_posts, "new user");
            return;
        }
    }

    fn on_registered(&mut self) {
        let Some(entry) = self.reg_queue.pop_front() else {
            warn!("register reply without a pending registration");
            return;
        };
        if let Some(user_id) = self
            .table
            .get(entry.session)
            .and_then(|slot| slot.user_id.clone())
        {
            self.facade.on_user_online(&user_id);
            if self.sessions.insert(user_id.clone(), entry.session).is_some() {
                warn!(user_id = %user_id, "freshly registered user already had a session");
            }
            self.send_frame(
                entry.session,
                &ServerFrame::RegisterAck {
                    result: AckResult::Ok,
                    id: user_id.clone(),
                    password: entry.password.clone(),
                },
                false,
            );
            if let Some(slot) = self.table.get(entry.session) {
                slot.notify_logged_in();
            }
            if let Some(token) = &entry.token {
                self.facade.publish_token(&user_id, token);
            }
        }
        if !self.reg_queue.is_empty() {
            self.facade.request_user_id();
        }
    }

    fn on_user_data(&mut self, fields: &[String]) {
        let Some(entry) = self.login_queue.pop_front() else {
            warn!("user data reply without a pending login");
            return;
        };
        let Some(user_id) = self
            .table
            .get(entry.session)
            .and_then(|slot| slot.user_id.clone())
        else {
            return;
        };

        let stored_digest = fields.first().map(String::as_str).unwrap_or("");
        let digest = crypto::hex_digest(&entry.password);
        if stored_digest.is_empty() || !crypto::constant_time_eq(stored_digest, &digest) {
            debug!(user_id = %user_id, "login failed");
            self.send_frame(
                entry.session,
                &ServerFrame::LoginAck {
                    result: AckResult::Fail,
                    remaining_posts: None,
                },
                false,
            );
            self.shutdown_session(entry.session);
            return;
        }

        // Kick any stale session under the same id; clearing its identity
        // keeps its teardown from evicting the session replacing it.
        if let Some(old) = self.sessions.get(&user_id).copied() {
            if old != entry.session {
                if let Some(old_slot) = self.table.get_mut(old) {
                    old_slot.user_id = None;
                    old_slot.shutdown();
                }
            }
        }
        self.sessions.insert(user_id.clone(), entry.session);
        self.facade.on_user_online(&user_id);
        self.facade.retrieve_chat_msgs(&user_id);

        let allowed: i64 = fields.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
        let mut remaining: i64 = fields.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
        let deadline: i64 = fields.get(3).and_then(|s| s.parse().ok()).unwrap_or(0);
        let now = now_epoch();
        if now > deadline {
            // The quota window elapsed; start a fresh one.  Counters are
            // not rewritten after this point, an operator update must not
            // be clobbered mid-session.
            self.facade
                .update_post_deadline(&user_id, allowed, now + self.core.post_interval);
            remaining = allowed;
        }
        if let Some(slot) = self.table.get_mut(entry.session) {
            slot.remaining_posts = remaining;
        }
        self.send_frame(
            entry.session,
            &ServerFrame::LoginAck {
                result: AckResult::Ok,
                remaining_posts: Some(remaining),
            },
            false,
        );
        if let Some(slot) = self.table.get(entry.session) {
            slot.notify_logged_in();
        }
        if let Some(token) = &entry.token {
            self.facade.publish_token(&user_id, token);
        }
    }

    fn on_chat_msgs(&mut self, user_id: &str, msgs: Vec<String>) {
        if msgs.is_empty() {
            return;
        }
        match self.sessions.get(user_id).copied() {
            Some(session) if self.table.get(session).is_some() => {
                for msg in msgs {
                    self.send_raw(session, msg, true);
                }
            }
            _ => {
                // Gone between the wake and the retrieval; put the
                // messages back for the next login.
                debug!(user_id = %user_id, "re-storing messages for an offline user");
                self.facade.store_chat_msgs(user_id, msgs);
            }
        }
    }

    fn on_presence(&mut self, user_id: &str, msg: String) {
        match self.sessions.get(user_id).copied() {
            Some(session) => self.send_raw(session, msg, false),
            None => warn!(user_id = %user_id, "presence for a user no longer here"),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn delete_post(&self, post_id: i64, from: &str) {
        let frame = ServerFrame::Delete {
            from: from.to_owned(),
            id: post_id,
        };
        match serde_json::to_string(&frame) {
            Ok(json) => self.facade.remove_post(post_id, &json),
            Err(e) => error!(error = %e, "failed to serialize delete command"),
        }
    }

    fn send_frame(&self, id: SessionId, frame: &ServerFrame, persist: bool) {
        if let Some(slot) = self.table.get(id) {
            match serde_json::to_string(frame) {
                Ok(json) => slot.send_frame(Utf8Bytes::from(json), persist),
                Err(e) => error!(error = %e, "failed to serialize frame"),
            }
        }
    }

    fn send_raw(&self, id: SessionId, json: String, persist: bool) {
        if let Some(slot) = self.table.get(id) {
            slot.send_frame(Utf8Bytes::from(json), persist);
        }
    }
}

fn publish_fail() -> ServerFrame {
    ServerFrame::PublishAck {
        result: AckResult::Fail,
        id: None,
        date: None,
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Assemble the facade and worker around a bound listener and run until
/// `shutdown` flips.
pub async fn run_gateway(
    cfg: GatewayConfig,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    shutdown: watch::Receiver<bool>,
) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let facade = RedisFacade::spawn(cfg.redis.clone(), events_tx.clone(), WorkerEvent::Redis);
    let acceptor_cfg = AcceptorConfig {
        server_name: cfg.server.server_name.clone(),
        handshake_timeout: cfg.timeouts.handshake,
        max_frame_bytes: cfg.timeouts.max_frame_bytes,
        tls,
    };
    let worker = Worker::new(
        cfg.core,
        cfg.channel,
        cfg.timeouts,
        facade,
        acceptor_cfg,
        listener,
        events_tx,
    );
    worker.run(events_rx, shutdown).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use souk_redis::facade::FacadeConfig;
    use souk_redis::session::SessionConfig;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::session::Outbound;

    fn test_core() -> CoreConfig {
        CoreConfig {
            max_posts_on_sub: 10,
            pwd_size: 10,
            allowed_posts: 2,
            post_interval: 1000,
            mms_key: "mms-key".to_owned(),
            mms_host: "http://img.test".to_owned(),
            filenames_count: 5,
        }
    }

    fn test_worker() -> Worker {
        // Point the facade at a dead port with a huge retry interval so
        // its sessions stay quiet for the duration of the test.
        let facade_cfg = FacadeConfig {
            session: SessionConfig {
                host: "127.0.0.1".to_owned(),
                port: 1,
                conn_retry_interval: Duration::from_secs(3600),
                ..SessionConfig::default()
            },
            ..FacadeConfig::default()
        };
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let facade = RedisFacade::spawn(facade_cfg, events_tx.clone(), WorkerEvent::Redis);
        let listener = {
            let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            std_listener.set_nonblocking(true).unwrap();
            TcpListener::from_std(std_listener).unwrap()
        };
        let acceptor_cfg = AcceptorConfig {
            server_name: "test".to_owned(),
            handshake_timeout: Duration::from_secs(1),
            max_frame_bytes: 1 << 20,
            tls: None,
        };
        let timeouts = TimeoutConfig {
            handshake: Duration::from_secs(1),
            idle: Duration::from_secs(30),
            login_grace_pongs: 2,
            max_frame_bytes: 1 << 20,
        };
        let channel_cfg = ChannelConfig {
            cleanup_rate: 100,
            max_posts: 100,
            post_expiration: 3600,
        };
        Worker::new(
            test_core(),
            channel_cfg,
            timeouts,
            facade,
            acceptor_cfg,
            listener,
            events_tx,
        )
    }

    fn fake_session(worker: &mut Worker) -> (SessionId, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (worker.table.insert(tx), rx)
    }

    fn recv_frame(rx: &mut UnboundedReceiver<Outbound>) -> Value {
        match rx.try_recv() {
            Ok(Outbound::Frame { payload, .. }) => serde_json::from_str(payload.as_str()).unwrap(),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    fn register(worker: &mut Worker, rx: &mut UnboundedReceiver<Outbound>, id: SessionId, user: &str) {
        worker.on_app(id, &json!({"cmd": "register"}).to_string());
        worker.on_db_event(DbEvent::UserId(user.to_owned()));
        worker.on_db_event(DbEvent::Registered);
        let ack = recv_frame(rx);
        assert_eq!(ack["cmd"], "register_ack");
        assert_eq!(ack["id"], user);
        // The LoggedIn control message follows the ack.
        assert!(matches!(rx.try_recv(), Ok(Outbound::LoggedIn)));
    }

    #[tokio::test]
    async fn register_assigns_id_and_password_and_tracks_the_session() {
        let mut worker = test_worker();
        let (id, mut rx) = fake_session(&mut worker);

        worker.on_app(id, &json!({"cmd": "register"}).to_string());
        assert_eq!(worker.reg_queue.len(), 1);
        worker.on_db_event(DbEvent::UserId("1".to_owned()));
        worker.on_db_event(DbEvent::Registered);

        let ack = recv_frame(&mut rx);
        assert_eq!(ack["cmd"], "register_ack");
        assert_eq!(ack["result"], "ok");
        assert_eq!(ack["id"], "1");
        assert_eq!(ack["password"].as_str().unwrap().len(), 10);
        assert_eq!(worker.sessions.get("1"), Some(&id));
        assert!(worker.reg_queue.is_empty());
    }

    #[tokio::test]
    async fn commands_before_login_shut_the_session_down() {
        let mut worker = test_worker();
        let (id, mut rx) = fake_session(&mut worker);
        worker.on_app(id, &json!({"cmd": "publish", "items": []}).to_string());
        assert!(matches!(rx.try_recv(), Ok(Outbound::Shutdown)));
    }

    #[tokio::test]
    async fn invalid_json_shuts_the_session_down() {
        let mut worker = test_worker();
        let (id, mut rx) = fake_session(&mut worker);
        worker.on_app(id, "{not json");
        assert!(matches!(rx.try_recv(), Ok(Outbound::Shutdown)));
    }

    #[tokio::test]
    async fn publish_respects_the_quota_and_stays_open_on_failure() {
        let mut worker = test_worker();
        let (id, mut rx) = fake_session(&mut worker);
        register(&mut worker, &mut rx, id, "1");

        let publish = json!({"cmd": "publish", "items": [{
            "to": [[], []], "filter": 0, "features": 0, "range_values": [],
            "body": "hi", "date": 0, "from": "", "id": -1
        }]});

        // allowed_posts = 2: two publishes succeed, the third is refused.
        for expected_id in [41, 42] {
            worker.on_app(id, &publish.to_string());
            worker.on_db_event(DbEvent::PostId(expected_id));
            let ack = recv_frame(&mut rx);
            assert_eq!(ack["cmd"], "publish_ack");
            assert_eq!(ack["result"], "ok");
            assert_eq!(ack["id"], expected_id);
            assert!(ack["date"].as_i64().unwrap() > 0);
        }

        worker.on_app(id, &publish.to_string());
        let ack = recv_frame(&mut rx);
        assert_eq!(ack["result"], "fail");
        assert!(ack.get("id").is_none());
        // Quota failure is not fatal.
        assert!(rx.try_recv().is_err());
        assert!(worker.table.get(id).is_some());
    }

    #[tokio::test]
    async fn empty_publish_is_refused_without_shutdown() {
        let mut worker = test_worker();
        let (id, mut rx) = fake_session(&mut worker);
        register(&mut worker, &mut rx, id, "1");
        worker.on_app(id, &json!({"cmd": "publish", "items": []}).to_string());
        let ack = recv_frame(&mut rx);
        assert_eq!(ack["cmd"], "publish_ack");
        assert_eq!(ack["result"], "fail");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_replays_the_matching_backlog() {
        let mut worker = test_worker();

        // Load two posts through the bus path, one with feature bit 1.
        let mk = |id: i64, features: u64| {
            json!({
                "id": id, "from": "9", "body": "x", "to": [[], []],
                "filter": 0, "features": features, "date": now_epoch(),
                "range_values": []
            })
            .to_string()
        };
        worker.on_channel_post(&mk(1, 0));
        worker.on_channel_post(&mk(2, 1));
        assert_eq!(worker.last_post_id, 2);

        let (id, mut rx) = fake_session(&mut worker);
        register(&mut worker, &mut rx, id, "1");
        worker.on_app(
            id,
            &json!({"cmd": "subscribe", "last_post_id": -1, "filters": [],
                     "any_of_features": 1, "ranges": []})
            .to_string(),
        );
        let ack = recv_frame(&mut rx);
        assert_eq!(ack["cmd"], "subscribe_ack");
        assert_eq!(ack["result"], "ok");
        let posts = recv_frame(&mut rx);
        assert_eq!(posts["cmd"], "post");
        let items = posts["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], 2);
    }

    #[tokio::test]
    async fn chat_between_local_sessions_is_direct_and_acked() {
        let mut worker = test_worker();
        let (a, mut a_rx) = fake_session(&mut worker);
        let (b, mut b_rx) = fake_session(&mut worker);
        register(&mut worker, &mut a_rx, a, "1");
        register(&mut worker, &mut b_rx, b, "2");

        worker.on_app(
            b,
            &json!({"cmd": "message", "to": "1", "post_id": 7, "id": 99,
                     "message": "hi", "type": "chat"})
            .to_string(),
        );

        // The sender gets the server ack naming the peer.
        let ack = recv_frame(&mut b_rx);
        assert_eq!(ack["cmd"], "message");
        assert_eq!(ack["type"], "server_ack");
        assert_eq!(ack["from"], "1");
        assert_eq!(ack["ack_id"], 99);
        assert_eq!(ack["result"], "ok");

        // The recipient gets the message with `from` rewritten.
        match a_rx.try_recv() {
            Ok(Outbound::Frame { payload, persist }) => {
                assert!(persist);
                let msg: Value = serde_json::from_str(payload.as_str()).unwrap();
                assert_eq!(msg["from"], "2");
                assert_eq!(msg["message"], "hi");
                assert_eq!(msg["post_id"], 7);
            }
            other => panic!("expected chat frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn login_with_wrong_password_fails_and_closes() {
        let mut worker = test_worker();
        let (id, mut rx) = fake_session(&mut worker);
        worker.on_app(
            id,
            &json!({"cmd": "login", "user": "5", "password": "wrong"}).to_string(),
        );
        worker.on_db_event(DbEvent::UserData(vec![
            crypto::hex_digest("right"),
            "2".to_owned(),
            "2".to_owned(),
            (now_epoch() + 1000).to_string(),
        ]));
        let ack = recv_frame(&mut rx);
        assert_eq!(ack["cmd"], "login_ack");
        assert_eq!(ack["result"], "fail");
        assert!(matches!(rx.try_recv(), Ok(Outbound::Shutdown)));
        assert!(worker.sessions.is_empty());
    }

    #[tokio::test]
    async fn login_past_the_deadline_refreshes_the_quota() {
        let mut worker = test_worker();
        let (id, mut rx) = fake_session(&mut worker);
        worker.on_app(
            id,
            &json!({"cmd": "login", "user": "5", "password": "pw"}).to_string(),
        );
        worker.on_db_event(DbEvent::UserData(vec![
            crypto::hex_digest("pw"),
            "4".to_owned(),
            "0".to_owned(),
            "1".to_owned(), // long past
        ]));
        let ack = recv_frame(&mut rx);
        assert_eq!(ack["result"], "ok");
        assert_eq!(ack["remaining_posts"], 4);
        assert_eq!(worker.table.get(id).unwrap().remaining_posts, 4);
    }

    #[tokio::test]
    async fn second_login_kicks_the_stale_session() {
        let mut worker = test_worker();
        let (old, mut old_rx) = fake_session(&mut worker);
        let (new, mut new_rx) = fake_session(&mut worker);
        let login = json!({"cmd": "login", "user": "5", "password": "pw"}).to_string();
        let fields = vec![
            crypto::hex_digest("pw"),
            "2".to_owned(),
            "2".to_owned(),
            (now_epoch() + 1000).to_string(),
        ];

        worker.on_app(old, &login);
        worker.on_db_event(DbEvent::UserData(fields.clone()));
        assert_eq!(recv_frame(&mut old_rx)["result"], "ok");

        worker.on_app(new, &login);
        worker.on_db_event(DbEvent::UserData(fields));
        assert_eq!(worker.sessions.get("5"), Some(&new));
        assert!(worker.table.get(old).unwrap().user_id.is_none());
        // The stale session was told to close; its teardown must not evict
        // the replacement.
        let saw_shutdown = std::iter::from_fn(|| old_rx.try_recv().ok())
            .any(|out| matches!(out, Outbound::Shutdown));
        assert!(saw_shutdown);
        worker.on_session_closed(old, vec![]);
        assert_eq!(worker.sessions.get("5"), Some(&new));
        let _ = recv_frame(&mut new_rx);
    }

    #[tokio::test]
    async fn delete_command_from_the_bus_removes_an_owned_post() {
        let mut worker = test_worker();
        let post = json!({
            "id": 3, "from": "7", "body": "x", "to": [[], []],
            "filter": 0, "features": 0, "date": now_epoch(), "range_values": []
        });
        worker.on_channel_post(&post.to_string());
        assert_eq!(worker.channel.post_count(), 1);

        // Wrong owner: nothing happens.
        worker.on_channel_post(&json!({"cmd": "delete", "id": 3, "from": "8"}).to_string());
        assert_eq!(worker.channel.post_count(), 1);

        worker.on_channel_post(&json!({"cmd": "delete", "id": 3, "from": "7"}).to_string());
        assert_eq!(worker.channel.post_count(), 0);
    }

    #[tokio::test]
    async fn filenames_returns_digest_authenticated_urls() {
        let mut worker = test_worker();
        let (id, mut rx) = fake_session(&mut worker);
        register(&mut worker, &mut rx, id, "1");
        worker.on_app(id, &json!({"cmd": "filenames"}).to_string());
        let ack = recv_frame(&mut rx);
        assert_eq!(ack["cmd"], "filenames_ack");
        let names = ack["names"].as_array().unwrap();
        assert_eq!(names.len(), 5);
        for name in names {
            let name = name.as_str().unwrap();
            let rest = name.strip_prefix("http://img.test/").unwrap();
            let (path, digest) = rest.rsplit_once(':').unwrap();
            assert_eq!(crypto::keyed_hex_digest(&format!("/{path}"), "mms-key"), digest);
        }
    }

    #[tokio::test]
    async fn closed_session_with_undelivered_messages_restores_the_mailbox() {
        let mut worker = test_worker();
        let (id, mut rx) = fake_session(&mut worker);
        register(&mut worker, &mut rx, id, "1");
        assert_eq!(worker.sessions.len(), 1);
        worker.on_session_closed(id, vec!["{\"cmd\":\"message\"}".to_owned()]);
        assert!(worker.sessions.is_empty());
        assert!(worker.table.get(id).is_none());
    }

    #[tokio::test]
    async fn offline_chat_message_is_acked_to_the_sender() {
        let mut worker = test_worker();
        let (id, mut rx) = fake_session(&mut worker);
        register(&mut worker, &mut rx, id, "1");
        worker.on_app(
            id,
            &json!({"cmd": "message", "to": "42", "post_id": 1, "id": 5,
                     "message": "hello", "type": "chat"})
            .to_string(),
        );
        let ack = recv_frame(&mut rx);
        assert_eq!(ack["type"], "server_ack");
        assert_eq!(ack["from"], "42");
    }

    #[tokio::test]
    async fn retrieved_mailbox_messages_reach_the_live_session() {
        let mut worker = test_worker();
        let (id, mut rx) = fake_session(&mut worker);
        register(&mut worker, &mut rx, id, "1");
        worker.on_db_event(DbEvent::ChatMsgs {
            user_id: "1".to_owned(),
            msgs: vec!["{\"message\":\"a\"}".to_owned(), "{\"message\":\"b\"}".to_owned()],
        });
        let first = recv_frame(&mut rx);
        assert_eq!(first["message"], "a");
        let second = recv_frame(&mut rx);
        assert_eq!(second["message"], "b");
    }

    #[tokio::test]
    async fn dead_registrant_forfeits_the_user_id() {
        let mut worker = test_worker();
        let (id, rx) = fake_session(&mut worker);
        worker.on_app(id, &json!({"cmd": "register"}).to_string());
        drop(rx);
        worker.table.remove(id);
        worker.on_db_event(DbEvent::UserId("1".to_owned()));
        assert!(worker.reg_queue.is_empty());
        assert!(worker.sessions.is_empty());
    }
}
