//! Facade over the four Redis connections the worker uses.
//!
//! | Session  | Use |
//! |----------|-----|
//! | menu-sub | `SUBSCRIBE` on the posts channel |
//! | menu-pub | Commands touching posts, ids, user records |
//! | chat-sub | Per-user keyspace notifications and presence channels |
//! | chat-pub | Chat-message storage and retrieval |
//!
//! Every command carries one request tag per reply it will produce; the
//! facade translates tagged replies and pub/sub pushes into [`DbEvent`]s
//! for the worker.  Splitting subscribe streams from command traffic keeps
//! pub/sub pushes from head-of-line blocking command replies.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cmd;
use crate::session::{RedisHandle, RedisSession, SessionConfig, SessionEvent};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FacadeConfig {
    pub session: SessionConfig,
    /// ZSET of all posts, scored by post id.
    pub posts_key: String,
    /// Pub/sub channel carrying new posts and delete commands to all workers.
    pub posts_channel: String,
    /// INCR counter assigning post ids.
    pub post_id_key: String,
    /// INCR counter assigning user ids.
    pub user_id_key: String,
    /// Prefix of per-user hashes, e.g. `id:` -> `id:102`.
    pub user_data_prefix: String,
    /// Prefix of per-user offline mailboxes, e.g. `msg:` -> `msg:102`.
    pub chat_msg_prefix: String,
    /// Prefix of per-user presence channels, e.g. `pc:` -> `pc:102`.
    pub presence_prefix: String,
    /// Channel where FCM tokens are published for the notifier daemon.
    pub tokens_channel: String,
    /// Global counter of stored chat messages.
    pub chat_msgs_counter_key: String,
    /// Mailbox TTL in seconds; unread messages die with the key.
    pub chat_msg_expiry: i64,
    /// Redis logical database index, part of the keyspace channel name.
    pub keyspace_db: u32,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        FacadeConfig {
            session: SessionConfig::default(),
            posts_key: "posts".to_owned(),
            posts_channel: "posts-channel".to_owned(),
            post_id_key: "post_id".to_owned(),
            user_id_key: "user_id".to_owned(),
            user_data_prefix: "id:".to_owned(),
            chat_msg_prefix: "msg:".to_owned(),
            presence_prefix: "pc:".to_owned(),
            tokens_channel: "tokens".to_owned(),
            chat_msgs_counter_key: "chat_msgs_counter".to_owned(),
            chat_msg_expiry: 3600,
            keyspace_db: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tags and events
// ---------------------------------------------------------------------------

/// Expected kind of a pending reply, one per command on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTag {
    Ignore,
    PostId,
    UserId,
    UserData,
    RegisterOk,
    PostAck,
    PostsList,
    RemovePost,
    ChatMsgs { user_id: String },
}

/// The four facade connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conn {
    MenuSub,
    MenuPub,
    ChatSub,
    ChatPub,
}

/// Completion events handed to the worker.
#[derive(Debug, PartialEq, Eq)]
pub enum DbEvent {
    /// menu-pub (re)connected: catch up on posts published meanwhile.
    MenuConnected,
    /// chat-sub (re)connected: keyspace subscriptions must be re-issued.
    ChatSubConnected,
    /// A post or delete command broadcast on the posts channel.
    ChannelPost(String),
    /// Result of `retrieve_posts`.
    Posts(Vec<String>),
    PostId(i64),
    UserId(String),
    /// `password`, `allowed`, `remaining`, `deadline` (empty when unset).
    UserData(Vec<String>),
    Registered,
    PostStored,
    PostRemoved { removed: bool },
    ChatMsgs { user_id: String, msgs: Vec<String> },
    Presence { user_id: String, msg: String },
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

pub struct RedisFacade {
    cfg: FacadeConfig,
    /// `__keyspace@<db>__:<chat_msg_prefix>`, precomputed.
    user_notify_prefix: String,
    menu_sub: RedisHandle<RequestTag>,
    menu_pub: RedisHandle<RequestTag>,
    chat_sub: RedisHandle<RequestTag>,
    chat_pub: RedisHandle<RequestTag>,
}

impl RedisFacade {
    /// Spawn the four session actors.  Their events arrive on `events`,
    /// wrapped through `wrap` together with the originating connection.
    pub fn spawn<E, F>(cfg: FacadeConfig, events: mpsc::UnboundedSender<E>, wrap: F) -> Self
    where
        E: Send + 'static,
        F: Fn(Conn, SessionEvent<RequestTag>) -> E + Clone + Send + 'static,
    {
        let spawn_one = |conn: Conn, label: &str| {
            let wrap = wrap.clone();
            RedisSession::spawn(cfg.session.clone(), label, events.clone(), move |ev| {
                wrap(conn, ev)
            })
        };
        let user_notify_prefix =
            format!("__keyspace@{}__:{}", cfg.keyspace_db, cfg.chat_msg_prefix);
        RedisFacade {
            menu_sub: spawn_one(Conn::MenuSub, "menu-sub"),
            menu_pub: spawn_one(Conn::MenuPub, "menu-pub"),
            chat_sub: spawn_one(Conn::ChatSub, "chat-sub"),
            chat_pub: spawn_one(Conn::ChatPub, "chat-pub"),
            user_notify_prefix,
            cfg,
        }
    }

    /// Translate a session event into a worker-facing [`DbEvent`].
    ///
    /// Keyspace notifications are handled internally: a `rpush` wake on a
    /// mailbox key immediately issues the retrieval, and only the retrieved
    /// messages surface to the worker.
    pub fn process(&self, conn: Conn, event: SessionEvent<RequestTag>) -> Option<DbEvent> {
        match (conn, event) {
            (Conn::MenuSub, SessionEvent::Connected) => {
                self.menu_sub.send(
                    cmd::subscribe(&self.cfg.posts_channel),
                    vec![RequestTag::Ignore],
                );
                None
            }
            (Conn::MenuPub, SessionEvent::Connected) => Some(DbEvent::MenuConnected),
            (Conn::ChatSub, SessionEvent::Connected) => Some(DbEvent::ChatSubConnected),
            (Conn::ChatPub, SessionEvent::Connected) => None,
            (Conn::MenuSub, SessionEvent::Push(mut data)) => {
                if data.len() == 3 && data[1] == self.cfg.posts_channel {
                    data.pop().map(DbEvent::ChannelPost)
                } else {
                    None
                }
            }
            (Conn::ChatSub, SessionEvent::Push(data)) => self.on_chat_push(&data),
            (_, SessionEvent::Push(data)) => {
                debug!(?conn, ?data, "push on a command connection");
                None
            }
            (_, SessionEvent::Reply { tag, data }) => self.on_reply(tag, data),
        }
    }

    fn on_chat_push(&self, data: &[String]) -> Option<DbEvent> {
        if data.len() != 3 {
            return None;
        }
        let channel = &data[1];
        if let Some(user_id) = channel.strip_prefix(&self.user_notify_prefix) {
            // A mailbox key was written; fetch its content right away.
            if data[2] == "rpush" && !user_id.is_empty() {
                self.retrieve_chat_msgs(user_id);
            }
            None
        } else if let Some(user_id) = channel.strip_prefix(&self.cfg.presence_prefix) {
            Some(DbEvent::Presence {
                user_id: user_id.to_owned(),
                msg: data[2].clone(),
            })
        } else {
            None
        }
    }

    fn on_reply(&self, tag: RequestTag, mut data: Vec<String>) -> Option<DbEvent> {
        match tag {
            RequestTag::Ignore => None,
            RequestTag::PostId => match data.first().and_then(|s| s.parse().ok()) {
                Some(id) => Some(DbEvent::PostId(id)),
                None => {
                    warn!(?data, "post id reply did not hold an integer");
                    None
                }
            },
            RequestTag::UserId => data.pop().map(DbEvent::UserId),
            RequestTag::UserData => Some(DbEvent::UserData(data)),
            RequestTag::RegisterOk => Some(DbEvent::Registered),
            RequestTag::PostAck => Some(DbEvent::PostStored),
            RequestTag::PostsList => Some(DbEvent::Posts(data)),
            RequestTag::RemovePost => Some(DbEvent::PostRemoved {
                removed: data.first().map(String::as_str) == Some("1"),
            }),
            RequestTag::ChatMsgs { user_id } => {
                // The flattened EXEC array is the LRANGE result followed by
                // the DEL count; drop the count.
                data.pop();
                Some(DbEvent::ChatMsgs {
                    user_id,
                    msgs: data,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Post operations (menu-pub)
    // -----------------------------------------------------------------------

    /// Retrieve every post with id at or above `start_id`.
    pub fn retrieve_posts(&self, start_id: i64) {
        debug!(start_id, "retrieving posts");
        self.menu_pub.send(
            cmd::zrangebyscore(&self.cfg.posts_key, start_id),
            vec![RequestTag::PostsList],
        );
    }

    pub fn request_post_id(&self) {
        self.menu_pub
            .send(cmd::incr(&self.cfg.post_id_key), vec![RequestTag::PostId]);
    }

    /// Persist a post and broadcast it to all workers.
    pub fn publish_post(&self, json: &str, id: i64) {
        let mut payload = cmd::multi();
        payload.extend(cmd::zadd(&self.cfg.posts_key, id, json));
        payload.extend(cmd::publish(&self.cfg.posts_channel, json));
        payload.extend(cmd::exec());
        self.menu_pub.send(
            payload,
            vec![
                RequestTag::Ignore,
                RequestTag::Ignore,
                RequestTag::Ignore,
                RequestTag::PostAck,
            ],
        );
    }

    /// Remove a post from the sorted set and broadcast the delete command.
    pub fn remove_post(&self, id: i64, delete_cmd_json: &str) {
        let mut payload = cmd::multi();
        payload.extend(cmd::zremrangebyscore(&self.cfg.posts_key, id));
        payload.extend(cmd::publish(&self.cfg.posts_channel, delete_cmd_json));
        payload.extend(cmd::exec());
        self.menu_pub.send(
            payload,
            vec![
                RequestTag::Ignore,
                RequestTag::Ignore,
                RequestTag::Ignore,
                RequestTag::RemovePost,
            ],
        );
    }

    // -----------------------------------------------------------------------
    // User operations (menu-pub)
    // -----------------------------------------------------------------------

    pub fn request_user_id(&self) {
        self.menu_pub
            .send(cmd::incr(&self.cfg.user_id_key), vec![RequestTag::UserId]);
    }

    pub fn register_user(&self, user_id: &str, pwd_digest: &str, allowed: i64, deadline: i64) {
        let key = self.user_key(user_id);
        let allowed = allowed.to_string();
        let deadline = deadline.to_string();
        self.menu_pub.send(
            cmd::hset(
                &key,
                &[
                    ("password", pwd_digest),
                    ("allowed", &allowed),
                    ("remaining", &allowed),
                    ("deadline", &deadline),
                ],
            ),
            vec![RequestTag::RegisterOk],
        );
    }

    pub fn retrieve_user_data(&self, user_id: &str) {
        self.menu_pub.send(
            cmd::hmget(
                &self.user_key(user_id),
                &["password", "allowed", "remaining", "deadline"],
            ),
            vec![RequestTag::UserData],
        );
    }

    /// Persist the quota counter after an accepted publish.
    pub fn update_remaining(&self, user_id: &str, remaining: i64) {
        self.menu_pub.send(
            cmd::hset(
                &self.user_key(user_id),
                &[("remaining", &remaining.to_string())],
            ),
            vec![RequestTag::Ignore],
        );
    }

    /// Refresh the quota window once its deadline has elapsed.
    pub fn update_post_deadline(&self, user_id: &str, allowed: i64, deadline: i64) {
        self.menu_pub.send(
            cmd::hset(
                &self.user_key(user_id),
                &[
                    ("remaining", &allowed.to_string()),
                    ("deadline", &deadline.to_string()),
                ],
            ),
            vec![RequestTag::Ignore],
        );
    }

    pub fn publish_token(&self, user_id: &str, token: &str) {
        let msg = format!("{{\"user\":\"{user_id}\",\"token\":\"{token}\"}}");
        self.menu_pub.send(
            cmd::publish(&self.cfg.tokens_channel, &msg),
            vec![RequestTag::Ignore],
        );
    }

    // -----------------------------------------------------------------------
    // Chat operations (chat-pub / chat-sub)
    // -----------------------------------------------------------------------

    /// Append messages to the recipient's mailbox (fire and forget).
    pub fn store_chat_msgs<I, S>(&self, user_id: &str, msgs: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let msgs: Vec<S> = msgs.into_iter().collect();
        if msgs.is_empty() {
            return;
        }
        let key = self.chat_key(user_id);
        let mut payload = cmd::multi();
        payload.extend(cmd::incr(&self.cfg.chat_msgs_counter_key));
        payload.extend(cmd::rpush(&key, msgs.iter().map(AsRef::as_ref)));
        payload.extend(cmd::expire(&key, self.cfg.chat_msg_expiry));
        payload.extend(cmd::exec());
        self.chat_pub
            .send(payload, vec![RequestTag::Ignore; 5]);
    }

    /// Drain the recipient's mailbox atomically.
    pub fn retrieve_chat_msgs(&self, user_id: &str) {
        let key = self.chat_key(user_id);
        let mut payload = cmd::multi();
        payload.extend(cmd::lrange(&key, 0, -1));
        payload.extend(cmd::del(&key));
        payload.extend(cmd::exec());
        self.chat_pub.send(
            payload,
            vec![
                RequestTag::Ignore,
                RequestTag::Ignore,
                RequestTag::Ignore,
                RequestTag::ChatMsgs {
                    user_id: user_id.to_owned(),
                },
            ],
        );
    }

    /// Wake this worker when the user's mailbox is written, and route the
    /// user's presence channel here.
    pub fn on_user_online(&self, user_id: &str) {
        self.chat_sub.send(
            cmd::subscribe(&format!("{}{user_id}", self.user_notify_prefix)),
            vec![RequestTag::Ignore],
        );
        self.chat_sub.send(
            cmd::subscribe(&self.presence_channel(user_id)),
            vec![RequestTag::Ignore],
        );
    }

    pub fn on_user_offline(&self, user_id: &str) {
        self.chat_sub.send(
            cmd::unsubscribe(&format!("{}{user_id}", self.user_notify_prefix)),
            vec![RequestTag::Ignore],
        );
        self.chat_sub.send(
            cmd::unsubscribe(&self.presence_channel(user_id)),
            vec![RequestTag::Ignore],
        );
    }

    /// Ephemeral presence forward to a user on another worker.
    pub fn send_presence(&self, user_id: &str, msg: &str) {
        self.chat_pub.send(
            cmd::publish(&self.presence_channel(user_id), msg),
            vec![RequestTag::Ignore],
        );
    }

    /// Close all four connections; none of them reconnects.
    pub fn close_all(&self) {
        self.menu_sub.close();
        self.menu_pub.close();
        self.chat_sub.close();
        self.chat_pub.close();
    }

    fn user_key(&self, user_id: &str) -> String {
        format!("{}{user_id}", self.cfg.user_data_prefix)
    }

    fn chat_key(&self, user_id: &str) -> String {
        format!("{}{user_id}", self.cfg.chat_msg_prefix)
    }

    fn presence_channel(&self, user_id: &str) -> String {
        format!("{}{user_id}", self.cfg.presence_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facade() -> (RedisFacade, mpsc::UnboundedReceiver<(Conn, SessionEvent<RequestTag>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let facade = RedisFacade::spawn(FacadeConfig::default(), tx, |conn, ev| (conn, ev));
        (facade, rx)
    }

    fn push(data: &[&str]) -> SessionEvent<RequestTag> {
        SessionEvent::Push(data.iter().map(|s| (*s).to_owned()).collect())
    }

    fn reply(tag: RequestTag, data: &[&str]) -> SessionEvent<RequestTag> {
        SessionEvent::Reply {
            tag,
            data: data.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    #[tokio::test]
    async fn posts_channel_messages_become_channel_posts() {
        let (facade, _rx) = facade();
        let ev = facade.process(
            Conn::MenuSub,
            push(&["message", "posts-channel", "{\"id\":3}"]),
        );
        assert_eq!(ev, Some(DbEvent::ChannelPost("{\"id\":3}".to_owned())));
    }

    #[tokio::test]
    async fn foreign_channel_messages_are_dropped() {
        let (facade, _rx) = facade();
        let ev = facade.process(Conn::MenuSub, push(&["message", "other", "x"]));
        assert_eq!(ev, None);
    }

    #[tokio::test]
    async fn presence_pushes_surface_with_the_user_id() {
        let (facade, _rx) = facade();
        let ev = facade.process(Conn::ChatSub, push(&["message", "pc:42", "{\"cmd\":\"presence\"}"]));
        assert_eq!(
            ev,
            Some(DbEvent::Presence {
                user_id: "42".to_owned(),
                msg: "{\"cmd\":\"presence\"}".to_owned()
            })
        );
    }

    #[tokio::test]
    async fn keyspace_rpush_notification_is_consumed_internally() {
        let (facade, _rx) = facade();
        let ev = facade.process(
            Conn::ChatSub,
            push(&["message", "__keyspace@0__:msg:7", "rpush"]),
        );
        // The retrieval is issued on chat-pub; nothing surfaces yet.
        assert_eq!(ev, None);
    }

    #[tokio::test]
    async fn chat_msgs_reply_strips_the_del_count() {
        let (facade, _rx) = facade();
        let ev = facade.process(
            Conn::ChatPub,
            reply(
                RequestTag::ChatMsgs {
                    user_id: "7".to_owned(),
                },
                &["{\"a\":1}", "{\"b\":2}", "1"],
            ),
        );
        assert_eq!(
            ev,
            Some(DbEvent::ChatMsgs {
                user_id: "7".to_owned(),
                msgs: vec!["{\"a\":1}".to_owned(), "{\"b\":2}".to_owned()]
            })
        );
    }

    #[tokio::test]
    async fn empty_mailbox_yields_no_messages() {
        let (facade, _rx) = facade();
        let ev = facade.process(
            Conn::ChatPub,
            reply(
                RequestTag::ChatMsgs {
                    user_id: "7".to_owned(),
                },
                &["0"],
            ),
        );
        assert_eq!(
            ev,
            Some(DbEvent::ChatMsgs {
                user_id: "7".to_owned(),
                msgs: vec![]
            })
        );
    }

    #[tokio::test]
    async fn remove_post_reply_reports_whether_a_row_went_away() {
        let (facade, _rx) = facade();
        assert_eq!(
            facade.process(Conn::MenuPub, reply(RequestTag::RemovePost, &["1", "2"])),
            Some(DbEvent::PostRemoved { removed: true })
        );
        assert_eq!(
            facade.process(Conn::MenuPub, reply(RequestTag::RemovePost, &["0", "2"])),
            Some(DbEvent::PostRemoved { removed: false })
        );
    }

    #[tokio::test]
    async fn ignore_tags_never_surface() {
        let (facade, _rx) = facade();
        assert_eq!(
            facade.process(Conn::MenuPub, reply(RequestTag::Ignore, &["OK"])),
            None
        );
    }
}
