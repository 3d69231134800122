//! A mock Redis server for integration testing.
//!
//! Binds to `127.0.0.1:0` and exposes the bound address; each test spins up
//! its own isolated instance.  Implements the command subset the gateway
//! uses, including MULTI/EXEC, pub/sub and `rpush` keyspace notifications.
//! Connections are handled in background tasks; `kill_connections` drops
//! every active connection without releasing the listener, so reconnect
//! behaviour can be exercised against the same address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use souk_redis::codec::RespCodec;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::FramedRead;

// ---------------------------------------------------------------------------
// Reply encoding helpers
// ---------------------------------------------------------------------------

fn simple(s: &str) -> Vec<u8> {
    format!("+{s}\r\n").into_bytes()
}

fn error(s: &str) -> Vec<u8> {
    format!("-ERR {s}\r\n").into_bytes()
}

fn int(n: i64) -> Vec<u8> {
    format!(":{n}\r\n").into_bytes()
}

fn bulk(s: &str) -> Vec<u8> {
    format!("${}\r\n{s}\r\n", s.len()).into_bytes()
}

fn nil() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

fn array(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

fn bulk_array(items: &[String]) -> Vec<u8> {
    let encoded: Vec<Vec<u8>> = items.iter().map(|s| bulk(s)).collect();
    array(&encoded)
}

fn push_message(channel: &str, payload: &str) -> Vec<u8> {
    array(&[bulk("message"), bulk(channel), bulk(payload)])
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

type PushSender = mpsc::UnboundedSender<(String, String)>;

#[derive(Default)]
struct Inner {
    strings: HashMap<String, String>,
    counters: HashMap<String, i64>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, Vec<String>>,
    /// Sorted set as (score, member) pairs kept ordered by score.
    zsets: HashMap<String, Vec<(i64, String)>>,
    /// channel -> (connection id, push sender)
    subscribers: HashMap<String, Vec<(u64, PushSender)>>,
    keyspace_db: u32,
}

impl Inner {
    fn publish(&mut self, channel: &str, payload: &str) -> i64 {
        let mut delivered = 0;
        if let Some(subs) = self.subscribers.get_mut(channel) {
            subs.retain(|(_, tx)| !tx.is_closed());
            for (_, tx) in subs.iter() {
                if tx.send((channel.to_owned(), payload.to_owned())).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn notify_keyspace(&mut self, key: &str, event: &str) {
        let channel = format!("__keyspace@{}__:{key}", self.keyspace_db);
        self.publish(&channel, event);
    }

    fn subscription_count(&self, conn_id: u64) -> i64 {
        self.subscribers
            .values()
            .flatten()
            .filter(|(id, _)| *id == conn_id)
            .count() as i64
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct MockRedisServer {
    addr: SocketAddr,
    state: Arc<Mutex<Inner>>,
    kill: watch::Sender<u64>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockRedisServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(Inner::default()));
        let (kill, _) = watch::channel(0u64);

        let accept_state = Arc::clone(&state);
        let kill_rx_factory = kill.subscribe();
        let task = tokio::spawn(async move {
            let conn_ids = AtomicU64::new(1);
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let state = Arc::clone(&accept_state);
                        let kill_rx = kill_rx_factory.clone();
                        let conn_id = conn_ids.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(handle_connection(stream, state, kill_rx, conn_id));
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(MockRedisServer {
            addr,
            state,
            kill,
            _task: task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Drop every active connection; the listener keeps accepting, so
    /// clients can reconnect to the same address.
    pub fn kill_connections(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }

    /// Publish on a channel, as a peer worker would.
    pub fn publish(&self, channel: &str, payload: &str) -> i64 {
        self.state.lock().unwrap().publish(channel, payload)
    }

    /// Append to a list as a peer worker would, firing the keyspace
    /// notification.
    pub fn rpush(&self, key: &str, value: &str) {
        let mut inner = self.state.lock().unwrap();
        inner
            .lists
            .entry(key.to_owned())
            .or_default()
            .push(value.to_owned());
        inner.notify_keyspace(key, "rpush");
    }

    /// Live subscriber count for a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .get(channel)
            .map(|subs| subs.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Seed a sorted-set member directly, bypassing the wire.
    pub fn zadd(&self, key: &str, score: i64, member: &str) {
        let mut inner = self.state.lock().unwrap();
        let set = inner.zsets.entry(key.to_owned()).or_default();
        set.retain(|(_, m)| m != member);
        let pos = set.partition_point(|(s, _)| *s <= score);
        set.insert(pos, (score, member.to_owned()));
    }

    pub fn counter(&self, key: &str) -> i64 {
        self.state
            .lock()
            .unwrap()
            .counters
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .lists
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn hash_field(&self, key: &str, field: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned()
    }

    pub fn zset_members(&self, key: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .zsets
            .get(key)
            .map(|set| set.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Per-connection handling
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    state: Arc<Mutex<Inner>>,
    mut kill: watch::Receiver<u64>,
    conn_id: u64,
) {
    // Only kills issued after this connection was accepted apply to it.
    let _ = kill.borrow_and_update();
    let (read, mut write) = stream.into_split();
    let mut commands = FramedRead::new(read, RespCodec::new());
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<(String, String)>();
    let mut multi: Option<Vec<Vec<String>>> = None;

    loop {
        tokio::select! {
            changed = kill.changed() => {
                if changed.is_ok() {
                    // Simulated crash: drop the socket without a goodbye.
                    return;
                }
            }
            pushed = push_rx.recv() => {
                let Some((channel, payload)) = pushed else { return };
                if write.write_all(&push_message(&channel, &payload)).await.is_err() {
                    break;
                }
            }
            command = commands.next() => match command {
                Some(Ok(args)) if !args.is_empty() => {
                    let reply = dispatch(&args, &state, &push_tx, conn_id, &mut multi);
                    if write.write_all(&reply).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            }
        }
    }
    cleanup_subscriptions(&state, conn_id);
}

fn cleanup_subscriptions(state: &Arc<Mutex<Inner>>, conn_id: u64) {
    let mut inner = state.lock().unwrap();
    for subs in inner.subscribers.values_mut() {
        subs.retain(|(id, _)| *id != conn_id);
    }
}

fn dispatch(
    args: &[String],
    state: &Arc<Mutex<Inner>>,
    push_tx: &PushSender,
    conn_id: u64,
    multi: &mut Option<Vec<Vec<String>>>,
) -> Vec<u8> {
    let cmd = args[0].to_ascii_uppercase();
    if cmd == "MULTI" {
        *multi = Some(Vec::new());
        return simple("OK");
    }
    if let Some(queued) = multi {
        if cmd == "EXEC" {
            let commands = std::mem::take(queued);
            *multi = None;
            let replies: Vec<Vec<u8>> = commands
                .iter()
                .map(|c| execute(c, state, push_tx, conn_id))
                .collect();
            return array(&replies);
        }
        queued.push(args.to_vec());
        return simple("QUEUED");
    }
    execute(args, state, push_tx, conn_id)
}

#[allow(clippy::too_many_lines)]
fn execute(
    args: &[String],
    state: &Arc<Mutex<Inner>>,
    push_tx: &PushSender,
    conn_id: u64,
) -> Vec<u8> {
    let mut inner = state.lock().unwrap();
    let cmd = args[0].to_ascii_uppercase();
    match (cmd.as_str(), &args[1..]) {
        ("GET", [key]) => inner
            .strings
            .get(key)
            .map_or_else(nil, |v| bulk(v)),
        ("SET", [key, value]) => {
            inner.strings.insert(key.clone(), value.clone());
            simple("OK")
        }
        ("INCR", [key]) => {
            let counter = inner.counters.entry(key.clone()).or_insert(0);
            *counter += 1;
            int(*counter)
        }
        ("HSET", [key, pairs @ ..]) if pairs.len() >= 2 && pairs.len() % 2 == 0 => {
            let hash = inner.hashes.entry(key.clone()).or_default();
            let mut added = 0;
            for pair in pairs.chunks_exact(2) {
                if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
                    added += 1;
                }
            }
            int(added)
        }
        ("HGET", [key, field]) => inner
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .map_or_else(nil, |v| bulk(v)),
        ("HMGET", [key, fields @ ..]) => {
            let replies: Vec<Vec<u8>> = fields
                .iter()
                .map(|f| {
                    inner
                        .hashes
                        .get(key)
                        .and_then(|h| h.get(f))
                        .map_or_else(nil, |v| bulk(v))
                })
                .collect();
            array(&replies)
        }
        ("RPUSH", [key, values @ ..]) if !values.is_empty() => {
            let list = inner.lists.entry(key.clone()).or_default();
            list.extend(values.iter().cloned());
            let len = list.len() as i64;
            inner.notify_keyspace(key, "rpush");
            int(len)
        }
        ("LPUSH", [key, values @ ..]) if !values.is_empty() => {
            let list = inner.lists.entry(key.clone()).or_default();
            for v in values {
                list.insert(0, v.clone());
            }
            let len = list.len() as i64;
            inner.notify_keyspace(key, "lpush");
            int(len)
        }
        ("LRANGE", [key, start, stop]) => {
            let (Ok(start), Ok(stop)) = (start.parse::<i64>(), stop.parse::<i64>()) else {
                return error("value is not an integer");
            };
            let items = inner
                .lists
                .get(key)
                .map(|list| slice_range(list, start, stop))
                .unwrap_or_default();
            bulk_array(&items)
        }
        ("DEL", keys) => {
            let mut removed = 0;
            for key in keys {
                let mut hit = false;
                hit |= inner.strings.remove(key).is_some();
                hit |= inner.counters.remove(key).is_some();
                hit |= inner.hashes.remove(key).is_some();
                hit |= inner.lists.remove(key).is_some();
                hit |= inner.zsets.remove(key).is_some();
                if hit {
                    removed += 1;
                }
            }
            int(removed)
        }
        ("EXPIRE", [_key, _secs]) => int(1),
        ("ZADD", [key, score, member]) => {
            let Ok(score) = score.parse::<i64>() else {
                return error("value is not an integer");
            };
            let set = inner.zsets.entry(key.clone()).or_default();
            let existed = set.iter().any(|(_, m)| m == member);
            set.retain(|(_, m)| m != member);
            let pos = set.partition_point(|(s, _)| *s <= score);
            set.insert(pos, (score, member.clone()));
            int(i64::from(!existed))
        }
        ("ZRANGEBYSCORE", [key, min, max]) => {
            let Ok(min) = min.parse::<i64>() else {
                return error("min is not an integer");
            };
            let max = if max == "+inf" {
                i64::MAX
            } else if let Ok(max) = max.parse::<i64>() {
                max
            } else {
                return error("max is not an integer");
            };
            let members: Vec<String> = inner
                .zsets
                .get(key)
                .map(|set| {
                    set.iter()
                        .filter(|(s, _)| *s >= min && *s <= max)
                        .map(|(_, m)| m.clone())
                        .collect()
                })
                .unwrap_or_default();
            bulk_array(&members)
        }
        ("ZREMRANGEBYSCORE", [key, min, max]) => {
            let (Ok(min), Ok(max)) = (min.parse::<i64>(), max.parse::<i64>()) else {
                return error("range is not an integer");
            };
            let removed = inner.zsets.get_mut(key).map_or(0, |set| {
                let before = set.len();
                set.retain(|(s, _)| *s < min || *s > max);
                (before - set.len()) as i64
            });
            int(removed)
        }
        ("PUBLISH", [channel, payload]) => int(inner.publish(channel, payload)),
        ("SUBSCRIBE", [channel]) => {
            inner
                .subscribers
                .entry(channel.clone())
                .or_default()
                .push((conn_id, push_tx.clone()));
            let count = inner.subscription_count(conn_id);
            array(&[bulk("subscribe"), bulk(channel), int(count)])
        }
        ("UNSUBSCRIBE", [channel]) => {
            if let Some(subs) = inner.subscribers.get_mut(channel) {
                subs.retain(|(id, _)| *id != conn_id);
            }
            let count = inner.subscription_count(conn_id);
            array(&[bulk("unsubscribe"), bulk(channel), int(count)])
        }
        _ => error(&format!("unknown command '{}'", args[0])),
    }
}

fn slice_range(list: &[String], start: i64, stop: i64) -> Vec<String> {
    let len = list.len() as i64;
    if len == 0 {
        return Vec::new();
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return Vec::new();
    }
    list[start as usize..=(stop as usize)].to_vec()
}
