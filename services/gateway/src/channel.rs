//! The root channel: every post the worker currently holds, plus the
//! sessions subscribed to the stream.
//!
//! Posts stay sorted by id.  Peer workers may deliver posts out of order
//! after an outage, so insertion is a sorted insert rather than a push;
//! a duplicate id is never inserted twice.  Members are session handles;
//! dead ones are swept while broadcasting and, for channels that see
//! subscribes but no publishes, every `cleanup_rate` additions.

use std::collections::VecDeque;

use souk_protocol::Post;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::debug;

use crate::table::{SessionId, SessionTable};

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Member additions between dead-entry sweeps.
    pub cleanup_rate: usize,
    /// Post capacity; the oldest post is dropped beyond it.
    pub max_posts: usize,
    /// Seconds after `post.date` at which a post expires.
    pub post_expiration: i64,
}

#[derive(Default)]
pub struct ChannelStore {
    posts: VecDeque<Post>,
    members: Vec<SessionId>,
    insertions_since_cleanup: usize,
}

impl ChannelStore {
    pub fn new() -> Self {
        ChannelStore::default()
    }

    /// Store a post and fan it out to every member whose filter accepts
    /// it, handing each the same shared payload.  Returns whether the post
    /// was inserted (false for a duplicate id, which is not re-delivered)
    /// and the number of dead members swept.
    pub fn broadcast(
        &mut self,
        post: &Post,
        payload: &Utf8Bytes,
        table: &SessionTable,
        max_posts: usize,
    ) -> (bool, usize) {
        if !self.insert_sorted(post.clone(), max_posts) {
            return (false, 0);
        }
        self.insertions_since_cleanup = 0;

        let mut removed = 0;
        let mut i = 0;
        while i < self.members.len() {
            match table.get(self.members[i]) {
                Some(slot) if !slot.is_closed() => {
                    if slot.filter.accepts(post) {
                        slot.send_frame(payload.clone(), false);
                    }
                    i += 1;
                }
                _ => {
                    self.members.swap_remove(i);
                    removed += 1;
                }
            }
        }
        (true, removed)
    }

    /// Sorted insert by id; duplicates are refused.
    fn insert_sorted(&mut self, post: Post, max_posts: usize) -> bool {
        match self.posts.binary_search_by(|p| p.id.cmp(&post.id)) {
            Ok(_) => false,
            Err(pos) => {
                self.posts.insert(pos, post);
                if self.posts.len() > max_posts {
                    self.posts.pop_front();
                }
                true
            }
        }
    }

    /// Add a member; every `cleanup_rate` additions, sweep dead entries so
    /// a subscribe-only channel cannot grow without bound.
    pub fn add_member(&mut self, id: SessionId, cleanup_rate: usize, table: &SessionTable) {
        self.members.push(id);
        self.insertions_since_cleanup += 1;
        if cleanup_rate > 0 && self.insertions_since_cleanup >= cleanup_rate {
            let before = self.members.len();
            self.members
                .retain(|m| table.get(*m).is_some_and(|slot| !slot.is_closed()));
            if before > self.members.len() {
                debug!(removed = before - self.members.len(), "swept dead channel members");
            }
            self.insertions_since_cleanup = 0;
        }
    }

    /// Remove a post if it exists and belongs to `from`.  Failures are
    /// normal: the delete command is broadcast to every worker and each
    /// attempts the removal independently.
    pub fn remove_post(&mut self, id: i64, from: &str) -> bool {
        if let Ok(pos) = self.posts.binary_search_by(|p| p.id.cmp(&id)) {
            if self.posts[pos].from == from {
                self.posts.remove(pos);
                return true;
            }
        }
        false
    }

    /// Posts with id greater than `newer_than` satisfying `pred`, capped
    /// at `max`.
    pub fn get_posts<F>(&self, newer_than: i64, max: usize, pred: F) -> Vec<Post>
    where
        F: Fn(&Post) -> bool,
    {
        let start = self.posts.partition_point(|p| p.id <= newer_than);
        self.posts
            .iter()
            .skip(start)
            .filter(|p| pred(p))
            .take(max)
            .cloned()
            .collect()
    }

    /// Prune posts whose lifetime has elapsed, returning (id, from) of
    /// each so the worker can broadcast their removal.
    pub fn remove_expired_posts(&mut self, now: i64, expiration: i64) -> Vec<(i64, String)> {
        let mut expired = Vec::new();
        self.posts.retain(|p| {
            if p.date + expiration < now {
                expired.push((p.id, p.from.clone()));
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn post_count(&self) -> usize {
        self.posts.len()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}
