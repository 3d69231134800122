// souk-protocol: Client <-> gateway wire types and serialization.
//
// All WebSocket frames are JSON text with a top-level `cmd` field for
// discriminated dispatch.  Inbound chat/presence frames carry free-form
// extra fields and are routed as raw JSON by the gateway; everything the
// gateway itself produces or validates is typed here.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Post
// ---------------------------------------------------------------------------

/// Taxonomy code of a post: (location path, product path).
///
/// Serialized as a two-element array of integer arrays, e.g.
/// `[[3, 7], [1, 4, 2]]`.
pub type TaxonomyCode = (Vec<i64>, Vec<i64>);

/// A classified advert; the primary unit of content.
///
/// Immutable once stored.  `id` is assigned by the cluster-wide counter and
/// is `-1` until then.  `from` and `date` are set server-side on publish and
/// never trusted from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    #[serde(default = "unassigned_id")]
    pub id: i64,
    #[serde(default)]
    pub from: String,
    /// Opaque JSON-encoded payload; the gateway never looks inside.
    pub body: String,
    pub to: TaxonomyCode,
    /// 64-bit bitmap derived from `to`, used for broadcast routing.
    #[serde(default)]
    pub filter: u64,
    /// 64-bit bitmap of boolean post attributes.
    #[serde(default)]
    pub features: u64,
    /// Epoch seconds, set server-side.
    #[serde(default)]
    pub date: i64,
    /// Small vector of numeric filter values, e.g. price.
    #[serde(default)]
    pub range_values: Vec<i64>,
}

fn unassigned_id() -> i64 {
    -1
}

// ---------------------------------------------------------------------------
// Client -> gateway command payloads
// ---------------------------------------------------------------------------
//
// These are deserialized from the full frame object; the `cmd` field and any
// unknown extras are ignored by serde.

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterCmd {
    /// Optional FCM token, forwarded to the notifier daemon on success.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginCmd {
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeCmd {
    /// Highest post id the client has already seen; only newer posts are
    /// replayed on subscribe.
    #[serde(default = "unassigned_id")]
    pub last_post_id: i64,
    /// Channel codes the session wants; empty means all.
    #[serde(default)]
    pub filters: Vec<u64>,
    #[serde(default)]
    pub any_of_features: u64,
    /// Flat (min, max) pairs applied against `post.range_values`.
    #[serde(default)]
    pub ranges: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishCmd {
    pub items: Vec<Post>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteCmd {
    pub id: i64,
}

// ---------------------------------------------------------------------------
// Gateway -> client frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckResult {
    Ok,
    Fail,
}

/// Every frame the gateway originates.
///
/// The `delete` variant doubles as the worker-to-worker removal command
/// broadcast on the posts channel; peers check `from` against the stored
/// post before removing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ServerFrame {
    RegisterAck {
        result: AckResult,
        id: String,
        password: String,
    },
    LoginAck {
        result: AckResult,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remaining_posts: Option<i64>,
    },
    SubscribeAck {
        result: AckResult,
    },
    PublishAck {
        result: AckResult,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date: Option<i64>,
    },
    DeleteAck {
        result: AckResult,
    },
    FilenamesAck {
        result: AckResult,
        names: Vec<String>,
    },
    /// Post delivery, both the subscribe backlog and live broadcasts.
    Post {
        items: Vec<Post>,
    },
    Delete {
        from: String,
        id: i64,
    },
    /// Echo sent to a chat-message sender; `from` names the peer the
    /// original message was addressed to.
    #[serde(rename = "message")]
    ServerAck {
        from: String,
        post_id: i64,
        ack_id: i64,
        #[serde(rename = "type")]
        kind: String,
        result: AckResult,
    },
}

impl ServerFrame {
    pub fn server_ack(from: String, post_id: i64, ack_id: i64) -> Self {
        ServerFrame::ServerAck {
            from,
            post_id,
            ack_id,
            kind: "server_ack".to_owned(),
            result: AckResult::Ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_round_trips_through_json() {
        let post = Post {
            id: 7,
            from: "12".to_owned(),
            body: "{\"title\":\"bike\"}".to_owned(),
            to: (vec![3, 1], vec![2, 5, 9]),
            filter: 0b1010,
            features: 0b1,
            date: 1_600_000_000,
            range_values: vec![250],
        };
        let json = serde_json::to_string(&post).unwrap();
        let back: Post = serde_json::from_str(&json).unwrap();
        assert_eq!(back, post);
    }

    #[test]
    fn unassigned_post_defaults_to_minus_one() {
        let post: Post =
            serde_json::from_str(r#"{"body":"hi","to":[[],[]]}"#).unwrap();
        assert_eq!(post.id, -1);
        assert!(post.from.is_empty());
        assert_eq!(post.filter, 0);
        assert!(post.range_values.is_empty());
    }

    #[test]
    fn publish_ack_fail_has_no_id_or_date() {
        let frame = ServerFrame::PublishAck {
            result: AckResult::Fail,
            id: None,
            date: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"cmd": "publish_ack", "result": "fail"})
        );
    }

    #[test]
    fn server_ack_uses_the_message_cmd() {
        let frame = ServerFrame::server_ack("9".to_owned(), 7, 99);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "cmd": "message",
                "from": "9",
                "post_id": 7,
                "ack_id": 99,
                "type": "server_ack",
                "result": "ok"
            })
        );
    }
}
