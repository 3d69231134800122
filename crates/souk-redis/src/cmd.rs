//! RESP2 command encoders.
//!
//! Every command is an array of bulk strings: `*N\r\n$len\r\narg\r\n...`.
//! Compound MULTI/EXEC sequences are built by concatenating encoded
//! commands into one payload.

/// Encode one command from its arguments.
pub fn encode(args: &[&str]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

pub fn multi() -> Vec<u8> {
    encode(&["MULTI"])
}

pub fn exec() -> Vec<u8> {
    encode(&["EXEC"])
}

pub fn get(key: &str) -> Vec<u8> {
    encode(&["GET", key])
}

pub fn set(key: &str, value: &str) -> Vec<u8> {
    encode(&["SET", key, value])
}

pub fn incr(key: &str) -> Vec<u8> {
    encode(&["INCR", key])
}

pub fn del(key: &str) -> Vec<u8> {
    encode(&["DEL", key])
}

pub fn expire(key: &str, secs: i64) -> Vec<u8> {
    encode(&["EXPIRE", key, &secs.to_string()])
}

pub fn lpush<I, S>(key: &str, values: I) -> Vec<u8>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    push_cmd("LPUSH", key, values)
}

pub fn rpush<I, S>(key: &str, values: I) -> Vec<u8>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    push_cmd("RPUSH", key, values)
}

fn push_cmd<I, S>(cmd: &str, key: &str, values: I) -> Vec<u8>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let values: Vec<S> = values.into_iter().collect();
    let mut args: Vec<&str> = Vec::with_capacity(2 + values.len());
    args.push(cmd);
    args.push(key);
    for v in &values {
        args.push(v.as_ref());
    }
    encode(&args)
}

pub fn lrange(key: &str, start: i64, stop: i64) -> Vec<u8> {
    encode(&["LRANGE", key, &start.to_string(), &stop.to_string()])
}

pub fn zadd(key: &str, score: i64, member: &str) -> Vec<u8> {
    encode(&["ZADD", key, &score.to_string(), member])
}

/// `ZRANGEBYSCORE key min +inf` -- every member scored at or above `min`.
pub fn zrangebyscore(key: &str, min: i64) -> Vec<u8> {
    encode(&["ZRANGEBYSCORE", key, &min.to_string(), "+inf"])
}

/// Remove the single score `score` from the sorted set.
pub fn zremrangebyscore(key: &str, score: i64) -> Vec<u8> {
    let s = score.to_string();
    encode(&["ZREMRANGEBYSCORE", key, &s, &s])
}

pub fn publish(channel: &str, payload: &str) -> Vec<u8> {
    encode(&["PUBLISH", channel, payload])
}

pub fn subscribe(channel: &str) -> Vec<u8> {
    encode(&["SUBSCRIBE", channel])
}

pub fn psubscribe(pattern: &str) -> Vec<u8> {
    encode(&["PSUBSCRIBE", pattern])
}

pub fn unsubscribe(channel: &str) -> Vec<u8> {
    encode(&["UNSUBSCRIBE", channel])
}

pub fn hset(key: &str, fields: &[(&str, &str)]) -> Vec<u8> {
    let mut args: Vec<&str> = Vec::with_capacity(2 + fields.len() * 2);
    args.push("HSET");
    args.push(key);
    for (field, value) in fields {
        args.push(field);
        args.push(value);
    }
    encode(&args)
}

pub fn hget(key: &str, field: &str) -> Vec<u8> {
    encode(&["HGET", key, field])
}

pub fn hmget(key: &str, fields: &[&str]) -> Vec<u8> {
    let mut args: Vec<&str> = Vec::with_capacity(2 + fields.len());
    args.push("HMGET");
    args.push(key);
    args.extend_from_slice(fields);
    encode(&args)
}

pub fn sentinel_get_master(name: &str) -> Vec<u8> {
    encode(&["SENTINEL", "get-master-addr-by-name", name])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse_reply;

    /// A command is itself a valid RESP array; parsing an encoded command
    /// must yield the original arguments.
    fn round_trip(args: &[&str]) {
        let encoded = encode(args);
        let (tokens, consumed) = parse_reply(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(tokens, args);
    }

    #[test]
    fn encode_parse_round_trips_every_supported_command() {
        round_trip(&["MULTI"]);
        round_trip(&["EXEC"]);
        round_trip(&["GET", "posts"]);
        round_trip(&["SET", "k", "v"]);
        round_trip(&["INCR", "post_id"]);
        round_trip(&["LPUSH", "msg:1", "a"]);
        round_trip(&["RPUSH", "msg:1", "a", "b"]);
        round_trip(&["LRANGE", "msg:1", "0", "-1"]);
        round_trip(&["DEL", "msg:1"]);
        round_trip(&["EXPIRE", "msg:1", "3600"]);
        round_trip(&["ZADD", "posts", "7", "{}"]);
        round_trip(&["ZRANGEBYSCORE", "posts", "0", "+inf"]);
        round_trip(&["ZREMRANGEBYSCORE", "posts", "7", "7"]);
        round_trip(&["PUBLISH", "posts-channel", "{}"]);
        round_trip(&["SUBSCRIBE", "posts-channel"]);
        round_trip(&["PSUBSCRIBE", "__keyspace@0__:msg:*"]);
        round_trip(&["UNSUBSCRIBE", "posts-channel"]);
        round_trip(&["HSET", "id:1", "password", "x"]);
        round_trip(&["HGET", "id:1", "password"]);
        round_trip(&["HMGET", "id:1", "password", "allowed"]);
        round_trip(&["SENTINEL", "get-master-addr-by-name", "mymaster"]);
    }

    #[test]
    fn builders_produce_expected_wire_bytes() {
        assert_eq!(incr("post_id"), b"*2\r\n$4\r\nINCR\r\n$7\r\npost_id\r\n");
        assert_eq!(
            zadd("posts", 3, "x"),
            b"*4\r\n$4\r\nZADD\r\n$5\r\nposts\r\n$1\r\n3\r\n$1\r\nx\r\n"
        );
        assert_eq!(
            zrangebyscore("posts", 5),
            encode(&["ZRANGEBYSCORE", "posts", "5", "+inf"])
        );
        assert_eq!(
            zremrangebyscore("posts", 9),
            encode(&["ZREMRANGEBYSCORE", "posts", "9", "9"])
        );
        assert_eq!(
            hset("id:2", &[("password", "d"), ("allowed", "3")]),
            encode(&["HSET", "id:2", "password", "d", "allowed", "3"])
        );
        assert_eq!(
            hmget("id:2", &["password", "allowed", "remaining", "deadline"]),
            encode(&["HMGET", "id:2", "password", "allowed", "remaining", "deadline"])
        );
        assert_eq!(rpush("msg:4", ["a", "b"]), encode(&["RPUSH", "msg:4", "a", "b"]));
    }

    #[test]
    fn compound_payloads_parse_as_consecutive_commands() {
        let mut payload = multi();
        payload.extend(zadd("posts", 1, "{}"));
        payload.extend(publish("posts-channel", "{}"));
        payload.extend(exec());

        let mut offset = 0;
        let mut commands = Vec::new();
        while offset < payload.len() {
            let (tokens, consumed) = parse_reply(&payload[offset..]).unwrap().unwrap();
            commands.push(tokens);
            offset += consumed;
        }
        assert_eq!(commands.len(), 4);
        assert_eq!(commands[0], vec!["MULTI"]);
        assert_eq!(commands[3], vec!["EXEC"]);
    }
}
