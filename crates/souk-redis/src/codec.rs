//! RESP2 reply parsing.
//!
//! Replies are flattened into a `Vec<String>` of leaf tokens, depth-first:
//! the worker knows the expected shape of every command it issues and never
//! needs the tree structure.  Nil bulk strings and nil arrays flatten to a
//! single empty string.
//!
//! Parse errors (unknown prefix byte, non-digit length) are fatal for the
//! connection.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(String),
}

/// Try to parse one complete top-level reply from the start of `buf`.
///
/// Returns the flattened leaf tokens and the number of bytes consumed, or
/// `None` when the buffer does not yet hold a complete reply.
pub fn parse_reply(buf: &[u8]) -> Result<Option<(Vec<String>, usize)>, RespError> {
    let mut out = Vec::new();
    match parse_node(buf, 0, &mut out)? {
        Some(consumed) => Ok(Some((out, consumed))),
        None => Ok(None),
    }
}

fn parse_node(buf: &[u8], pos: usize, out: &mut Vec<String>) -> Result<Option<usize>, RespError> {
    if pos >= buf.len() {
        return Ok(None);
    }
    let Some(line_end) = find_crlf(buf, pos + 1) else {
        return Ok(None);
    };
    let line = &buf[pos + 1..line_end];
    match buf[pos] {
        b'+' | b'-' | b':' => {
            out.push(to_utf8(line)?);
            Ok(Some(line_end + 2))
        }
        b'$' => {
            let len = parse_len(line)?;
            let Some(len) = len else {
                // Nil bulk flattens to an empty string.
                out.push(String::new());
                return Ok(Some(line_end + 2));
            };
            let start = line_end + 2;
            if buf.len() < start + len + 2 {
                return Ok(None);
            }
            if &buf[start + len..start + len + 2] != b"\r\n" {
                return Err(RespError::Protocol(
                    "bulk string not terminated by CRLF".to_owned(),
                ));
            }
            out.push(to_utf8(&buf[start..start + len])?);
            Ok(Some(start + len + 2))
        }
        b'*' => {
            let len = parse_len(line)?;
            let Some(len) = len else {
                out.push(String::new());
                return Ok(Some(line_end + 2));
            };
            let mut next = line_end + 2;
            for _ in 0..len {
                match parse_node(buf, next, out)? {
                    Some(pos) => next = pos,
                    None => return Ok(None),
                }
            }
            Ok(Some(next))
        }
        other => Err(RespError::Protocol(format!(
            "unexpected reply prefix {:?}",
            char::from(other)
        ))),
    }
}

/// Find the index of the next `\r\n`, searching from `from`.
fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from.min(buf.len())..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| i + from)
}

/// Parse a length prefix.  `-1` is the nil marker and maps to `None`.
fn parse_len(line: &[u8]) -> Result<Option<usize>, RespError> {
    if line == b"-1" {
        return Ok(None);
    }
    if line.is_empty() {
        return Err(RespError::Protocol("empty length prefix".to_owned()));
    }
    let mut len: usize = 0;
    for &b in line {
        if !b.is_ascii_digit() {
            return Err(RespError::Protocol(format!(
                "non-digit in length prefix: {:?}",
                char::from(b)
            )));
        }
        len = len * 10 + usize::from(b - b'0');
    }
    Ok(Some(len))
}

fn to_utf8(bytes: &[u8]) -> Result<String, RespError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| RespError::Protocol("reply is not valid UTF-8".to_owned()))
}

/// Streaming decoder over the reply side of a Redis connection.
#[derive(Debug, Default)]
pub struct RespCodec;

impl RespCodec {
    pub fn new() -> Self {
        RespCodec
    }
}

impl Decoder for RespCodec {
    type Item = Vec<String>;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_reply(&src[..])? {
            Some((tokens, consumed)) => {
                src.advance(consumed);
                Ok(Some(tokens))
            }
            None => Ok(None),
        }
    }
}
