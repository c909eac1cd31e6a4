//! Control-line framing and data-channel header parsing
//!
//! Both protocols are parsed out of a bounded buffer that is refilled from
//! the connection and compacted after each batch: complete records are
//! handed out as slices, the unconsumed suffix moves to the front.

use std::collections::HashMap;

use crate::error::{EtdError, Result};
use crate::transport::Channel;

/// Bounded receive buffer. Callers refill it from a connection, split out
/// complete records, then `consume` the parsed prefix.
pub struct LineBuf {
    buf: Vec<u8>,
    len: usize,
}

impl LineBuf {
    pub fn with_capacity(cap: usize) -> Self {
        LineBuf {
            buf: vec![0u8; cap],
            len: 0,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Read more bytes from the connection into the free tail. Returns the
    /// number of bytes read; 0 means the peer closed the connection.
    pub fn fill(&mut self, chan: &mut dyn Channel) -> Result<usize> {
        debug_assert!(!self.is_full());
        let n = chan.read(&mut self.buf[self.len..])?;
        self.len += n;
        Ok(n)
    }

    /// Drop the first `endpos` bytes, moving the remainder to the front.
    pub fn consume(&mut self, endpos: usize) {
        debug_assert!(endpos <= self.len);
        self.buf.copy_within(endpos..self.len, 0);
        self.len -= endpos;
    }
}

/// Split the buffered bytes into complete lines. Lines are terminated by
/// CR, LF or any run of the two; empty separators collapse. Returns the
/// lines and the offset just past the last terminator seen (a trailing
/// partial line stays in the buffer).
pub fn split_lines(data: &[u8]) -> Result<(Vec<&str>, usize)> {
    let mut lines = Vec::new();
    let mut endpos = 0usize;
    let mut start: Option<usize> = None;
    for (i, b) in data.iter().enumerate() {
        if *b == b'\r' || *b == b'\n' {
            if let Some(s) = start.take() {
                let line = std::str::from_utf8(&data[s..i])
                    .map_err(|_| EtdError::Protocol("line is not valid UTF-8".to_string()))?;
                lines.push(line);
            }
            endpos = i + 1;
        } else if start.is_none() {
            start = Some(i);
        }
    }
    Ok((lines, endpos))
}

/// Locate the data-channel header in the first bytes of a connection. The
/// very first byte must be `{`; the header ends at the first `}`. Returns
/// the offset just past the closing brace, or `None` if the brace has not
/// arrived yet.
pub fn find_header(data: &[u8]) -> Result<Option<usize>> {
    match data.first() {
        None => Ok(None),
        Some(b'{') => Ok(data.iter().position(|b| *b == b'}').map(|p| p + 1)),
        Some(_) => Err(EtdError::Protocol(
            "data connection did not start with a header".to_string(),
        )),
    }
}

/// Parse the `key:value` pairs between the braces. Keys are
/// case-insensitive (stored lowercased) and must be unique; values are bare
/// tokens or double-quoted strings in which a backslash escapes (and is
/// stripped before) any character.
pub fn parse_header(header: &[u8]) -> Result<HashMap<String, String>> {
    let body = std::str::from_utf8(header)
        .map_err(|_| EtdError::Protocol("header is not valid UTF-8".to_string()))?;
    let body = body
        .strip_prefix('{')
        .and_then(|b| b.strip_suffix('}'))
        .ok_or_else(|| EtdError::Protocol("malformed header braces".to_string()))?;

    let mut pairs = HashMap::new();
    let mut rest = body.trim_start();
    while !rest.is_empty() {
        let (key, after) = take_key(rest)?;
        rest = after.trim_start();
        rest = rest
            .strip_prefix(':')
            .ok_or_else(|| EtdError::Protocol(format!("missing ':' after header key '{key}'")))?
            .trim_start();
        let (value, after) = take_value(rest)?;
        if pairs.insert(key.to_ascii_lowercase(), value).is_some() {
            return Err(EtdError::Protocol(format!("duplicate header key '{key}'")));
        }
        rest = after.trim_start();
        match rest.strip_prefix(',') {
            Some(r) => rest = r.trim_start(),
            None if rest.is_empty() => break,
            None => {
                return Err(EtdError::Protocol(
                    "header fields must be comma separated".to_string(),
                ))
            }
        }
    }
    Ok(pairs)
}

fn take_key(s: &str) -> Result<(&str, &str)> {
    let bytes = s.as_bytes();
    if bytes.is_empty() || !bytes[0].is_ascii_alphabetic() {
        return Err(EtdError::Protocol("malformed header key".to_string()));
    }
    let mut end = 1;
    while end < bytes.len()
        && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_' || bytes[end] == b'-')
    {
        end += 1;
    }
    if end < 2 {
        return Err(EtdError::Protocol("malformed header key".to_string()));
    }
    Ok((&s[..end], &s[end..]))
}

fn take_value(s: &str) -> Result<(String, &str)> {
    if let Some(quoted) = s.strip_prefix('"') {
        let mut value = String::new();
        let mut chars = quoted.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, esc)) => value.push(esc),
                    None => break,
                },
                '"' => return Ok((value, &quoted[i + 1..])),
                other => value.push(other),
            }
        }
        Err(EtdError::Protocol(
            "unterminated quoted header value".to_string(),
        ))
    } else {
        let end = s
            .find(|c: char| c == ',' || c.is_ascii_whitespace())
            .unwrap_or(s.len());
        if end == 0 {
            return Err(EtdError::Protocol("empty header value".to_string()));
        }
        Ok((s[..end].to_string(), &s[end..]))
    }
}
