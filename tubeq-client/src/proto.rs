//! # Line Protocol Encoding and Parsing
//!
//! Purpose: Encode broker commands and parse broker replies with explicit
//! framing, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Each reply line is parsed on its own.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Job bodies are framed by length, never by delimiter.
//! 4. **Fail Fast**: Broken framing surfaces as an IO error immediately.

use std::io::{self, BufRead, Write};

use crate::error::{ClientError, ClientResult};

/// Longest tube name the broker accepts.
pub const MAX_TUBE_NAME_LEN: usize = 200;

const CRLF: &[u8] = b"\r\n";

/// Rejects names that would break the line framing of `use`/`watch`.
pub fn validate_tube(name: &str) -> ClientResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_TUBE_NAME_LEN
        && !name.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control());
    if valid {
        Ok(())
    } else {
        Err(ClientError::InvalidTube(name.to_string()))
    }
}

/// `use <tube>\r\n`
pub fn encode_use(tube: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(b"use ");
    out.extend_from_slice(tube.as_bytes());
    out.extend_from_slice(CRLF);
}

/// `watch <tube>\r\n`
pub fn encode_watch(tube: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(b"watch ");
    out.extend_from_slice(tube.as_bytes());
    out.extend_from_slice(CRLF);
}

/// `put <pri> <delay> <ttr> <bytes>\r\n<body>\r\n`
///
/// Command line, body and terminator land in one buffer so the caller can
/// write them as a single unit.
pub fn encode_put(priority: u32, delay_secs: u64, ttr_secs: u64, body: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(b"put ");
    push_u64(out, u64::from(priority));
    out.push(b' ');
    push_u64(out, delay_secs);
    out.push(b' ');
    push_u64(out, ttr_secs);
    out.push(b' ');
    push_u64(out, body.len() as u64);
    out.extend_from_slice(CRLF);
    out.extend_from_slice(body);
    out.extend_from_slice(CRLF);
}

/// `delete <id>\r\n`
pub fn encode_delete(id: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(b"delete ");
    push_u64(out, id);
    out.extend_from_slice(CRLF);
}

/// `reserve-with-timeout <seconds>\r\n`
pub fn encode_reserve(timeout_secs: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(b"reserve-with-timeout ");
    push_u64(out, timeout_secs);
    out.extend_from_slice(CRLF);
}

/// Reads one CRLF-terminated reply line into `buf`, terminator stripped.
pub fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by broker",
        ));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "reply line not CRLF-terminated"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

/// Reads exactly `len` payload bytes plus the trailing CRLF.
pub fn read_body<R: BufRead>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let framed = len
        .checked_add(CRLF.len())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "job body length out of range"))?;
    let mut body = Vec::new();
    body.try_reserve_exact(framed)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "job body length out of range"))?;
    body.resize(framed, 0);
    reader.read_exact(&mut body)?;
    if &body[len..] != CRLF {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "job body not CRLF-terminated"));
    }
    body.truncate(len);
    Ok(body)
}

/// Splits `line` into its arguments when its first word is `word`.
///
/// Returns `None` when the reply names a different outcome.
pub fn reply_args<'a>(line: &'a [u8], word: &[u8]) -> Option<Vec<&'a [u8]>> {
    let mut parts = line.split(|&b| b == b' ');
    if parts.next()? != word {
        return None;
    }
    Some(parts.collect())
}

/// `USING <tube>` echoing exactly the requested tube.
pub fn parse_using(line: &[u8], tube: &str) -> bool {
    matches!(reply_args(line, b"USING").as_deref(), Some([name]) if *name == tube.as_bytes())
}

/// `WATCHING <count>`
pub fn parse_watching(line: &[u8]) -> Option<u64> {
    match reply_args(line, b"WATCHING")?.as_slice() {
        [count] => parse_u64(count),
        _ => None,
    }
}

/// `INSERTED <id>`
pub fn parse_inserted(line: &[u8]) -> Option<u64> {
    match reply_args(line, b"INSERTED")?.as_slice() {
        [id] => parse_u64(id),
        _ => None,
    }
}

/// `RESERVED <id> <bytes>`
pub fn parse_reserved(line: &[u8]) -> Option<(u64, usize)> {
    match reply_args(line, b"RESERVED")?.as_slice() {
        [id, len] => Some((parse_u64(id)?, usize::try_from(parse_u64(len)?).ok()?)),
        _ => None,
    }
}

fn parse_u64(data: &[u8]) -> Option<u64> {
    if data.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add(u64::from(b - b'0'))?;
    }
    Some(value)
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    // Infallible for a Vec sink.
    let _ = write!(out, "{value}");
}
