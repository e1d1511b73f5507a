//! RESP (Redis Serialization Protocol) frames and codecs.
//!
//! Three consumers share this module: the TCP front-end decodes request
//! arrays through [`RespCodec`] (which handles pipelining and frames split
//! across reads), the cluster peer client drives the same codec through
//! `Framed` for request/response forwarding, and AOF replay uses the
//! blocking [`FrameReader`] to pull one frame at a time from a file.

use std::io::{self, BufRead};

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single bulk payload; larger length prefixes are treated
/// as protocol violations rather than allocation requests.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound on array element counts, for the same reason.
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// One RESP frame. Commands arrive as `Array`; every reply shape the server
/// produces is representable here. Arrays are restricted to arrays of bulk
/// strings, which is the only shape clients send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Status(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk (`$-1`), the "missing key" reply.
    Bulk(Option<Vec<u8>>),
    /// `None` is the null array (`*-1`); `Some(vec![])` is the empty array.
    Array(Option<Vec<Vec<u8>>>),
}

impl Frame {
    pub fn ok() -> Frame {
        Frame::Status("OK".to_string())
    }

    pub fn pong() -> Frame {
        Frame::Status("PONG".to_string())
    }

    pub fn null_bulk() -> Frame {
        Frame::Bulk(None)
    }

    pub fn error(msg: impl Into<String>) -> Frame {
        Frame::Error(msg.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Serialize this frame to its exact wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Status(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Error(s) => {
                out.push(b'-');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Integer(v) => {
                out.push(b':');
                out.extend_from_slice(v.to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Bulk(arg) => write_bulk(out, arg.as_deref()),
            Frame::Array(None) => out.extend_from_slice(b"*-1\r\n"),
            Frame::Array(Some(items)) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    write_bulk(out, Some(item));
                }
            }
        }
    }
}

fn write_bulk(out: &mut Vec<u8>, arg: Option<&[u8]>) {
    match arg {
        None => out.extend_from_slice(b"$-1\r\n"),
        Some(b) => {
            out.push(b'$');
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(b);
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// Serialize a command argv as a RESP array of bulks. This is the byte form
/// appended to the AOF and sent to cluster peers.
pub fn encode_array(args: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.push(b'*');
    out.extend_from_slice(args.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        write_bulk(&mut out, Some(arg));
    }
    out
}

fn protocol_error(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("protocol error: {}", msg.into()))
}

/// Find one CRLF-terminated line at `start`; returns the line body and the
/// offset just past the terminator, or `None` if the buffer ends first.
fn find_line(buf: &[u8], start: usize) -> io::Result<Option<(&[u8], usize)>> {
    let Some(nl) = buf[start..].iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let nl = start + nl;
    if nl == start || buf[nl - 1] != b'\r' {
        return Err(protocol_error("expected CRLF line terminator"));
    }
    Ok(Some((&buf[start..nl - 1], nl + 1)))
}

fn parse_i64(digits: &[u8]) -> io::Result<i64> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| protocol_error("invalid length or integer"))
}

/// Try to parse one bulk string starting at `start` (the `$` header line
/// included). Returns the payload (None for `$-1`) and the next offset.
#[allow(clippy::type_complexity)]
fn parse_bulk(buf: &[u8], start: usize) -> io::Result<Option<(Option<Vec<u8>>, usize)>> {
    let Some((line, mut pos)) = find_line(buf, start)? else {
        return Ok(None);
    };
    if line.first() != Some(&b'$') {
        return Err(protocol_error("expected bulk string in array"));
    }
    let n = parse_i64(&line[1..])?;
    if n == -1 {
        return Ok(Some((None, pos)));
    }
    if n < 0 || n > MAX_BULK_LEN {
        return Err(protocol_error("invalid bulk length"));
    }
    let n = n as usize;
    if buf.len() < pos + n + 2 {
        return Ok(None);
    }
    let body = buf[pos..pos + n].to_vec();
    pos += n;
    if &buf[pos..pos + 2] != b"\r\n" {
        return Err(protocol_error("bad bulk string terminator"));
    }
    Ok(Some((Some(body), pos + 2)))
}

/// Try to parse one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only a frame prefix (the caller
/// waits for more bytes), `Ok(Some((frame, consumed)))` on success, and an
/// error on any protocol violation, including inline (non-RESP) input.
pub fn parse_frame(buf: &[u8]) -> io::Result<Option<(Frame, usize)>> {
    let Some((line, pos)) = find_line(buf, 0)? else {
        return Ok(None);
    };
    if line.is_empty() {
        return Err(protocol_error("empty line"));
    }
    match line[0] {
        b'+' => Ok(Some((
            Frame::Status(String::from_utf8_lossy(&line[1..]).into_owned()),
            pos,
        ))),
        b'-' => Ok(Some((
            Frame::Error(String::from_utf8_lossy(&line[1..]).into_owned()),
            pos,
        ))),
        b':' => Ok(Some((Frame::Integer(parse_i64(&line[1..])?), pos))),
        b'$' => {
            // Re-parse from the top so bulk framing lives in one place.
            match parse_bulk(buf, 0)? {
                None => Ok(None),
                Some((body, consumed)) => Ok(Some((Frame::Bulk(body), consumed))),
            }
        }
        b'*' => {
            let n = parse_i64(&line[1..])?;
            if n == -1 {
                return Ok(Some((Frame::Array(None), pos)));
            }
            if n < 0 || n > MAX_ARRAY_LEN {
                return Err(protocol_error("invalid array length"));
            }
            let mut items = Vec::with_capacity(n as usize);
            let mut pos = pos;
            for _ in 0..n {
                match parse_bulk(buf, pos)? {
                    None => return Ok(None),
                    Some((body, next)) => {
                        // Null bulks never appear in command arrays; decode
                        // them as empty payloads rather than rejecting.
                        items.push(body.unwrap_or_default());
                        pos = next;
                    }
                }
            }
            Ok(Some((Frame::Array(Some(items)), pos)))
        }
        _ => Err(protocol_error(format!(
            "unexpected byte {:?}",
            char::from(line[0])
        ))),
    }
}

/// Stream codec for `Framed` transports. Decoding yields one frame per
/// complete wire frame regardless of how reads fragment or coalesce.
#[derive(Debug, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        match parse_frame(src)? {
            None => Ok(None),
            Some((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
        }
    }
}

impl Encoder<Frame> for RespCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> io::Result<()> {
        dst.extend_from_slice(&frame.to_bytes());
        Ok(())
    }
}

/// Blocking reader that yields exactly one frame per call.
///
/// Used where request/response or sequential-scan semantics are wanted
/// instead of a decoded stream: AOF replay reads frames until EOF.
pub struct FrameReader<R: BufRead> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Read the next frame. `Ok(None)` signals EOF at a frame boundary;
    /// EOF inside a frame or malformed bytes are errors.
    pub fn read_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        loop {
            if !self.buf.is_empty() {
                if let Some((frame, consumed)) = parse_frame(&self.buf)? {
                    self.buf.drain(..consumed);
                    return Ok(Some(frame));
                }
            }
            let chunk = self.reader.fill_buf()?;
            if chunk.is_empty() {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                anyhow::bail!("protocol error: truncated frame at end of input");
            }
            let n = chunk.len();
            self.buf.extend_from_slice(chunk);
            self.reader.consume(n);
        }
    }
}
