//! Shared helpers for integration tests: an in-process node spawner and a
//! blocking RESP connection that talks to it over real TCP.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use myredis::{start_node, NodeConfig, NodeHandle};

/// Timeout for individual RESP read/write operations.
pub const RESP_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a node in-process; its listener is bound before this returns.
pub async fn spawn_node(cfg: NodeConfig) -> NodeHandle {
    start_node(cfg).await.expect("start node")
}

/// Node config bound to an ephemeral local port.
pub fn local_config() -> NodeConfig {
    NodeConfig {
        addr: "127.0.0.1:0".to_string(),
        ..NodeConfig::default()
    }
}

/// RESP connection wrapper that preserves buffered reads between commands.
pub struct RespConn {
    reader: BufReader<TcpStream>,
}

impl RespConn {
    /// Connect to a node's port with read/write timeouts.
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect node");
        stream.set_read_timeout(Some(RESP_TIMEOUT)).ok();
        stream.set_write_timeout(Some(RESP_TIMEOUT)).ok();
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Send a RESP command with bulk string arguments and return the raw
    /// reply bytes.
    pub fn send_command(&mut self, parts: &[&str]) -> std::io::Result<Vec<u8>> {
        self.write_raw(&encode_command(parts))?;
        read_resp(&mut self.reader)
    }

    /// Write raw bytes without reading anything back.
    pub fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(bytes)?;
        stream.flush()
    }

    /// Read one raw reply.
    pub fn read_reply(&mut self) -> std::io::Result<Vec<u8>> {
        read_resp(&mut self.reader)
    }
}

/// Serialize a command as an array of bulk strings.
pub fn encode_command(parts: &[&str]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for part in parts {
        buf.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
        buf.extend_from_slice(part.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Parse a minimal RESP reply into its raw bytes (prefix included).
fn read_resp(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<u8>> {
    let mut first = [0u8; 1];
    reader.read_exact(&mut first)?;
    match first[0] {
        b'+' | b'-' | b':' => {
            let mut line = Vec::new();
            reader.read_until(b'\n', &mut line)?;
            let mut out = vec![first[0]];
            out.extend_from_slice(&line);
            Ok(out)
        }
        b'$' => {
            let mut header = Vec::new();
            reader.read_until(b'\n', &mut header)?;
            let len = parse_len(&header)?;
            let mut out = vec![b'$'];
            out.extend_from_slice(&header);
            if len >= 0 {
                let mut body = vec![0u8; len as usize + 2];
                reader.read_exact(&mut body)?;
                out.extend_from_slice(&body);
            }
            Ok(out)
        }
        b'*' => {
            let mut header = Vec::new();
            reader.read_until(b'\n', &mut header)?;
            let count = parse_len(&header)?;
            let mut out = vec![b'*'];
            out.extend_from_slice(&header);
            for _ in 0..count.max(0) {
                out.extend_from_slice(&read_resp(reader)?);
            }
            Ok(out)
        }
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected reply prefix {other:?}"),
        )),
    }
}

fn parse_len(header: &[u8]) -> std::io::Result<i64> {
    let text = std::str::from_utf8(header)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad length"))?;
    text.trim_end()
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad length"))
}

/// Decode a raw multi-bulk reply into its elements (assumes bulk elements).
pub fn parse_array_elements(raw: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    // Skip the array header line.
    pos += line_end(raw, pos);
    while pos < raw.len() {
        assert_eq!(raw[pos], b'$', "expected bulk element");
        let header_end = line_end(raw, pos);
        let len: i64 = std::str::from_utf8(&raw[pos + 1..pos + header_end - 2])
            .unwrap()
            .parse()
            .unwrap();
        pos += header_end;
        if len >= 0 {
            out.push(raw[pos..pos + len as usize].to_vec());
            pos += len as usize + 2;
        }
    }
    out
}

fn line_end(raw: &[u8], start: usize) -> usize {
    raw[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| i + 1)
        .expect("line terminator")
}
