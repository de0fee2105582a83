//! Application-level liveness probe: a minimal Server List Ping client.
//! A unit can be `active` long before the server accepts connections, so
//! the lifecycle core asks the listener itself. Any failure here simply
//! means "not answering yet".

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 25565;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const IO_TIMEOUT: Duration = Duration::from_secs(2);
const STATUS_PROTOCOL_VERSION: i32 = -1;
const MAX_RESPONSE_BYTES: i32 = 1 << 21;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("no address found for {0}")]
    NoAddress(String),
    #[error("malformed status response: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub online: i64,
    pub max: i64,
    pub protocol: i64,
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    players: Players,
    #[serde(default)]
    version: Version,
}

#[derive(Debug, Default, Deserialize)]
struct Players {
    #[serde(default)]
    online: i64,
    #[serde(default)]
    max: i64,
}

#[derive(Debug, Deserialize)]
struct Version {
    #[serde(default = "unknown_version")]
    name: String,
    #[serde(default = "unknown_protocol")]
    protocol: i64,
}

impl Default for Version {
    fn default() -> Self {
        Self {
            name: unknown_version(),
            protocol: unknown_protocol(),
        }
    }
}

fn unknown_version() -> String {
    "n/a".to_string()
}

fn unknown_protocol() -> i64 {
    -1
}

/// Query the server list ping endpoint. Errors mean the listener is not
/// ready; callers decide what that implies.
pub fn status(host: &str, port: u16) -> Result<ServerStatus, ProbeError> {
    let addr = resolve(host, port)?;
    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    stream.write_all(&handshake_packet(host, port))?;
    stream.write_all(&packet(&[0x00]))?;

    let _frame_len = read_varint(&mut stream)?;
    let packet_id = read_varint(&mut stream)?;
    if packet_id != 0 {
        return Err(ProbeError::Protocol(format!(
            "unexpected packet id {packet_id}"
        )));
    }
    let json_len = read_varint(&mut stream)?;
    if !(0..=MAX_RESPONSE_BYTES).contains(&json_len) {
        return Err(ProbeError::Protocol(format!(
            "unreasonable payload length {json_len}"
        )));
    }
    let mut payload = vec![0u8; json_len as usize];
    stream.read_exact(&mut payload)?;

    let response: StatusResponse = serde_json::from_slice(&payload)?;
    Ok(ServerStatus {
        online: response.players.online,
        max: response.players.max,
        protocol: response.version.protocol,
        version: response.version.name,
    })
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ProbeError> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ProbeError::NoAddress(format!("{host}:{port}")))
}

fn handshake_packet(host: &str, port: u16) -> Vec<u8> {
    let mut body = vec![0x00];
    write_varint(&mut body, STATUS_PROTOCOL_VERSION);
    write_varint(&mut body, host.len() as i32);
    body.extend_from_slice(host.as_bytes());
    body.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut body, 1);
    packet(&body)
}

/// Length-prefix a packet body.
fn packet(body: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(body.len() + 5);
    write_varint(&mut framed, body.len() as i32);
    framed.extend_from_slice(body);
    framed
}

fn write_varint(out: &mut Vec<u8>, value: i32) {
    let mut remaining = value as u32;
    loop {
        let byte = (remaining & 0x7F) as u8;
        remaining >>= 7;
        if remaining == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(reader: &mut impl Read) -> Result<i32, ProbeError> {
    let mut value = 0u32;
    for shift in 0..5 {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        value |= ((byte[0] & 0x7F) as u32) << (shift * 7);
        if byte[0] & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(ProbeError::Protocol("varint longer than 5 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: i32) -> i32 {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        read_varint(&mut buf.as_slice()).unwrap()
    }

    #[test]
    fn varint_round_trips() {
        for value in [0, 1, 127, 128, 255, 25565, i32::MAX, -1, i32::MIN] {
            assert_eq!(round_trip(value), value);
        }
    }

    #[test]
    fn negative_one_is_five_bytes() {
        let mut buf = Vec::new();
        write_varint(&mut buf, -1);
        assert_eq!(buf, [0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
    }

    #[test]
    fn overlong_varint_is_rejected() {
        let overlong = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert!(matches!(
            read_varint(&mut overlong.as_slice()),
            Err(ProbeError::Protocol(_))
        ));
    }

    #[test]
    fn handshake_packet_is_framed() {
        let framed = handshake_packet("localhost", 25565);
        let mut reader = framed.as_slice();
        let len = read_varint(&mut reader).unwrap();
        assert_eq!(len as usize, reader.len());
        assert_eq!(reader[0], 0x00);
    }

    #[test]
    fn status_response_tolerates_missing_fields() {
        let response: StatusResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(response.players.online, 0);
        assert_eq!(response.version.protocol, -1);
        assert_eq!(response.version.name, "n/a");
    }

    #[test]
    fn status_response_parses_player_counts() {
        let raw = r#"{"players":{"online":3,"max":20},"version":{"name":"1.20.1","protocol":763}}"#;
        let response: StatusResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.players.online, 3);
        assert_eq!(response.players.max, 20);
        assert_eq!(response.version.name, "1.20.1");
    }

    #[test]
    fn probe_fails_fast_when_nothing_listens() {
        // port 1 on localhost is essentially never bound
        assert!(status("127.0.0.1", 1).is_err());
    }
}
