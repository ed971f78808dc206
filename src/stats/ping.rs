//! Status pings over the two game protocols.
//!
//! * Java edition: Server List Ping over TCP. A handshake packet switches
//!   the connection to the status state, then a status request returns a
//!   VarInt-framed JSON document.
//! * Bedrock edition: RakNet unconnected ping over UDP. The pong carries a
//!   `;`-separated MOTD string.
//!
//! Both return [`PingOutcome::Unreachable`] instead of an error when the
//! server does not answer in time or answers with garbage.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

const HANDSHAKE_PROTOCOL_VERSION: i32 = 47;
const MAX_STATUS_LEN: usize = 1 << 20;

/// Offline message id marker shared by every RakNet unconnected packet.
pub const RAKNET_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];
const UNCONNECTED_PING: u8 = 0x01;
const UNCONNECTED_PONG: u8 = 0x1c;

/// Which status protocol a server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PingProtocol {
    /// TCP handshake based Server List Ping.
    Java,
    /// UDP datagram based RakNet query.
    Bedrock,
}

/// Parsed status reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingReply {
    pub online: u32,
    pub max: u32,
    /// Names from the player sample. Bedrock never reports names.
    pub players: Vec<String>,
    pub description: String,
    pub version: String,
    /// Base64 PNG favicon without the data URI prefix.
    pub icon: Option<String>,
}

/// Result of a ping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PingOutcome {
    Online(PingReply),
    Unreachable,
}

impl PingOutcome {
    pub fn reply(&self) -> Option<&PingReply> {
        match self {
            PingOutcome::Online(reply) => Some(reply),
            PingOutcome::Unreachable => None,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, PingOutcome::Online(_))
    }
}

/// Pings `host:port` with the given protocol.
pub async fn ping(host: &str, port: u16, protocol: PingProtocol, limit: Duration) -> PingOutcome {
    let result = match protocol {
        PingProtocol::Java => timeout(limit, ping_java(host, port)).await,
        PingProtocol::Bedrock => timeout(limit, ping_bedrock(host, port)).await,
    };

    match result {
        Ok(Ok(reply)) => PingOutcome::Online(reply),
        Ok(Err(e)) => {
            tracing::debug!(host = %host, port, error = %e, "Status ping failed");
            PingOutcome::Unreachable
        }
        Err(_) => {
            tracing::debug!(host = %host, port, "Status ping timed out");
            PingOutcome::Unreachable
        }
    }
}

async fn ping_java(host: &str, port: u16) -> std::io::Result<PingReply> {
    let mut stream = TcpStream::connect((host, port)).await?;

    let mut handshake = Vec::new();
    write_varint(&mut handshake, 0x00);
    write_varint(&mut handshake, HANDSHAKE_PROTOCOL_VERSION);
    write_string(&mut handshake, host);
    handshake.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut handshake, 1);

    stream.write_all(&frame(&handshake)).await?;
    stream.write_all(&frame(&[0x00])).await?;
    stream.flush().await?;

    let packet_len = read_varint_async(&mut stream).await?;
    if packet_len <= 0 || packet_len as usize > MAX_STATUS_LEN {
        return Err(invalid("status packet length out of range"));
    }
    let mut packet = vec![0u8; packet_len as usize];
    stream.read_exact(&mut packet).await?;

    let mut cursor = packet.as_slice();
    let packet_id = read_varint(&mut cursor)?;
    if packet_id != 0x00 {
        return Err(invalid("unexpected status packet id"));
    }
    let json_len = read_varint(&mut cursor)?;
    if json_len < 0 || json_len as usize > cursor.len() {
        return Err(invalid("status string length out of range"));
    }
    let json = std::str::from_utf8(&cursor[..json_len as usize])
        .map_err(|_| invalid("status string is not UTF-8"))?;

    parse_java_status(json)
}

/// Parses the JSON status document of a Java edition server.
pub fn parse_java_status(json: &str) -> std::io::Result<PingReply> {
    let status: Value = serde_json::from_str(json).map_err(|e| invalid(&e.to_string()))?;

    let players = status.get("players");
    let online = players
        .and_then(|p| p.get("online"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let max = players
        .and_then(|p| p.get("max"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let names = players
        .and_then(|p| p.get("sample"))
        .and_then(Value::as_array)
        .map(|sample| {
            sample
                .iter()
                .filter_map(|p| p.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let version = status
        .get("version")
        .and_then(|v| v.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let icon = status
        .get("favicon")
        .and_then(Value::as_str)
        .map(|favicon| {
            favicon
                .strip_prefix("data:image/png;base64,")
                .unwrap_or(favicon)
                .replace('\n', "")
        });

    Ok(PingReply {
        online,
        max,
        players: names,
        description: status.get("description").map(flatten_chat).unwrap_or_default(),
        version,
        icon,
    })
}

/// Flattens a chat component (plain string or `{text, extra}` tree) to text.
fn flatten_chat(component: &Value) -> String {
    match component {
        Value::String(text) => text.clone(),
        Value::Object(map) => {
            let mut text = map
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if let Some(Value::Array(extra)) = map.get("extra") {
                for part in extra {
                    text.push_str(&flatten_chat(part));
                }
            }
            text
        }
        Value::Array(parts) => parts.iter().map(flatten_chat).collect(),
        _ => String::new(),
    }
}

async fn ping_bedrock(host: &str, port: u16) -> std::io::Result<PingReply> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect((host, port)).await?;

    let now = chrono::Utc::now().timestamp_millis();
    let mut request = Vec::with_capacity(33);
    request.push(UNCONNECTED_PING);
    request.extend_from_slice(&now.to_be_bytes());
    request.extend_from_slice(&RAKNET_MAGIC);
    request.extend_from_slice(&0x2d_2d_2d_2d_i64.to_be_bytes());
    socket.send(&request).await?;

    let mut buf = vec![0u8; 2048];
    let len = socket.recv(&mut buf).await?;
    parse_bedrock_pong(&buf[..len])
}

/// Parses a RakNet unconnected pong datagram.
pub fn parse_bedrock_pong(datagram: &[u8]) -> std::io::Result<PingReply> {
    // id(1) + time(8) + guid(8) + magic(16) + string length(2)
    const HEADER: usize = 1 + 8 + 8 + 16 + 2;
    if datagram.len() < HEADER || datagram[0] != UNCONNECTED_PONG {
        return Err(invalid("not an unconnected pong"));
    }
    if datagram[17..33] != RAKNET_MAGIC {
        return Err(invalid("bad RakNet magic"));
    }
    let motd_len = u16::from_be_bytes([datagram[33], datagram[34]]) as usize;
    let motd = datagram
        .get(HEADER..HEADER + motd_len)
        .ok_or_else(|| invalid("truncated MOTD"))?;
    let motd = String::from_utf8_lossy(motd);

    // MCPE;<motd>;<protocol>;<version>;<online>;<max>;<guid>;<sub motd>;<mode>;...
    let fields: Vec<&str> = motd.split(';').collect();
    if fields.len() < 6 {
        return Err(invalid("MOTD has too few fields"));
    }

    Ok(PingReply {
        online: fields[4].parse().unwrap_or(0),
        max: fields[5].parse().unwrap_or(0),
        players: Vec::new(),
        description: fields[1].to_string(),
        version: fields[3].to_string(),
        icon: None,
    })
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + 5);
    write_varint(&mut framed, payload.len() as i32);
    framed.extend_from_slice(payload);
    framed
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_varint(buf, value.len() as i32);
    buf.extend_from_slice(value.as_bytes());
}

/// Appends a protocol VarInt (7 bits per byte, least significant group first).
pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        if value & !0x7f == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
}

/// Reads a protocol VarInt from the front of `cursor`, advancing it.
pub fn read_varint(cursor: &mut &[u8]) -> std::io::Result<i32> {
    let mut result: u32 = 0;
    for shift in 0..5 {
        let (&byte, rest) = cursor.split_first().ok_or_else(|| invalid("truncated VarInt"))?;
        *cursor = rest;
        result |= ((byte & 0x7f) as u32) << (7 * shift);
        if byte & 0x80 == 0 {
            return Ok(result as i32);
        }
    }
    Err(invalid("VarInt too long"))
}

async fn read_varint_async(stream: &mut TcpStream) -> std::io::Result<i32> {
    let mut result: u32 = 0;
    for shift in 0..5 {
        let byte = stream.read_u8().await?;
        result |= ((byte & 0x7f) as u32) << (7 * shift);
        if byte & 0x80 == 0 {
            return Ok(result as i32);
        }
    }
    Err(invalid("VarInt too long"))
}

fn invalid(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_known_encodings() {
        let cases: [(i32, &[u8]); 4] = [
            (0, &[0x00]),
            (300, &[0xac, 0x02]),
            (25565, &[0xdd, 0xc7, 0x01]),
            (-1, &[0xff, 0xff, 0xff, 0xff, 0x0f]),
        ];
        for (value, bytes) in cases {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            assert_eq!(buf, bytes);
            let mut cursor = bytes;
            assert_eq!(read_varint(&mut cursor).unwrap(), value);
            assert!(cursor.is_empty());
        }
    }

    #[test]
    fn test_parse_java_status_with_chat_description() {
        let json = r#"{
            "version": {"name": "1.20.4", "protocol": 765},
            "players": {"max": 20, "online": 2, "sample": [{"name": "alex", "id": "x"}, {"name": "steve", "id": "y"}]},
            "description": {"text": "Hello ", "extra": [{"text": "world"}]},
            "favicon": "data:image/png;base64,iVBORw0KGgo="
        }"#;

        let reply = parse_java_status(json).unwrap();

        assert_eq!(reply.online, 2);
        assert_eq!(reply.max, 20);
        assert_eq!(reply.players, vec!["alex", "steve"]);
        assert_eq!(reply.description, "Hello world");
        assert_eq!(reply.version, "1.20.4");
        assert_eq!(reply.icon.as_deref(), Some("iVBORw0KGgo="));
    }

    #[test]
    fn test_parse_bedrock_pong() {
        let motd = b"MCPE;Dedicated Server;630;1.20.50;3;10;1234567890;Bedrock level;Survival;1;19132;19133;";
        let mut datagram = vec![UNCONNECTED_PONG];
        datagram.extend_from_slice(&0i64.to_be_bytes());
        datagram.extend_from_slice(&1i64.to_be_bytes());
        datagram.extend_from_slice(&RAKNET_MAGIC);
        datagram.extend_from_slice(&(motd.len() as u16).to_be_bytes());
        datagram.extend_from_slice(motd);

        let reply = parse_bedrock_pong(&datagram).unwrap();

        assert_eq!(reply.description, "Dedicated Server");
        assert_eq!(reply.version, "1.20.50");
        assert_eq!(reply.online, 3);
        assert_eq!(reply.max, 10);
    }

    #[test]
    fn test_parse_bedrock_rejects_wrong_packet() {
        assert!(parse_bedrock_pong(&[0x01, 0x02]).is_err());
    }
}
