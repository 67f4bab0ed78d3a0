//! Wire protocol between client and server.
//!
//! Every control exchange on a TCP/TLS stream is a length-prefixed JSON
//! message: `<u16 length BE><json bytes>`. A connection starts with one
//! request header and receives one response; some requests then convert the
//! stream into a long-lived channel.
//!
//! Datagram framing on stream channels is `<u16 length BE><payload>`, and
//! UDP-channel datagrams carry a 17-byte cleartext header
//! `<8B session id><8B sequence><1B flags>` followed by the AEAD-sealed
//! payload (the header doubles as AAD).

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{Error, ErrorCode, Result};
use crate::util::Traffic;

/// Upper bound for one control message; anything larger is a protocol error.
pub const MAX_MESSAGE_SIZE: usize = 0xFFFF;

/// Size of the cleartext UDP datagram header.
pub const UDP_HEADER_SIZE: usize = 17;

/// Who displaced a suppressed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SuppressType {
    /// Not suppressed
    #[default]
    None,
    /// Evicted by another client of the same token
    Other,
    /// Evicted by a newer connection of the same client
    Self_,
}

/// Quota usage reported by the access manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessUsage {
    /// Bytes consumed so far
    pub traffic: Traffic,
    /// Quota in bytes, 0 = unlimited
    pub max_traffic: u64,
    /// Expiration as unix seconds, if the token expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_unix: Option<i64>,
    /// Highest client count allowed for the token, 0 = unlimited
    #[serde(default)]
    pub max_clients: u32,
}

/// Live status of a session as seen by either endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Session-level error code
    pub error_code: ErrorCode,
    /// Human-readable detail for non-Ok codes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Who suppressed the session, if anyone
    #[serde(default)]
    pub suppressed_by: SuppressType,
    /// Last usage reported by the access manager
    #[serde(default)]
    pub access_usage: AccessUsage,
}

/// Client identification sent in Hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Stable client id
    pub client_id: Uuid,
    /// Protocol version the client speaks
    pub protocol_version: u32,
    /// Client software version string
    pub client_version: String,
    /// Free-form user agent
    pub user_agent: String,
}

/// Requests a client can open a stream with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request_code")]
pub enum Request {
    /// Create a session
    Hello(HelloRequest),
    /// Adopt this stream as a stream-datagram channel
    TcpDatagramChannel(SessionRequest),
    /// Bridge this stream to an outbound TCP connection
    StreamProxyChannel(StreamProxyRequest),
    /// Reserved; servers answer with GeneralError
    UdpPacket(SessionRequest),
    /// Close the session gracefully
    Bye(SessionRequest),
}

impl Request {
    /// The request id chosen by the client.
    pub fn request_id(&self) -> &str {
        match self {
            Request::Hello(r) => &r.request_id,
            Request::TcpDatagramChannel(r) | Request::UdpPacket(r) | Request::Bye(r) => {
                &r.request_id
            }
            Request::StreamProxyChannel(r) => &r.session.request_id,
        }
    }
}

/// Hello: authenticate a token and create a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    /// Fresh id for correlating logs
    pub request_id: String,
    /// Token being redeemed
    pub token_id: Uuid,
    /// Client identification
    pub client_info: ClientInfo,
    /// Client id encrypted under the token secret (hex)
    pub encrypted_client_id: String,
}

/// Common body for requests addressed to an existing session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Fresh id for correlating logs
    pub request_id: String,
    /// Session being addressed
    pub session_id: u64,
    /// Proof of session ownership (hex of the 16-byte session key)
    pub session_key: String,
}

/// StreamProxyChannel: connect this stream to `destination`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamProxyRequest {
    /// Session addressing and proof
    #[serde(flatten)]
    pub session: SessionRequest,
    /// Where the server should connect
    pub destination: SocketAddr,
}

/// Response to any request; `Hello` replies with [`HelloResponse`] instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionResponse {
    /// Outcome of the request
    pub error_code: ErrorCode,
    /// Detail for non-Ok outcomes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Who suppressed the session, if anyone
    #[serde(default)]
    pub suppressed_by: SuppressType,
    /// Usage snapshot, when known
    #[serde(default)]
    pub access_usage: AccessUsage,
    /// Endpoint to retry against on RedirectHost
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_host_endpoint: Option<SocketAddr>,
}

impl SessionResponse {
    /// An Ok response with no further detail.
    pub fn ok() -> Self {
        Self::default()
    }

    /// A response carrying an error code and message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Successful Hello reply: everything the client needs to run the session.
///
/// Rejected Hellos may come back as a bare [`SessionResponse`]; the defaults
/// let that parse, with `error_code` telling the two apart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HelloResponse {
    /// Base outcome fields
    #[serde(flatten)]
    pub response: SessionResponse,
    /// Session id, non-zero on success
    pub session_id: u64,
    /// Session key (hex of 16 bytes)
    pub session_key: String,
    /// Server secret for out-of-band verification (hex)
    pub server_secret: String,
    /// Protocol version the server speaks
    pub server_protocol_version: u32,
    /// Server software version string
    pub server_version: String,
    /// Deadline the client should apply to requests, in milliseconds
    pub request_timeout_ms: u64,
    /// How long the client may reuse an idle TCP connection, in milliseconds
    pub tcp_reuse_timeout_ms: u64,
    /// TCP endpoints the server listens on
    pub tcp_endpoints: Vec<SocketAddr>,
    /// UDP endpoints for the UDP channel, empty when disabled
    pub udp_endpoints: Vec<SocketAddr>,
    /// Cap on simultaneous datagram channels
    pub max_datagram_channel_count: usize,
    /// Ranges the client should route into the tunnel, if the server narrows them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_ip_ranges: Option<Vec<String>>,
    /// Ranges the packet capture should grab, if the server narrows them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_capture_include_ip_ranges: Option<Vec<String>>,
    /// Whether the server forwards IPv6
    pub is_ipv6_supported: bool,
    /// Opaque id for anonymous usage tracking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement_id: Option<String>,
}

/// Write one length-prefixed JSON message.
pub async fn write_message<S, T>(stream: &mut S, message: &T) -> Result<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(message)?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(Error::invalid(format!(
            "message too large: {} bytes",
            json.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(2 + json.len());
    buf.put_u16(json.len() as u16);
    buf.put_slice(&json);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON message.
pub async fn read_message<S, T>(stream: &mut S) -> Result<T>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let len = u16::from_be_bytes(header) as usize;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Append one `<u16 BE length><payload>` frame to `buf`.
pub fn put_frame(buf: &mut BytesMut, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(Error::invalid(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    buf.reserve(2 + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(())
}

/// Read one frame from a stream; `Ok(None)` on clean EOF at a boundary.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<Bytes>> {
    let mut header = [0u8; 2];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Network(e)),
    }

    let len = u16::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

/// Cleartext header of a UDP-channel datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDatagramHeader {
    /// Owning session
    pub session_id: u64,
    /// Monotonic per-direction sequence
    pub sequence: u64,
    /// Direction and reserved bits
    pub flags: u8,
}

/// Flag bit: datagram travels server-to-client.
pub const UDP_FLAG_SERVER_TO_CLIENT: u8 = 0x01;

impl UdpDatagramHeader {
    /// Encode into the 17-byte wire form.
    pub fn encode(&self) -> [u8; UDP_HEADER_SIZE] {
        let mut buf = [0u8; UDP_HEADER_SIZE];
        buf[..8].copy_from_slice(&self.session_id.to_be_bytes());
        buf[8..16].copy_from_slice(&self.sequence.to_be_bytes());
        buf[16] = self.flags;
        buf
    }

    /// Decode from the start of a datagram.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < UDP_HEADER_SIZE {
            return Err(Error::invalid(format!(
                "udp datagram too short: {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            session_id: u64::from_be_bytes(data[..8].try_into().unwrap()),
            sequence: u64::from_be_bytes(data[8..16].try_into().unwrap()),
            flags: data[16],
        })
    }
}

/// In-band control envelope on datagram channels.
///
/// Regular payloads are IP packets whose first nibble is 4 or 6; control
/// messages claim the impossible version nibble 0 so receivers can split
/// them off before handing packets upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramMessage {
    /// Peer is closing the session
    CloseSession,
}

impl DatagramMessage {
    const MARKER: u8 = 0x01;
    const CODE_CLOSE_SESSION: u8 = 0x01;

    /// Whether a datagram payload is a control envelope.
    pub fn matches(payload: &[u8]) -> bool {
        payload.first() == Some(&Self::MARKER)
    }

    /// Encode to a datagram payload.
    pub fn encode(&self) -> Bytes {
        match self {
            DatagramMessage::CloseSession => {
                Bytes::from_static(&[Self::MARKER, Self::CODE_CLOSE_SESSION])
            }
        }
    }

    /// Decode a control envelope.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        match payload {
            [Self::MARKER, Self::CODE_CLOSE_SESSION] => Ok(DatagramMessage::CloseSession),
            _ => Err(Error::invalid("unknown datagram message")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_roundtrip() {
        let request = Request::StreamProxyChannel(StreamProxyRequest {
            session: SessionRequest {
                request_id: "r-1".into(),
                session_id: 42,
                session_key: "00".repeat(16),
            },
            destination: "198.51.100.7:443".parse().unwrap(),
        });

        let mut buf = Vec::new();
        write_message(&mut buf, &request).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let parsed: Request = read_message(&mut cursor).await.unwrap();
        match parsed {
            Request::StreamProxyChannel(r) => {
                assert_eq!(r.session.session_id, 42);
                assert_eq!(r.destination.port(), 443);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_code_tag_on_wire() {
        let request = Request::Bye(SessionRequest {
            request_id: "r-2".into(),
            session_id: 1,
            session_key: String::new(),
        });
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"request_code\":\"Bye\""), "{json}");
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let mut buf = BytesMut::new();
        put_frame(&mut buf, b"alpha").unwrap();
        put_frame(&mut buf, b"").unwrap();
        put_frame(&mut buf, b"omega").unwrap();

        let mut cursor = std::io::Cursor::new(buf.freeze().to_vec());
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), "alpha");
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), "");
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), "omega");
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        // Header claims 10 bytes, body carries 3.
        let mut data = vec![0u8, 10];
        data.extend_from_slice(b"abc");
        let mut cursor = std::io::Cursor::new(data);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[test]
    fn test_udp_header_roundtrip() {
        let header = UdpDatagramHeader {
            session_id: 0xDEAD_BEEF_1234_5678,
            sequence: 99,
            flags: UDP_FLAG_SERVER_TO_CLIENT,
        };
        let encoded = header.encode();
        assert_eq!(UdpDatagramHeader::decode(&encoded).unwrap(), header);
        assert!(UdpDatagramHeader::decode(&encoded[..10]).is_err());
    }

    #[test]
    fn test_datagram_message_envelope() {
        let msg = DatagramMessage::CloseSession.encode();
        assert!(DatagramMessage::matches(&msg));
        assert_eq!(
            DatagramMessage::decode(&msg).unwrap(),
            DatagramMessage::CloseSession
        );

        // An IPv4 packet never matches the envelope.
        let ipv4_like = [0x45u8, 0x00, 0x00, 0x14];
        assert!(!DatagramMessage::matches(&ipv4_like));
    }
}
