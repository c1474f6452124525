//! Token - out-of-band address of a producer stream
//!
//! A token binds a subscriber to one stream id on one producer endpoint.
//! It has a fixed 28-byte binary layout and a URL-safe base64 text form
//! so it can be handed to another process through any side channel.
//!
//! ```text
//! offset  size  field
//!      0     8  stream_id      (u64, little endian)
//!      8     2  port           (u16, little endian)
//!     10     1  protocol       (0 = tcp)
//!     11     1  address_type   (4 = IPv4, 6 = IPv6)
//!     12    16  address        (IPv4 uses the first 4 bytes)
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::StreamingError;

/// Stream identifier, unique per dispatcher and assigned from 1
pub type StreamId = u64;

/// Size of the binary token layout
pub const TOKEN_SIZE: usize = 28;

const PROTOCOL_TCP: u8 = 0;
const ADDRESS_V4: u8 = 4;
const ADDRESS_V6: u8 = 6;

/// Address of a stream: producer endpoint plus stream id.
///
/// Tokens are plain values. They carry no ownership and stay valid only for
/// the lifetime of the server that issued them.
///
/// # Examples
/// ```
/// use contracts::Token;
///
/// let token = Token::new("127.0.0.1:2000".parse().unwrap(), 7);
/// let text = token.to_string();
/// let parsed: Token = text.parse().unwrap();
/// assert_eq!(parsed, token);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    endpoint: SocketAddr,
    stream_id: StreamId,
}

impl Token {
    /// Create a token for `stream_id` served at `endpoint`
    ///
    /// The binary layout has no room for an IPv6 scope id or flow label, so
    /// both are cleared here and every token survives encoding unchanged.
    pub fn new(endpoint: SocketAddr, stream_id: StreamId) -> Self {
        let endpoint = match endpoint {
            SocketAddr::V6(addr) => {
                SocketAddr::V6(SocketAddrV6::new(*addr.ip(), addr.port(), 0, 0))
            }
            v4 => v4,
        };
        Self {
            endpoint,
            stream_id,
        }
    }

    /// Producer endpoint to connect to
    #[inline]
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Stream id to request in the handshake
    #[inline]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Encode into the fixed binary layout
    pub fn to_bytes(&self) -> [u8; TOKEN_SIZE] {
        let mut out = [0u8; TOKEN_SIZE];
        let mut buf = &mut out[..];
        buf.put_u64_le(self.stream_id);
        buf.put_u16_le(self.endpoint.port());
        buf.put_u8(PROTOCOL_TCP);
        match self.endpoint.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(ADDRESS_V4);
                buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(ADDRESS_V6);
                buf.put_slice(&ip.octets());
            }
        }
        out
    }

    /// Decode from the fixed binary layout
    ///
    /// # Errors
    /// Wrong length, unknown protocol or unknown address type.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StreamingError> {
        if bytes.len() != TOKEN_SIZE {
            return Err(StreamingError::invalid_token(format!(
                "expected {} bytes, got {}",
                TOKEN_SIZE,
                bytes.len()
            )));
        }

        let mut buf = bytes;
        let stream_id = buf.get_u64_le();
        let port = buf.get_u16_le();
        let protocol = buf.get_u8();
        let address_type = buf.get_u8();
        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets);

        if protocol != PROTOCOL_TCP {
            return Err(StreamingError::invalid_token(format!(
                "unsupported protocol {protocol}"
            )));
        }

        let ip = match address_type {
            ADDRESS_V4 => IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3])),
            ADDRESS_V6 => IpAddr::V6(Ipv6Addr::from(octets)),
            other => {
                return Err(StreamingError::invalid_token(format!(
                    "unknown address type {other}"
                )))
            }
        };

        Ok(Self::new(SocketAddr::new(ip, port), stream_id))
    }

    /// Encode into the text form (URL-safe base64, no padding)
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_bytes())
    }

    /// Decode from the text form
    pub fn decode(text: &str) -> Result<Self, StreamingError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(text.trim())
            .map_err(|e| StreamingError::invalid_token(format!("base64: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}#{})", self.endpoint, self.stream_id)
    }
}

impl FromStr for Token {
    type Err = StreamingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for Token {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(serde::de::Error::custom)
    }
}
