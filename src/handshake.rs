//! Streaming decoder for the varint-framed handshake
//!
//! Every packet on the wire is `length (varint) | packet id (varint) | body`.
//! The first packet of a connection is the handshake:
//!
//! ```text
//! protocol version (varint) | host (varint-prefixed UTF-8) | port (u16) | next state (varint)
//! ```
//!
//! The decoder accumulates bytes from successive reads and never discards
//! them: the proxy replays exactly what the client sent once a backend is
//! chosen. Frame boundaries are remembered so a packet is parsed at most once
//! however many fragments it arrives in.

use crate::error::{HandshakeError, ProtocolError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A varint may use at most this many bytes
pub const MAX_VARINT_LEN: usize = 5;

/// Largest frame the protocol allows (3-byte length prefix)
pub const MAX_PACKET_LEN: usize = 2_097_151;

/// Host field limit: 255 characters, up to 4 bytes each
pub const MAX_HOST_LEN: usize = 255 * 4;

/// Player name limit: 16 characters, up to 4 bytes each
pub const MAX_NAME_LEN: usize = 16 * 4;

/// Next-state value requesting a status ping
pub const STATE_STATUS: i32 = 1;
/// Next-state value requesting a login
pub const STATE_LOGIN: i32 = 2;
/// Next-state value for a server transfer (treated like login)
pub const STATE_TRANSFER: i32 = 3;

/// First byte of the pre-netty server list ping, which is not varint framed
const LEGACY_PING: u8 = 0xFE;

const READ_CHUNK: usize = 1024;

/// Decode a varint from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` ends before the varint does.
pub fn read_varint(buf: &[u8]) -> Result<Option<(i32, usize)>, ProtocolError> {
    let mut value: u32 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(ProtocolError::VarIntTooLong);
        }
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value as i32, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        return Err(ProtocolError::VarIntTooLong);
    }
    Ok(None)
}

/// Append `value` as a varint
pub fn write_varint(out: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7f == 0 {
            out.push(v as u8);
            return;
        }
        out.push((v & 0x7f) as u8 | 0x80);
        v >>= 7;
    }
}

/// Append a varint-prefixed UTF-8 string
pub fn write_string(out: &mut Vec<u8>, s: &str) {
    write_varint(out, s.len() as i32);
    out.extend_from_slice(s.as_bytes());
}

/// Append a complete frame: length prefix, packet id, body
pub fn write_packet(out: &mut Vec<u8>, id: i32, body: &[u8]) {
    let mut head = Vec::with_capacity(MAX_VARINT_LEN);
    write_varint(&mut head, id);
    write_varint(out, (head.len() + body.len()) as i32);
    out.extend_from_slice(&head);
    out.extend_from_slice(body);
}

/// Encode a handshake packet the way a client sends it
pub fn encode_handshake(protocol_version: i32, host: &str, port: u16, next_state: i32) -> Vec<u8> {
    let mut body = Vec::with_capacity(host.len() + 16);
    write_varint(&mut body, protocol_version);
    write_string(&mut body, host);
    body.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut body, next_state);

    let mut out = Vec::with_capacity(body.len() + 8);
    write_packet(&mut out, 0x00, &body);
    out
}

/// Encode a Login Start packet (name only; newer clients append a UUID)
pub fn encode_login_start(name: &str) -> Vec<u8> {
    let mut body = Vec::new();
    write_string(&mut body, name);
    let mut out = Vec::new();
    write_packet(&mut out, 0x00, &body);
    out
}

/// Locate the frame at the front of `buf`.
///
/// Returns `(header_len, body_len)` once the length prefix is complete.
fn frame_bounds(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let Some((len, header)) = read_varint(buf)? else {
        return Ok(None);
    };
    if len < 0 {
        return Err(ProtocolError::NegativeLength(len));
    }
    let len = len as usize;
    if len > MAX_PACKET_LEN {
        return Err(ProtocolError::PacketTooLarge {
            len,
            max: MAX_PACKET_LEN,
        });
    }
    Ok(Some((header, len)))
}

/// Cursor over the body of one complete packet
struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn varint(&mut self) -> Result<i32, ProtocolError> {
        // Inside a complete frame, running out of bytes is a framing violation
        match read_varint(&self.data[self.pos..])? {
            Some((value, len)) => {
                self.pos += len;
                Ok(value)
            }
            None => Err(ProtocolError::Truncated),
        }
    }

    fn string(&mut self, max: usize) -> Result<String, ProtocolError> {
        let len = self.varint()?;
        if len < 0 {
            return Err(ProtocolError::NegativeLength(len));
        }
        let len = len as usize;
        if len > max {
            return Err(ProtocolError::StringTooLong { len, max });
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(len).ok_or(ProtocolError::Truncated)?;
        if end > self.data.len() {
            return Err(ProtocolError::Truncated);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

/// A complete packet split off the buffered stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub body: Vec<u8>,
}

impl Packet {
    /// Decode the first body field as a varint-prefixed string
    pub fn leading_string(&self, max: usize) -> Result<String, ProtocolError> {
        PacketReader::new(&self.body).string(max)
    }
}

/// The routing-relevant contents of a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Client protocol version
    pub protocol_version: i32,
    /// Host exactly as the client sent it
    pub host: String,
    /// Port the client connected to (not used for routing)
    pub port: u16,
    /// Requested next state (1 = status, 2 = login, 3 = transfer)
    pub next_state: i32,
    /// Length of the handshake frame in bytes, length prefix included
    pub consumed: usize,
}

impl Handshake {
    /// The host after normalization, ready for route lookup
    pub fn normalized_host(&self) -> String {
        normalize_host(&self.host)
    }

    /// Whether the client intends to log in (as opposed to pinging)
    pub fn is_login(&self) -> bool {
        self.next_state == STATE_LOGIN || self.next_state == STATE_TRANSFER
    }
}

/// The identity a client presents when logging in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    pub name: String,
}

/// Accumulates client bytes and splits them into packets
#[derive(Debug, Default)]
pub struct HandshakeDecoder {
    buf: Vec<u8>,
    /// Start of the first packet not yet handed out
    cursor: usize,
    /// Bounds of the frame at `cursor`, once its length prefix is known
    pending: Option<(usize, usize)>,
    handshake: Option<Handshake>,
}

impl HandshakeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Every byte received so far, unmodified
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_buffered(self) -> Vec<u8> {
        self.buf
    }

    /// The decoded handshake, if one has been recognized
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// Split the next complete packet off the buffer.
    ///
    /// `Ok(None)` means more data is needed; it is not an error.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        if self.cursor == 0 && self.buf.first() == Some(&LEGACY_PING) {
            return Err(ProtocolError::UnexpectedPacket(i32::from(LEGACY_PING)));
        }

        let (header, len) = match self.pending {
            Some(bounds) => bounds,
            None => match frame_bounds(&self.buf[self.cursor..])? {
                Some(bounds) => {
                    self.pending = Some(bounds);
                    bounds
                }
                None => return Ok(None),
            },
        };

        let rest = &self.buf[self.cursor..];
        if rest.len() < header + len {
            return Ok(None);
        }

        let frame = &rest[header..header + len];
        let mut reader = PacketReader::new(frame);
        let id = reader.varint()?;
        let body = frame[reader.pos..].to_vec();

        self.cursor += header + len;
        self.pending = None;
        Ok(Some(Packet { id, body }))
    }

    /// Decode the handshake from the front of the stream.
    ///
    /// Once decoded, later calls return the same result without re-parsing.
    pub fn decode(&mut self) -> Result<Option<Handshake>, ProtocolError> {
        if let Some(handshake) = &self.handshake {
            return Ok(Some(handshake.clone()));
        }

        let Some(packet) = self.next_packet()? else {
            return Ok(None);
        };
        if packet.id != 0x00 {
            return Err(ProtocolError::UnexpectedPacket(packet.id));
        }

        let mut reader = PacketReader::new(&packet.body);
        let protocol_version = reader.varint()?;
        let host = reader.string(MAX_HOST_LEN)?;
        let port = reader.u16()?;
        let next_state = reader.varint()?;

        let handshake = Handshake {
            protocol_version,
            host,
            port,
            next_state,
            consumed: self.cursor,
        };
        self.handshake = Some(handshake.clone());
        Ok(Some(handshake))
    }

    /// Decode the Login Start packet that follows a login handshake
    pub fn decode_login_start(&mut self) -> Result<Option<LoginStart>, ProtocolError> {
        let Some(packet) = self.next_packet()? else {
            return Ok(None);
        };
        if packet.id != 0x00 {
            return Err(ProtocolError::UnexpectedPacket(packet.id));
        }
        let mut reader = PacketReader::new(&packet.body);
        let name = reader.string(MAX_NAME_LEN)?;
        Ok(Some(LoginStart { name }))
    }
}

/// Normalize a requested host for route lookup.
///
/// Anything after a NUL (mod loader markers) is dropped, then whitespace is
/// trimmed and the host lowercased. One trailing root dot goes next, then a
/// `:port` suffix, then one leading `www.` label. A root dot in front of the
/// port (`example.com.:25565`) counts as the trailing dot.
pub fn normalize_host(raw: &str) -> String {
    let raw = raw.split('\0').next().unwrap_or_default();
    let mut host = raw.trim().to_lowercase();

    let root_dot = host.ends_with('.');
    if root_dot {
        host.pop();
    }

    if let Some((name, port)) = host.rsplit_once(':') {
        if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
            let keep = name.len();
            host.truncate(keep);
            if !root_dot && host.ends_with('.') {
                host.pop();
            }
        }
    }

    if let Some(rest) = host.strip_prefix("www.") {
        host = rest.to_string();
    }

    host
}

/// Read from `stream` until the decoder yields a handshake
pub async fn read_handshake<R>(
    stream: &mut R,
    decoder: &mut HandshakeDecoder,
) -> Result<Handshake, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(handshake) = decoder.decode()? {
            return Ok(handshake);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::Closed {
                buffered: decoder.buffered().len(),
            });
        }
        decoder.feed(&chunk[..n]);
    }
}

/// Read from `stream` until the decoder yields a Login Start packet
pub async fn read_login_start<R>(
    stream: &mut R,
    decoder: &mut HandshakeDecoder,
) -> Result<LoginStart, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(login) = decoder.decode_login_start()? {
            return Ok(login);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::Closed {
                buffered: decoder.buffered().len(),
            });
        }
        decoder.feed(&chunk[..n]);
    }
}

/// Read from `stream` until the decoder yields any complete packet
pub async fn read_packet<R>(stream: &mut R, decoder: &mut HandshakeDecoder) -> Result<Packet, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(packet) = decoder.next_packet()? {
            return Ok(packet);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::Closed {
                buffered: decoder.buffered().len(),
            });
        }
        decoder.feed(&chunk[..n]);
    }
}

/// Bound a handshake read by `limit`, if one is configured
pub async fn with_deadline<T, F>(limit: Option<Duration>, fut: F) -> Result<T, HandshakeError>
where
    F: std::future::Future<Output = Result<T, HandshakeError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| HandshakeError::Timeout(limit))?,
        None => fut.await,
    }
}
