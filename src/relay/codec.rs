//! Pure binary framing for the relay wire protocol. No I/O, no state.
//!
//! Every frame begins with a 1-byte protocol version followed by a 1-byte
//! message type. Layout per type is documented on each `marshal_*`
//! function.

use ring::digest;

use crate::relay::error::{Error, Result};

/// SHA-256(PeerId); 32 bytes. Printable form is the lowercase hex of the
/// hash.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct HashedId(pub [u8; 32]);

impl HashedId {
    pub const LENGTH: usize = 32;

    /// `HashedStringId = hex(SHA256(PeerID))`.
    pub fn hash(peer_id: &str) -> Self {
        let digest = digest::digest(&digest::SHA256, peer_id.as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(digest.as_ref());
        HashedId(out)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LENGTH {
            return Err(Error::MalformedFrame("hashed id too short"));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&buf[..Self::LENGTH]);
        Ok(HashedId(out))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for HashedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HashedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HashedId({self})")
    }
}

/// Message type tag, the second byte of every frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum MsgType {
    Hello = 0,
    HelloResponse = 1,
    Transport = 2,
    Close = 3,
    HealthCheck = 4,
}

impl MsgType {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(MsgType::Hello),
            1 => Ok(MsgType::HelloResponse),
            2 => Ok(MsgType::Transport),
            3 => Ok(MsgType::Close),
            4 => Ok(MsgType::HealthCheck),
            _ => Err(Error::MalformedFrame("unknown message type")),
        }
    }
}

/// Index of the version byte.
const VERSION_IDX: usize = 0;
/// Index of the type byte.
const TYPE_IDX: usize = 1;
/// Size of the version+type header every frame carries.
const HEADER_LEN: usize = 2;

/// Largest payload a `Transport` frame can carry without the marshaled
/// frame exceeding [`crate::relay::BUFFER_SIZE`].
pub const MAX_TRANSPORT_PAYLOAD: usize =
    crate::relay::BUFFER_SIZE - HEADER_LEN - HashedId::LENGTH;

/// `Hello ::= HashedID[32] ++ AuthTokenLen[u16 BE] ++ AuthToken`
pub fn marshal_hello(version: u8, id: &HashedId, token: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + HashedId::LENGTH + 2 + token.len());
    buf.push(version);
    buf.push(MsgType::Hello as u8);
    buf.extend_from_slice(id.as_bytes());
    buf.extend_from_slice(&(token.len() as u16).to_be_bytes());
    buf.extend_from_slice(token);
    buf
}

/// Parses a Hello frame's body, returning `(HashedId, AuthToken)`.
pub fn unmarshal_hello(buf: &[u8]) -> Result<(HashedId, &[u8])> {
    let body = &buf[HEADER_LEN..];
    if body.len() < HashedId::LENGTH + 2 {
        return Err(Error::MalformedFrame("hello frame too short"));
    }
    let id = HashedId::from_bytes(&body[..HashedId::LENGTH])?;
    let len_off = HashedId::LENGTH;
    let token_len = u16::from_be_bytes([body[len_off], body[len_off + 1]]) as usize;
    let token_start = len_off + 2;
    if body.len() < token_start + token_len {
        return Err(Error::MalformedFrame("hello token truncated"));
    }
    Ok((id, &body[token_start..token_start + token_len]))
}

/// `HelloResponse ::= InstanceURLLen[u16 BE] ++ InstanceURL (utf-8)`
pub fn marshal_hello_response(version: u8, url: &str) -> Vec<u8> {
    let bytes = url.as_bytes();
    let mut buf = Vec::with_capacity(HEADER_LEN + 2 + bytes.len());
    buf.push(version);
    buf.push(MsgType::HelloResponse as u8);
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    buf
}

pub fn unmarshal_hello_response(buf: &[u8]) -> Result<String> {
    let body = &buf[HEADER_LEN..];
    if body.len() < 2 {
        return Err(Error::MalformedFrame("hello response too short"));
    }
    let len = u16::from_be_bytes([body[0], body[1]]) as usize;
    if body.len() < 2 + len {
        return Err(Error::MalformedFrame("hello response url truncated"));
    }
    String::from_utf8(body[2..2 + len].to_vec())
        .map_err(|_| Error::MalformedFrame("hello response url not utf-8"))
}

/// `Transport ::= HashedID[32] ++ Payload[..]`
pub fn marshal_transport(version: u8, dst: &HashedId, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + HashedId::LENGTH + payload.len());
    buf.push(version);
    buf.push(MsgType::Transport as u8);
    buf.extend_from_slice(dst.as_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub fn marshal_healthcheck(version: u8) -> Vec<u8> {
    vec![version, MsgType::HealthCheck as u8]
}

pub fn marshal_close(version: u8) -> Vec<u8> {
    vec![version, MsgType::Close as u8]
}

/// Parses `(version, type)` from the header common to every frame.
fn determine_msg_type(buf: &[u8]) -> Result<(u8, MsgType)> {
    if buf.len() < HEADER_LEN {
        return Err(Error::MalformedFrame("frame shorter than header"));
    }
    let version = buf[VERSION_IDX];
    let ty = MsgType::from_byte(buf[TYPE_IDX])?;
    Ok((version, ty))
}

/// Server-side dispatch: a server reads Hello/Transport/Close/HealthCheck
/// frames from a client. There is no distinct set of "server message
/// types" vs "client message types" on the wire (both sides share the
/// same five tags); the two entry points exist so each side's call sites
/// read as "the type of message I expect to receive here".
pub fn determine_client_msg_type(buf: &[u8]) -> Result<(u8, MsgType)> {
    determine_msg_type(buf)
}

/// Client-side dispatch: mirrors [`determine_client_msg_type`], see above.
pub fn determine_server_msg_type(buf: &[u8]) -> Result<(u8, MsgType)> {
    determine_msg_type(buf)
}

/// Parses only the 32-byte destination out of a Transport frame, without
/// copying the payload. Used on the hot forwarding path.
pub fn unmarshal_transport_id(buf: &[u8]) -> Result<(u8, HashedId)> {
    if buf.len() < HEADER_LEN + HashedId::LENGTH {
        return Err(Error::MalformedFrame("transport frame too short"));
    }
    let version = buf[VERSION_IDX];
    let id = HashedId::from_bytes(&buf[HEADER_LEN..])?;
    Ok((version, id))
}

/// Returns `(HashedId, Payload)`, where `Payload` is a slice view into
/// `buf` — its lifetime is tied to the caller's buffer. The caller takes
/// ownership of deciding when that buffer may be reused (see
/// `relay::client::conn::PooledBuf`).
pub fn unmarshal_transport_msg(buf: &[u8]) -> Result<(HashedId, &[u8])> {
    let (_version, id) = unmarshal_transport_id(buf)?;
    let payload = &buf[HEADER_LEN + HashedId::LENGTH..];
    Ok((id, payload))
}

/// In-place rewrite of a Transport frame's 32-byte destination field.
/// Used by the server to substitute the origin's ID for the destination
/// before forwarding, avoiding a full copy on the hot path.
pub fn update_transport_msg(buf: &mut [u8], new_dst: &HashedId) -> Result<()> {
    if buf.len() < HEADER_LEN + HashedId::LENGTH {
        return Err(Error::MalformedFrame("transport frame too short to rewrite"));
    }
    buf[HEADER_LEN..HEADER_LEN + HashedId::LENGTH].copy_from_slice(new_dst.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashed_id_is_deterministic_sha256() {
        let a = HashedId::hash("peer-a");
        let b = HashedId::hash("peer-a");
        let c = HashedId::hash("peer-b");
        assert_eq!(a.0, b.0);
        assert_ne!(a.0, c.0);
    }

    #[test]
    fn hello_round_trips() {
        let id = HashedId::hash("peer-a");
        let token = b"sometoken";
        let buf = marshal_hello(1, &id, token);
        let (ver, ty) = determine_client_msg_type(&buf).unwrap();
        assert_eq!(ver, 1);
        assert_eq!(ty, MsgType::Hello);
        let (got_id, got_token) = unmarshal_hello(&buf).unwrap();
        assert_eq!(got_id.0, id.0);
        assert_eq!(got_token, token);
    }

    #[test]
    fn hello_response_round_trips() {
        let buf = marshal_hello_response(1, "rels://example.com:443");
        let (_, ty) = determine_server_msg_type(&buf).unwrap();
        assert_eq!(ty, MsgType::HelloResponse);
        let url = unmarshal_hello_response(&buf).unwrap();
        assert_eq!(url, "rels://example.com:443");
    }

    #[test]
    fn transport_round_trips_and_rewrites() {
        let src = HashedId::hash("alice");
        let dst = HashedId::hash("bob");
        let payload = b"hello bob";
        let mut buf = marshal_transport(1, &dst, payload);

        let (_, parsed_dst) = unmarshal_transport_id(&buf).unwrap();
        assert_eq!(parsed_dst.0, dst.0);

        let (parsed_dst2, parsed_payload) = unmarshal_transport_msg(&buf).unwrap();
        assert_eq!(parsed_dst2.0, dst.0);
        assert_eq!(parsed_payload, payload);

        update_transport_msg(&mut buf, &src).unwrap();
        let (_, rewritten_dst) = unmarshal_transport_id(&buf).unwrap();
        assert_eq!(rewritten_dst.0, src.0);
        // payload bytes are untouched by the rewrite
        let (_, payload_after) = unmarshal_transport_msg(&buf).unwrap();
        assert_eq!(payload_after, payload);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(determine_client_msg_type(&[1]).is_err());
        assert!(determine_client_msg_type(&[]).is_err());
        assert!(determine_client_msg_type(&[1, 200]).is_err());
        assert!(unmarshal_transport_id(&[1, 2, 0, 0]).is_err());
    }

    #[test]
    fn healthcheck_and_close_are_header_only() {
        let hc = marshal_healthcheck(1);
        assert_eq!(hc.len(), HEADER_LEN);
        let (_, ty) = determine_client_msg_type(&hc).unwrap();
        assert_eq!(ty, MsgType::HealthCheck);

        let close = marshal_close(1);
        assert_eq!(close.len(), HEADER_LEN);
        let (_, ty) = determine_client_msg_type(&close).unwrap();
        assert_eq!(ty, MsgType::Close);
    }

    #[test]
    fn max_payload_fits_buffer_size() {
        let dst = HashedId::hash("bob");
        let header_overhead = HEADER_LEN + HashedId::LENGTH;
        let max_payload = crate::relay::BUFFER_SIZE - header_overhead;
        let payload = vec![0xAB; max_payload];
        let buf = marshal_transport(1, &dst, &payload);
        assert_eq!(buf.len(), crate::relay::BUFFER_SIZE);
        let (_, parsed) = unmarshal_transport_msg(&buf).unwrap();
        assert_eq!(parsed.len(), max_payload);
    }
}
