//! Host-bridge envelope codec and framing.
//!
//! Messages between the hub runtime and host clients travel as a tagged
//! union encoded with numbered CBOR fields, so either side can add optional
//! fields without breaking the other. On the socket each envelope is
//! length-delimited: a little-endian `u32` body length followed by the body,
//! with the whole frame capped at [`MTU`].

use std::io::{self, Read, Write};

use minicbor::{Decode, Encode};
use thiserror::Error;

/// Maximum total frame size on the wire, length prefix included.
pub const MTU: usize = 4096;

/// Default name of the daemon's local socket.
pub const DEFAULT_SOCKET_NAME: &str = "chre";

/// Host endpoint sentinel meaning "no specific endpoint".
pub const HOST_ENDPOINT_UNSPECIFIED: u16 = 0xFFFE;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds the {MTU}-byte MTU")]
    FrameTooLarge(usize),
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Every envelope the bridge understands.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum HubMessage {
    #[n(0)]
    HubInfoRequest,
    #[n(1)]
    HubInfoResponse(#[n(0)] HubInfoResponse),
    #[n(2)]
    NanoappListRequest,
    #[n(3)]
    NanoappListResponse(#[n(0)] NanoappListResponse),
    #[n(4)]
    NanoappMessage(#[n(0)] NanoappMessage),
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct HubInfoResponse {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub vendor: String,
    #[n(2)]
    pub toolchain: String,
    #[n(3)]
    pub legacy_platform_version: u32,
    #[n(4)]
    pub legacy_toolchain_version: u32,
    #[n(5)]
    pub peak_mips: f32,
    #[n(6)]
    pub stopped_power_mw: f32,
    #[n(7)]
    pub sleep_power_mw: f32,
    #[n(8)]
    pub peak_power_mw: f32,
    #[n(9)]
    pub max_message_len: u32,
    #[n(10)]
    pub platform_id: u64,
    #[n(11)]
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct NanoappListEntry {
    #[n(0)]
    pub app_id: u64,
    #[n(1)]
    pub version: u32,
    #[n(2)]
    pub enabled: bool,
    #[n(3)]
    pub is_system: bool,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct NanoappListResponse {
    #[n(0)]
    pub entries: Vec<NanoappListEntry>,
}

/// Nanoapp traffic in either direction.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct NanoappMessage {
    #[n(0)]
    pub app_id: u64,
    #[n(1)]
    pub host_endpoint: u16,
    #[n(2)]
    pub message_type: u32,
    #[cbor(n(3), with = "minicbor::bytes")]
    pub payload: Vec<u8>,
}

/// Encodes a message into a length-delimited frame.
pub fn encode_frame(message: &HubMessage) -> Result<Vec<u8>, WireError> {
    let body = minicbor::to_vec(message).map_err(|err| WireError::Encode(err.to_string()))?;
    let total = body.len() + LENGTH_PREFIX;
    if total > MTU {
        return Err(WireError::FrameTooLarge(total));
    }
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes a frame body (the bytes after the length prefix).
pub fn decode_body(body: &[u8]) -> Result<HubMessage, WireError> {
    minicbor::decode(body).map_err(|err| WireError::Decode(err.to_string()))
}

/// Writes one framed message to a stream.
pub fn write_message(writer: &mut impl Write, message: &HubMessage) -> Result<(), WireError> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads one framed message from a stream. Returns `None` on a clean EOF at
/// a frame boundary.
pub fn read_message(reader: &mut impl Read) -> Result<Option<HubMessage>, WireError> {
    let mut prefix = [0u8; LENGTH_PREFIX];
    match reader.read_exact(&mut prefix) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let length = u32::from_le_bytes(prefix) as usize;
    if length + LENGTH_PREFIX > MTU {
        return Err(WireError::FrameTooLarge(length + LENGTH_PREFIX));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;
    decode_body(&body).map(Some)
}
