//! Frame codec for the browser terminal protocol.
//!
//! Wire format (client to server): `[discriminant byte][base64 payload]`

use crate::error::WebsshResult;
use crate::messages::{ClientFrame, MsgType, ResizeCommand};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::warn;

/// Decode a base64 payload.
///
/// Malformed input is tolerated: a warning is logged and an empty buffer
/// is returned.
pub fn decode(payload: &[u8]) -> Vec<u8> {
    match STANDARD.decode(payload) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, len = payload.len(), "malformed base64 payload, dropping");
            Vec::new()
        }
    }
}

/// Base64-encode a payload.
pub fn encode(data: &[u8]) -> Vec<u8> {
    STANDARD.encode(data).into_bytes()
}

/// Build an inbound message: discriminant followed by the encoded payload.
pub fn encode_frame(kind: MsgType, data: &[u8]) -> Vec<u8> {
    let encoded = encode(data);
    let mut frame = Vec::with_capacity(1 + encoded.len());
    frame.push(kind.as_byte());
    frame.extend(encoded);
    frame
}

/// Build a resize message.
pub fn encode_resize(cmd: &ResizeCommand) -> WebsshResult<Vec<u8>> {
    let json = serde_json::to_vec(cmd)?;
    Ok(encode_frame(MsgType::Resize, &json))
}

/// Split and decode an inbound message.
///
/// Only a resize payload that is not valid JSON is an error.
pub fn parse_frame(msg: &[u8]) -> WebsshResult<ClientFrame> {
    let Some((&tag, rest)) = msg.split_first() else {
        return Ok(ClientFrame::Empty);
    };

    match MsgType::from_byte(tag) {
        Some(MsgType::Data) => Ok(ClientFrame::Data(decode(rest))),
        Some(MsgType::Resize) => {
            let body = decode(rest);
            let cmd: ResizeCommand = serde_json::from_slice(&body)?;
            Ok(ClientFrame::Resize(cmd))
        }
        None => Ok(ClientFrame::Unknown(tag)),
    }
}
