//! Close codes and close frame payloads (RFC 6455 Section 5.5.1, 7.4).

use crate::error::{CloseError, WsError};

/// Well-known WebSocket close status codes.
pub struct CloseCode;

impl CloseCode {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// Never sent on the wire; stands for "no status code present".
    pub const NO_STATUS: u16 = 1005;
    /// Reserved by the RFC for "closed without a close frame". The gateway
    /// still sends it on abnormal termination so clients see the cause text.
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_DATA: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const MANDATORY_EXTENSION: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const SERVICE_RESTART: u16 = 1012;
    pub const TRY_AGAIN_LATER: u16 = 1013;
}

/// Longest close reason that fits a control frame after the 2-byte code.
pub const MAX_CLOSE_REASON: usize = 123;

/// Codes a peer is allowed to put in a close frame.
pub fn is_valid_received_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1013 | 3000..=4999)
}

/// Parse a received close payload.
///
/// An empty payload means 1005 (no status). A one-byte payload, an invalid
/// code, or a reason that is not UTF-8 is a protocol error.
pub fn parse_close_payload(payload: &[u8]) -> Result<CloseError, WsError> {
    match payload.len() {
        0 => Ok(CloseError {
            code: CloseCode::NO_STATUS,
            text: String::new(),
        }),
        1 => Err(WsError::protocol("close payload of one byte")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_received_code(code) {
                return Err(WsError::protocol(format!("invalid close code {}", code)));
            }
            let text = std::str::from_utf8(&payload[2..])
                .map_err(|_| WsError::protocol("invalid utf8 in close reason"))?;
            Ok(CloseError {
                code,
                text: text.to_string(),
            })
        }
    }
}

/// Truncate `reason` to at most `max` bytes on a char boundary.
pub fn truncate_reason(reason: &str, max: usize) -> &str {
    if reason.len() <= max {
        return reason;
    }
    let mut end = max;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// Build `[code:u16be][reason]`, keeping the whole payload within 125 bytes.
/// 1005 produces an empty payload since it must not appear on the wire.
pub fn build_close_payload(code: u16, reason: &str) -> Vec<u8> {
    if code == CloseCode::NO_STATUS {
        return Vec::new();
    }
    let reason = truncate_reason(reason, MAX_CLOSE_REASON);
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}
