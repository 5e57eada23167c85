//! WebSocket frame codec (RFC 6455 Section 5.2-5.3).
//!
//! The syntactic half of frame parsing lives here: everything that can be
//! decided from a single header in isolation (reserved bits, opcode range,
//! control-frame size and FIN, length encodings). Checks that depend on the
//! connection's state (negotiated compression, fragmentation, masking role,
//! read limit) are made by [`crate::Connection`].
//!
//! - [`read_header`]: Parse a frame header from a byte stream
//! - [`encode_frame`]: Serialize a complete frame, masked or not
//! - [`read_frame`]: Whole-frame reader for raw peers
//! - [`apply_mask`]: Symmetric XOR masking per RFC 6455 Section 5.3

use std::io::Read;

use crate::error::WsError;

/// Largest possible frame header: 2 bytes + 8-byte length + 4-byte mask.
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Maximum control frame payload (RFC 6455 Section 5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Cap for [`read_frame`], which buffers whole frames.
const MAX_WHOLE_FRAME: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Parse a 4-bit opcode value. Reserved opcodes are a protocol error.
    pub fn from_u8(byte: u8) -> Result<OpCode, WsError> {
        match byte {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(WsError::protocol(format!("unknown opcode 0x{:X}", byte))),
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Text or binary: an opcode that starts a data message.
    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

/// Which end of the connection we are. Clients mask, servers do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

/// A whole frame with its payload already unmasked.
#[derive(Debug)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

/// XOR `payload` with `key`, starting at key position `pos`. Returns the
/// key position for the byte following `payload`, so a payload that arrives
/// in several reads can be unmasked piecewise.
pub fn apply_mask_at(payload: &mut [u8], key: &[u8; 4], pos: usize) -> usize {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[(pos + i) & 3];
    }
    (pos + payload.len()) & 3
}

/// Apply or remove the 4-byte XOR mask on a whole payload.
pub fn apply_mask(payload: &mut [u8], key: &[u8; 4]) {
    apply_mask_at(payload, key, 0);
}

/// Parse one frame header.
pub fn read_header<R: Read>(reader: &mut R) -> Result<FrameHeader, WsError> {
    // Byte 0: FIN(1) RSV1(1) RSV2(1) RSV3(1) Opcode(4)
    // Byte 1: MASK(1) Payload-Length(7)
    let mut head = [0u8; 2];
    reader.read_exact(&mut head)?;

    let fin = head[0] & 0x80 != 0;
    let rsv1 = head[0] & 0x40 != 0;
    if head[0] & 0x30 != 0 {
        return Err(WsError::protocol("RSV2 or RSV3 set"));
    }
    let opcode = OpCode::from_u8(head[0] & 0x0F)?;

    let masked = head[1] & 0x80 != 0;
    let payload_len = match head[1] & 0x7F {
        126 => {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf)?;
            u16::from_be_bytes(buf) as u64
        }
        127 => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            let len = u64::from_be_bytes(buf);
            if len >> 63 != 0 {
                return Err(WsError::protocol("MSB of 64-bit length set"));
            }
            len
        }
        n => n as u64,
    };

    if opcode.is_control() {
        if !fin {
            return Err(WsError::protocol("fragmented control frame"));
        }
        if payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(WsError::protocol("control frame length > 125"));
        }
    }

    let mask = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key)?;
        Some(key)
    } else {
        None
    };

    Ok(FrameHeader {
        fin,
        rsv1,
        opcode,
        mask,
        payload_len,
    })
}

/// Append a frame header to `out`.
pub fn encode_header(
    out: &mut Vec<u8>,
    opcode: OpCode,
    fin: bool,
    rsv1: bool,
    mask: Option<[u8; 4]>,
    len: usize,
) {
    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    if rsv1 {
        b0 |= 0x40;
    }
    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    out.push(b0);
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    if let Some(key) = mask {
        out.extend_from_slice(&key);
    }
}

/// Serialize a complete frame. When `mask` is given the payload is masked
/// in the output; `payload` itself is left untouched.
pub fn encode_frame(
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    rsv1: bool,
    mask: Option<[u8; 4]>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_FRAME_HEADER_SIZE + payload.len());
    encode_header(&mut out, opcode, fin, rsv1, mask, payload.len());
    let start = out.len();
    out.extend_from_slice(payload);
    if let Some(key) = mask {
        apply_mask(&mut out[start..], &key);
    }
    out
}

/// Read one whole frame, unmasking it if needed. Only syntactic checks are
/// applied; this is the raw-peer path used by tests.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, WsError> {
    let header = read_header(reader)?;
    if header.payload_len > MAX_WHOLE_FRAME {
        return Err(WsError::ReadLimit);
    }
    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload)?;
    if let Some(key) = header.mask {
        apply_mask(&mut payload, &key);
    }
    Ok(Frame {
        fin: header.fin,
        rsv1: header.rsv1,
        opcode: header.opcode,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn mask_is_symmetric_and_resumable() {
        let original = b"Hello, masked world".to_vec();
        let key = [0x37, 0xfa, 0x21, 0x3d];

        let mut whole = original.clone();
        apply_mask(&mut whole, &key);
        assert_ne!(whole, original);

        let mut pieces = original.clone();
        let (a, b) = pieces.split_at_mut(7);
        let pos = apply_mask_at(a, &key, 0);
        assert_eq!(pos, 3);
        apply_mask_at(b, &key, pos);
        assert_eq!(pieces, whole);

        apply_mask(&mut whole, &key);
        assert_eq!(whole, original);
    }

    #[test]
    fn read_masked_text_frame() {
        let mut bytes = vec![0x81, 0x82, 1, 2, 3, 4];
        bytes.extend_from_slice(&[b'H' ^ 1, b'i' ^ 2]);
        let frame = read_frame(&mut Cursor::new(bytes)).unwrap();
        assert!(frame.fin);
        assert!(!frame.rsv1);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload, b"Hi");
    }

    #[test]
    fn read_extended_lengths() {
        let mut bytes = vec![0x82, 126];
        bytes.extend_from_slice(&200u16.to_be_bytes());
        bytes.extend_from_slice(&[0xAB; 200]);
        let frame = read_frame(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(frame.payload.len(), 200);

        let mut bytes = vec![0x02, 127];
        bytes.extend_from_slice(&70_000u64.to_be_bytes());
        let header = read_header(&mut Cursor::new(bytes)).unwrap();
        assert!(!header.fin);
        assert_eq!(header.payload_len, 70_000);
        assert_eq!(header.mask, None);
    }

    #[test]
    fn rejects_64bit_length_with_msb() {
        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&(1u64 << 63).to_be_bytes());
        let err = read_header(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, WsError::Protocol(_)));
    }

    #[test]
    fn rejects_reserved_bits_and_opcodes() {
        // RSV2
        let err = read_header(&mut Cursor::new(vec![0xA1, 0x00])).unwrap_err();
        assert!(matches!(err, WsError::Protocol(_)));
        // RSV3
        let err = read_header(&mut Cursor::new(vec![0x91, 0x00])).unwrap_err();
        assert!(matches!(err, WsError::Protocol(_)));
        // opcode 0x3
        let err = read_header(&mut Cursor::new(vec![0x83, 0x00])).unwrap_err();
        assert!(err.to_string().contains("unknown opcode"));
        // RSV1 alone is syntactically fine; the connection decides.
        let header = read_header(&mut Cursor::new(vec![0xC1, 0x00])).unwrap();
        assert!(header.rsv1);
    }

    #[test]
    fn control_frame_rules() {
        // ping without FIN
        let err = read_header(&mut Cursor::new(vec![0x09, 0x00])).unwrap_err();
        assert!(err.to_string().contains("fragmented control"));
        // ping with 126-byte payload
        let mut bytes = vec![0x89, 126];
        bytes.extend_from_slice(&126u16.to_be_bytes());
        let err = read_header(&mut Cursor::new(bytes)).unwrap_err();
        assert!(err.to_string().contains("> 125"));
        // 125 is allowed
        let header = read_header(&mut Cursor::new(vec![0x8A, 125])).unwrap();
        assert_eq!(header.opcode, OpCode::Pong);
    }

    #[test]
    fn encode_uses_shortest_length() {
        assert_eq!(
            encode_frame(OpCode::Text, b"Hello", true, false, None),
            vec![0x81, 0x05, b'H', b'e', b'l', b'l', b'o']
        );

        let out = encode_frame(OpCode::Binary, &[0x42; 200], false, true, None);
        assert_eq!(out[0], 0x42);
        assert_eq!(out[1], 126);
        assert_eq!(&out[2..4], &200u16.to_be_bytes());

        let out = encode_frame(OpCode::Binary, &vec![0; 70_000], true, false, None);
        assert_eq!(out[1], 127);
        assert_eq!(&out[2..10], &70_000u64.to_be_bytes());
        assert_eq!(out.len(), 10 + 70_000);
    }

    #[test]
    fn masked_encode_reads_back() {
        let out = encode_frame(OpCode::Text, b"payload", true, false, Some([9, 8, 7, 6]));
        assert_eq!(out[1] & 0x80, 0x80);
        assert_ne!(&out[6..], b"payload");
        let frame = read_frame(&mut Cursor::new(out)).unwrap();
        assert_eq!(frame.payload, b"payload");
    }

    #[test]
    fn truncated_header_is_io_eof() {
        let err = read_header(&mut Cursor::new(vec![0x81])).unwrap_err();
        assert!(err.is_eof());
    }
}
