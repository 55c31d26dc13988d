//! WebSocket wire constants and validators (RFC 6455 Section 5.2, 7.4).
//!
//! Everything here is stateless: opcode decoding, header flag masks, payload
//! length limits, the close-code legality rule, and XOR masking.
//!
//! - [`Opcode`]: 4-bit frame type tag
//! - [`FrameHeader`]: one decoded frame header (payload excluded)
//! - [`Role`]: masking direction
//! - [`validate_close_code`]: close code legality per RFC 6455 Section 7.4
//! - [`apply_mask`] / [`toggle_mask`]: symmetric XOR masking

use crate::error::{Result, WsError};

/// Byte 0 flag for the final frame of a message.
pub const B0_FLAG_FIN: u8 = 0x80;
/// Byte 0 reserved flag RSV1.
pub const B0_FLAG_RSV1: u8 = 0x40;
/// Byte 0 reserved flag RSV2.
pub const B0_FLAG_RSV2: u8 = 0x20;
/// Byte 0 reserved flag RSV3.
pub const B0_FLAG_RSV3: u8 = 0x10;
/// Byte 0 mask selecting the opcode nibble.
pub const B0_MASK_OPCODE: u8 = 0x0F;
/// Opcode bit shared by every control opcode.
pub const OPCODE_FLAG_CONTROL: u8 = 0x08;

/// Byte 1 flag set when a 4-byte mask key follows the length.
pub const B1_FLAG_MASK: u8 = 0x80;
/// Byte 1 mask selecting the 7-bit length field.
pub const B1_MASK_LENGTH: u8 = 0x7F;

/// Largest payload a control frame may carry.
pub const PAYLOAD_BYTE_MAX: u64 = 125;
/// Largest close reason, leaving room for the 2-byte code.
pub const CLOSE_MESSAGE_MAX: usize = PAYLOAD_BYTE_MAX as usize - 2;
/// 7-bit length value announcing a 16-bit extended length.
pub const PAYLOAD_SHORT: u8 = 126;
/// Largest length encodable in the 16-bit form.
pub const PAYLOAD_SHORT_MAX: u64 = 0xFFFF;
/// 7-bit length value announcing a 64-bit extended length.
pub const PAYLOAD_LONG: u8 = 127;

/// WebSocket frame opcodes per RFC 6455 Section 5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Parse a 4-bit opcode value.
    ///
    /// Reserved opcodes (0x3-0x7, 0xB-0xF) are a protocol violation.
    pub fn from_u8(byte: u8) -> Result<Opcode> {
        match byte {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            _ => Err(WsError::protocol(format!("Unknown opcode: 0x{:X}", byte))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Control opcodes have the high bit of the nibble set.
    pub fn is_control(self) -> bool {
        self.as_u8() & OPCODE_FLAG_CONTROL != 0
    }
}

/// Which side of the connection we are. Clients mask what they send and
/// expect unmasked frames back; servers do the opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Well-known close status codes per RFC 6455 Section 7.4.1.
pub struct CloseCode;

impl CloseCode {
    /// Normal closure (1000).
    pub const NORMAL: u16 = 1000;
    /// Going away (1001). Sent automatically when the outgoing queue overflows.
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error (1002).
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// No status code was present in the peer's close frame (1005). Never sent.
    pub const NO_STATUS: u16 = 1005;
    /// Invalid frame payload data (1007).
    pub const INVALID_DATA: u16 = 1007;
    /// Message too big (1009).
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// Marker for "caller supplied no code"; never legal on the wire.
    pub const NONE: u16 = 0;
}

/// One decoded frame header. The payload itself is streamed separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload_len: u64,
    pub mask_key: Option<[u8; 4]>,
}

impl FrameHeader {
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Append the wire encoding of this header to `out`.
    ///
    /// Uses the shortest of the three length encodings. Payload lengths with
    /// the high bit set cannot be represented and are rejected.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        if self.payload_len >> 63 != 0 {
            return Err(WsError::InvalidArgument(format!(
                "payload length {} exceeds 0x7FFFFFFFFFFFFFFF",
                self.payload_len
            )));
        }
        if self.is_control() && self.payload_len > PAYLOAD_BYTE_MAX {
            return Err(WsError::InvalidArgument(format!(
                "control frame payload must be at most {PAYLOAD_BYTE_MAX} bytes"
            )));
        }

        let mut b0 = self.opcode.as_u8();
        if self.fin {
            b0 |= B0_FLAG_FIN;
        }
        out.push(b0);

        let mask_bit = if self.mask_key.is_some() { B1_FLAG_MASK } else { 0 };
        if self.payload_len <= PAYLOAD_BYTE_MAX {
            out.push(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= PAYLOAD_SHORT_MAX {
            out.push(mask_bit | PAYLOAD_SHORT);
            out.extend_from_slice(&(self.payload_len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | PAYLOAD_LONG);
            out.extend_from_slice(&self.payload_len.to_be_bytes());
        }

        if let Some(key) = self.mask_key {
            out.extend_from_slice(&key);
        }
        Ok(())
    }
}

/// Describe why `code` may not appear in a close frame, or `None` if legal.
///
/// Legal codes lie in [1000, 5000) outside the reserved values 1004-1006
/// and the reserved block 1012-2999.
pub fn close_code_error(code: u16) -> Option<String> {
    if !(1000..5000).contains(&code) {
        Some(format!("Code must be in range [1000,5000): {code}"))
    } else if (1004..=1006).contains(&code) || (1012..=2999).contains(&code) {
        Some(format!("Code {code} is reserved and may not be used."))
    } else {
        None
    }
}

/// Reject close codes that may not be sent or received on the wire.
pub fn validate_close_code(code: u16) -> Result<()> {
    match close_code_error(code) {
        Some(_) => Err(WsError::InvalidCloseCode(code)),
        None => Ok(()),
    }
}

/// Apply or remove a 4-byte XOR mask over a whole payload.
///
/// The operation is symmetric: applying the mask twice returns the original.
pub fn apply_mask(payload: &mut [u8], mask_key: &[u8; 4]) {
    toggle_mask(payload, mask_key, 0);
}

/// Mask a chunk that starts `offset` bytes into the frame payload.
///
/// Lets callers unmask a payload as it streams in without buffering the
/// whole frame first.
pub fn toggle_mask(chunk: &mut [u8], mask_key: &[u8; 4], offset: u64) {
    let start = (offset % 4) as usize;
    for (i, byte) in chunk.iter_mut().enumerate() {
        *byte ^= mask_key[(start + i) % 4];
    }
}
