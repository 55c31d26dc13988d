//! Frame reader (RFC 6455 Section 5.2-5.5).
//!
//! Decodes one frame per [`FrameReader::process_next_frame`] call and hands
//! the result to a [`FrameCallback`]. Control frames are delivered as soon as
//! they are read, even when they arrive between the fragments of a message;
//! message fragments are assembled into one buffer and delivered once the
//! final fragment arrives.
//!
//! After a close frame has been read the reader is closed and every further
//! call fails.

use std::io::{self, ErrorKind, Read};

use crate::error::{Result, WsError};
use crate::protocol::{
    close_code_error, toggle_mask, CloseCode, FrameHeader, Opcode, Role, B0_FLAG_FIN,
    B0_FLAG_RSV1, B0_FLAG_RSV2, B0_FLAG_RSV3, B0_MASK_OPCODE, B1_FLAG_MASK, B1_MASK_LENGTH,
    OPCODE_FLAG_CONTROL, PAYLOAD_BYTE_MAX, PAYLOAD_LONG, PAYLOAD_SHORT,
};

/// Payload bytes are pulled from the source in chunks of this size.
const READ_CHUNK: usize = 8192;

/// Receives everything the reader decodes.
pub trait FrameCallback {
    fn on_read_text(&mut self, text: String);
    fn on_read_binary(&mut self, bytes: Vec<u8>);
    fn on_read_ping(&mut self, payload: Vec<u8>);
    fn on_read_pong(&mut self, payload: Vec<u8>);
    /// `code` is [`CloseCode::NO_STATUS`] when the peer sent an empty close
    /// payload.
    fn on_read_close(&mut self, code: u16, reason: String);
}

/// Stateful frame decoder over a blocking byte source.
pub struct FrameReader<R> {
    role: Role,
    source: R,
    max_message_size: u64,
    closed: bool,
    /// Assembly buffer for the message currently being read.
    message: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    /// `role` is our side of the connection: a client reader rejects masked
    /// frames, a server reader rejects unmasked ones.
    pub fn new(role: Role, source: R, max_message_size: u64) -> Self {
        Self {
            role,
            source,
            max_message_size,
            closed: false,
            message: Vec::new(),
        }
    }

    /// True once the peer's close frame has been read.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read exactly one frame (or one complete message, with any interleaved
    /// control frames) and dispatch it to `callback`.
    pub fn process_next_frame<C: FrameCallback>(&mut self, callback: &mut C) -> Result<()> {
        let header = self.read_header()?;
        if header.is_control() {
            self.read_control_frame(header, callback)
        } else {
            self.read_message_frame(header, callback)
        }
    }

    fn read_header(&mut self) -> Result<FrameHeader> {
        if self.closed {
            return Err(io::Error::other("closed").into());
        }

        let mut head = [0u8; 2];
        self.source.read_exact(&mut head)?;

        let b0 = head[0];
        let opcode_bits = b0 & B0_MASK_OPCODE;
        let fin = b0 & B0_FLAG_FIN != 0;
        let is_control = opcode_bits & OPCODE_FLAG_CONTROL != 0;

        // Control frames may interleave with message fragments but are never
        // fragmented themselves.
        if is_control && !fin {
            return Err(WsError::protocol("Control frames must be final."));
        }
        if b0 & (B0_FLAG_RSV1 | B0_FLAG_RSV2 | B0_FLAG_RSV3) != 0 {
            return Err(WsError::protocol("Reserved flags are unsupported."));
        }
        let opcode = Opcode::from_u8(opcode_bits)?;

        let b1 = head[1];
        let masked = b1 & B1_FLAG_MASK != 0;
        match (self.role, masked) {
            (Role::Client, true) => {
                return Err(WsError::protocol("Server-sent frames must not be masked."))
            }
            (Role::Server, false) => {
                return Err(WsError::protocol("Client-sent frames must be masked."))
            }
            _ => {}
        }

        let payload_len = match b1 & B1_MASK_LENGTH {
            PAYLOAD_SHORT => {
                let mut buf = [0u8; 2];
                self.source.read_exact(&mut buf)?;
                u16::from_be_bytes(buf) as u64
            }
            PAYLOAD_LONG => {
                let mut buf = [0u8; 8];
                self.source.read_exact(&mut buf)?;
                let len = u64::from_be_bytes(buf);
                if len >> 63 != 0 {
                    return Err(WsError::protocol(format!(
                        "Frame length 0x{:X} > 0x7FFFFFFFFFFFFFFF",
                        len
                    )));
                }
                len
            }
            literal => literal as u64,
        };

        if is_control && payload_len > PAYLOAD_BYTE_MAX {
            return Err(WsError::protocol(format!(
                "Control frame must be less than {PAYLOAD_BYTE_MAX}B."
            )));
        }

        let mask_key = if masked {
            let mut key = [0u8; 4];
            self.source.read_exact(&mut key)?;
            Some(key)
        } else {
            None
        };

        Ok(FrameHeader {
            fin,
            opcode,
            payload_len,
            mask_key,
        })
    }

    /// Append the frame's payload to `buf`, unmasking as it streams in.
    fn read_payload(source: &mut R, header: &FrameHeader, buf: &mut Vec<u8>) -> Result<()> {
        let mut remaining = header.payload_len;
        let mut offset = 0u64;
        let mut chunk = [0u8; READ_CHUNK];

        while remaining > 0 {
            let want = remaining.min(READ_CHUNK as u64) as usize;
            let n = match source.read(&mut chunk[..want]) {
                Ok(0) => return Err(io::Error::from(ErrorKind::UnexpectedEof).into()),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if let Some(key) = header.mask_key {
                toggle_mask(&mut chunk[..n], &key, offset);
            }
            buf.extend_from_slice(&chunk[..n]);
            remaining -= n as u64;
            offset += n as u64;
        }
        Ok(())
    }

    fn read_control_frame<C: FrameCallback>(
        &mut self,
        header: FrameHeader,
        callback: &mut C,
    ) -> Result<()> {
        let mut payload = Vec::with_capacity(header.payload_len as usize);
        Self::read_payload(&mut self.source, &header, &mut payload)?;

        match header.opcode {
            Opcode::Ping => callback.on_read_ping(payload),
            Opcode::Pong => callback.on_read_pong(payload),
            Opcode::Close => {
                let (code, reason) = parse_close_payload(&payload)?;
                self.closed = true;
                callback.on_read_close(code, reason);
            }
            other => {
                return Err(WsError::protocol(format!(
                    "Unknown control opcode: 0x{:X}",
                    other.as_u8()
                )))
            }
        }
        Ok(())
    }

    fn read_message_frame<C: FrameCallback>(
        &mut self,
        header: FrameHeader,
        callback: &mut C,
    ) -> Result<()> {
        let format = header.opcode;
        if format != Opcode::Text && format != Opcode::Binary {
            return Err(WsError::protocol(format!(
                "Unknown opcode: 0x{:X}",
                format.as_u8()
            )));
        }

        let complete = self.read_message(header, callback);
        let payload = std::mem::take(&mut self.message);
        if !complete? {
            // The peer closed in the middle of a fragmented message.
            return Ok(());
        }

        if format == Opcode::Text {
            let text = String::from_utf8(payload)
                .map_err(|_| WsError::protocol("invalid UTF-8 in text message"))?;
            callback.on_read_text(text);
        } else {
            callback.on_read_binary(payload);
        }
        Ok(())
    }

    /// Fill the assembly buffer until the final fragment. Returns `false` if
    /// a close frame cut the message short.
    fn read_message<C: FrameCallback>(
        &mut self,
        mut header: FrameHeader,
        callback: &mut C,
    ) -> Result<bool> {
        loop {
            let size = self.message.len() as u64 + header.payload_len;
            if size > self.max_message_size {
                return Err(WsError::MessageTooBig {
                    size,
                    max: self.max_message_size,
                });
            }
            Self::read_payload(&mut self.source, &header, &mut self.message)?;

            if header.fin {
                return Ok(true);
            }

            header = match self.read_until_non_control_frame(callback)? {
                Some(next) => next,
                None => return Ok(false),
            };
            if header.opcode != Opcode::Continuation {
                return Err(WsError::protocol(format!(
                    "Expected continuation opcode. Got: 0x{:X}",
                    header.opcode.as_u8()
                )));
            }
        }
    }

    /// Process control frames until a data frame header shows up. Returns
    /// `None` if one of those control frames was a close.
    fn read_until_non_control_frame<C: FrameCallback>(
        &mut self,
        callback: &mut C,
    ) -> Result<Option<FrameHeader>> {
        while !self.closed {
            let header = self.read_header()?;
            if !header.is_control() {
                return Ok(Some(header));
            }
            self.read_control_frame(header, callback)?;
        }
        Ok(None)
    }
}

/// Split a close payload into its status code and reason.
///
/// An empty payload means "no status code" ([`CloseCode::NO_STATUS`]). A
/// 1-byte payload, a non-UTF-8 reason and an illegal code are violations.
pub fn parse_close_payload(payload: &[u8]) -> Result<(u16, String)> {
    match payload.len() {
        0 => Ok((CloseCode::NO_STATUS, String::new())),
        1 => Err(WsError::protocol("Malformed close payload length of 1.")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if let Some(msg) = close_code_error(code) {
                return Err(WsError::Protocol(msg));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| WsError::protocol("invalid UTF-8 in close reason"))?;
            Ok((code, reason.to_string()))
        }
    }
}
