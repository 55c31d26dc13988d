//! Frame writer (RFC 6455 Section 5.2-5.5).
//!
//! Encodes one frame per call onto a byte sink. Callers serialize access;
//! the connection engine gives the writer to exactly one thread.
//!
//! Control frames are flushed immediately. Message payloads go through a
//! [`MessageSink`], which fragments payloads of unknown length into
//! segment-sized frames: the first frame carries the message opcode, the rest
//! are continuations, and only the last has FIN set.
//!
//! Client writers mask every frame with a fresh random key.

use std::io::{self, Write};

use crate::error::{Result, WsError};
use crate::protocol::{
    apply_mask, validate_close_code, CloseCode, FrameHeader, Opcode, Role, CLOSE_MESSAGE_MAX,
};

/// Size of one buffered message segment. Complete segments are emitted as
/// frames while a message is still being written.
pub const SEGMENT_SIZE: usize = 8192;

pub struct FrameWriter<W> {
    role: Role,
    sink: W,
    /// Set once a close frame has been written (or attempted).
    writer_closed: bool,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(role: Role, sink: W) -> Self {
        Self {
            role,
            sink,
            writer_closed: false,
        }
    }

    pub fn write_ping(&mut self, payload: &[u8]) -> Result<()> {
        self.write_control_frame(Opcode::Ping, payload)
    }

    pub fn write_pong(&mut self, payload: &[u8]) -> Result<()> {
        self.write_control_frame(Opcode::Pong, payload)
    }

    /// Write a close frame. No other frame may follow it.
    ///
    /// `code` [`CloseCode::NONE`] with no reason produces an empty payload.
    pub fn write_close(&mut self, code: u16, reason: Option<&str>) -> Result<()> {
        let payload = build_close_payload(code, reason)?;
        let result = self.write_control_frame(Opcode::Close, &payload);
        self.writer_closed = true;
        result
    }

    fn write_control_frame(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        if self.writer_closed {
            return Err(io::Error::other("closed").into());
        }
        let mut frame = payload.to_vec();
        self.write_frame(opcode, true, &mut frame)?;
        self.sink.flush()?;
        tracing::trace!(?opcode, bytes = payload.len(), "wrote control frame");
        Ok(())
    }

    /// Start writing one message. `content_length` is the total payload size
    /// if known up front.
    pub fn new_message_sink(
        &mut self,
        format: Opcode,
        content_length: Option<u64>,
    ) -> MessageSink<'_, W> {
        MessageSink {
            writer: self,
            format,
            content_length,
            buffer: Vec::new(),
            is_first_frame: true,
            finished: false,
        }
    }

    /// Write a complete message whose payload is already in memory.
    pub fn write_message(&mut self, format: Opcode, payload: &[u8]) -> Result<()> {
        let mut sink = self.new_message_sink(format, Some(payload.len() as u64));
        sink.write_all(payload)?;
        sink.finish()
    }

    fn write_message_frame(
        &mut self,
        format: Opcode,
        payload: &mut [u8],
        is_first_frame: bool,
        is_final: bool,
    ) -> Result<()> {
        if self.writer_closed {
            return Err(io::Error::other("closed").into());
        }
        let opcode = if is_first_frame {
            format
        } else {
            Opcode::Continuation
        };
        self.write_frame(opcode, is_final, payload)?;
        self.sink.flush()?;
        tracing::trace!(?opcode, fin = is_final, bytes = payload.len(), "wrote message frame");
        Ok(())
    }

    /// Encode header and payload into one buffer and write it. Masks the
    /// payload in place when writing as a client.
    fn write_frame(&mut self, opcode: Opcode, fin: bool, payload: &mut [u8]) -> Result<()> {
        let mask_key = match self.role {
            Role::Client => Some(rand::random::<[u8; 4]>()),
            Role::Server => None,
        };
        let header = FrameHeader {
            fin,
            opcode,
            payload_len: payload.len() as u64,
            mask_key,
        };

        let mut frame = Vec::with_capacity(14 + payload.len());
        header.encode(&mut frame)?;
        if let Some(key) = mask_key {
            apply_mask(payload, &key);
        }
        frame.extend_from_slice(payload);
        self.sink.write_all(&frame)?;
        Ok(())
    }
}

/// Build a close payload: 2-byte big-endian code followed by the reason.
pub fn build_close_payload(code: u16, reason: Option<&str>) -> Result<Vec<u8>> {
    let reason = reason.unwrap_or("");
    if reason.len() > CLOSE_MESSAGE_MAX {
        return Err(WsError::InvalidArgument(format!(
            "reason.len() > {}: {}",
            CLOSE_MESSAGE_MAX, reason
        )));
    }
    if code == CloseCode::NONE {
        if !reason.is_empty() {
            return Err(WsError::InvalidArgument(
                "a close reason requires a status code".to_string(),
            ));
        }
        return Ok(Vec::new());
    }
    validate_close_code(code)?;

    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    Ok(payload)
}

/// Incremental writer for one message.
///
/// Bytes accumulate in a buffer; each time the buffer holds complete
/// segments they are written as a non-final frame. [`MessageSink::finish`]
/// writes whatever remains as the final frame and must be called to end the
/// message.
///
/// When the total length is known and the buffer already holds all but the
/// last segment of it, the first frame is held back so that small messages
/// go out as a single final frame.
pub struct MessageSink<'a, W> {
    writer: &'a mut FrameWriter<W>,
    format: Opcode,
    content_length: Option<u64>,
    buffer: Vec<u8>,
    is_first_frame: bool,
    finished: bool,
}

impl<W: Write> MessageSink<'_, W> {
    /// Write the remaining buffered bytes as the final frame.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        let len = self.buffer.len();
        self.emit(len, true)
    }

    fn emit(&mut self, len: usize, is_final: bool) -> Result<()> {
        let mut frame: Vec<u8> = self.buffer.drain(..len).collect();
        self.writer
            .write_message_frame(self.format, &mut frame, self.is_first_frame, is_final)?;
        self.is_first_frame = false;
        Ok(())
    }

    fn defer_write(&self) -> bool {
        self.is_first_frame
            && self.content_length.is_some_and(|total| {
                self.buffer.len() as u64 > total.saturating_sub(SEGMENT_SIZE as u64)
            })
    }
}

impl<W: Write> Write for MessageSink<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::other("closed"));
        }
        self.buffer.extend_from_slice(buf);

        let complete_segments = self.buffer.len() / SEGMENT_SIZE * SEGMENT_SIZE;
        if complete_segments > 0 && !self.defer_write() {
            self.emit(complete_segments, false).map_err(into_io)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.finished {
            return Err(io::Error::other("closed"));
        }
        if !self.buffer.is_empty() {
            let len = self.buffer.len();
            self.emit(len, false).map_err(into_io)?;
        }
        Ok(())
    }
}

fn into_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        other => io::Error::other(other),
    }
}
