//! Connection engine: handshake, reader and writer threads, outgoing queue,
//! close handshake and failure handling.
//!
//! Each connection runs two threads:
//!
//! - `ws-reader` dials (via [`Transport`]), performs the upgrade handshake and
//!   then loops on [`FrameReader::process_next_frame`] until the peer's close
//!   frame or an error.
//! - `ws-writer` owns the [`FrameWriter`]. It drains the outgoing queue
//!   whenever it is woken, sends heartbeat pings on its ticker, and enforces
//!   the close-cancellation deadline.
//!
//! All mutable connection state lives in one [`State`] behind one mutex.
//! Listener callbacks are never invoked with that lock held. Every terminal
//! transition (to `Closed` or `Failed`) happens under the lock and only from a
//! non-terminal phase, so exactly one terminal notification is delivered.

use std::collections::VecDeque;
use std::io::{BufReader, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, bounded, never, select, tick, Receiver, Sender};
use parking_lot::Mutex;

use crate::config::WsConfig;
use crate::error::{Result, WsError};
use crate::handshake::{
    check_response, generate_key, read_upgrade_response, write_upgrade_request, UpgradeRequest,
    UpgradeResponse,
};
use crate::heartbeat::{HeartbeatAction, HeartbeatState};
use crate::protocol::{CloseCode, Opcode, Role, PAYLOAD_BYTE_MAX};
use crate::reader::{FrameCallback, FrameReader};
use crate::stream::{StreamControl, Transport};
use crate::writer::{build_close_payload, FrameWriter};

type Source = BufReader<Box<dyn Read + Send>>;
type Sink = Box<dyn Write + Send>;

// ── Public surface ──────────────────────────────────────────────────────

/// Lifecycle phase. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress. Sends and closes are queued.
    Connecting,
    Open,
    /// A close frame was queued locally or received from the peer.
    Closing,
    /// Both close frames exchanged; the transport is released.
    Closed,
    /// Terminated by an error or by cancellation.
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// Connection event callbacks. Invoked from the engine's threads, never
/// while connection state is locked, so calling back into the [`WebSocket`]
/// is allowed.
#[allow(unused_variables)]
pub trait WsListener: Send + Sync + 'static {
    /// The server accepted the upgrade.
    fn on_open(&self, ws: &WebSocket, response: &UpgradeResponse) {}

    fn on_text(&self, ws: &WebSocket, text: String) {}

    fn on_binary(&self, ws: &WebSocket, bytes: Vec<u8>) {}

    /// The peer sent its close frame. No more messages will arrive. The
    /// usual response is to call [`WebSocket::close`].
    fn on_closing(&self, ws: &WebSocket, code: u16, reason: &str) {}

    /// Both close frames were exchanged and the transport is released.
    fn on_closed(&self, ws: &WebSocket, code: u16, reason: &str) {}

    /// The connection failed or was cancelled. No other callback follows.
    ///
    /// `response` is the server's reply when the upgrade was rejected, so
    /// statuses such as 401 and their headers can be inspected.
    fn on_failure(&self, ws: &WebSocket, error: &WsError, response: Option<&UpgradeResponse>) {}
}

/// Handle to one client connection. Cheap to clone; all clones drive the
/// same connection.
#[derive(Clone)]
pub struct WebSocket {
    shared: Arc<Shared>,
}

// ── Internal state ──────────────────────────────────────────────────────

enum Outgoing {
    Message { opcode: Opcode, payload: Vec<u8> },
    Close {
        code: u16,
        reason: Option<String>,
        cancel_after: Duration,
    },
}

struct State {
    phase: ConnectionState,
    /// Served before anything in `queue`.
    pong_queue: VecDeque<Vec<u8>>,
    /// Messages, then at most one trailing close.
    queue: VecDeque<Outgoing>,
    /// Payload bytes of the messages in `queue`.
    queue_size: u64,
    enqueued_close: bool,
    /// Our close frame is on the wire.
    sent_close: bool,
    /// The peer's close frame was read; no more pongs can arrive.
    peer_closing: bool,
    /// The peer's close frame, set once `on_closing` has been delivered.
    received_close: Option<(u16, String)>,
    heartbeat: Option<HeartbeatState>,
    received_ping_count: u32,
    received_pong_count: u32,
    control: Option<Arc<dyn StreamControl>>,
}

struct Shared {
    state: Mutex<State>,
    config: WsConfig,
    request: UpgradeRequest,
    key: String,
    listener: Box<dyn WsListener>,
    wake_tx: Sender<()>,
}

/// Result of one writer step.
enum Step {
    Wrote,
    Idle,
    /// Our close frame went out before the peer's; arm the cancel deadline.
    CloseSent(Duration),
    /// Terminal phase reached; the writer thread exits.
    Finished,
}

impl WebSocket {
    /// Start a client connection over `transport`.
    ///
    /// Returns immediately; the handshake runs on the reader thread and its
    /// outcome arrives as [`WsListener::on_open`] or
    /// [`WsListener::on_failure`]. Messages sent before the handshake
    /// completes are queued.
    pub fn connect<T, L>(
        transport: T,
        request: UpgradeRequest,
        config: WsConfig,
        listener: L,
    ) -> Result<WebSocket>
    where
        T: Transport,
        L: WsListener,
    {
        config.validate()?;
        let (wake_tx, wake_rx) = bounded(1);
        let ws = WebSocket {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    phase: ConnectionState::Connecting,
                    pong_queue: VecDeque::new(),
                    queue: VecDeque::new(),
                    queue_size: 0,
                    enqueued_close: false,
                    sent_close: false,
                    peer_closing: false,
                    received_close: None,
                    heartbeat: None,
                    received_ping_count: 0,
                    received_pong_count: 0,
                    control: None,
                }),
                config,
                request,
                key: generate_key(),
                listener: Box::new(listener),
                wake_tx,
            }),
        };

        let reader_ws = ws.clone();
        thread::Builder::new()
            .name("ws-reader".to_string())
            .spawn(move || reader_ws.run_reader(transport, wake_rx))?;
        Ok(ws)
    }

    /// Queue a text message. Returns `false` if the connection is failing,
    /// closing, or the outgoing queue is full.
    pub fn send_text(&self, text: &str) -> bool {
        self.send(Opcode::Text, text.as_bytes().to_vec())
    }

    /// Queue a binary message. Same rules as [`WebSocket::send_text`].
    pub fn send_binary(&self, bytes: &[u8]) -> bool {
        self.send(Opcode::Binary, bytes.to_vec())
    }

    fn send(&self, opcode: Opcode, payload: Vec<u8>) -> bool {
        let mut st = self.shared.state.lock();
        if st.phase.is_terminal() || st.enqueued_close {
            return false;
        }

        let len = payload.len() as u64;
        if st.queue_size + len > self.shared.config.max_queue_size {
            tracing::warn!(
                queue_size = st.queue_size,
                bytes = len,
                "outgoing queue full, closing"
            );
            let cancel_after = Duration::from_millis(self.shared.config.cancel_after_close_ms);
            self.enqueue_close(&mut st, CloseCode::GOING_AWAY, None, cancel_after);
            drop(st);
            self.wake();
            return false;
        }

        st.queue_size += len;
        st.queue.push_back(Outgoing::Message { opcode, payload });
        drop(st);
        self.wake();
        true
    }

    /// Queue a pong ahead of any pending messages. Returns `false` once the
    /// connection has ended, once our close frame has been taken off the
    /// queue, or if `payload` is too long for a control frame.
    pub fn pong(&self, payload: &[u8]) -> bool {
        if payload.len() as u64 > PAYLOAD_BYTE_MAX {
            return false;
        }
        let mut st = self.shared.state.lock();
        if st.phase.is_terminal() || (st.enqueued_close && st.queue.is_empty()) {
            return false;
        }
        st.pong_queue.push_back(payload.to_vec());
        drop(st);
        self.wake();
        true
    }

    /// Begin a graceful close, waiting up to the configured
    /// `cancel_after_close_ms` for the peer's close frame.
    pub fn close(&self, code: u16, reason: Option<&str>) -> Result<bool> {
        let cancel_after = Duration::from_millis(self.shared.config.cancel_after_close_ms);
        self.close_with_timeout(code, reason, cancel_after)
    }

    /// Begin a graceful close. Once our close frame is written the peer has
    /// `cancel_after` to answer before the connection is cancelled.
    ///
    /// Returns `Ok(false)` if the connection already failed or a close was
    /// already queued. `code` must be a legal close code, or
    /// [`CloseCode::NONE`] with no reason.
    pub fn close_with_timeout(
        &self,
        code: u16,
        reason: Option<&str>,
        cancel_after: Duration,
    ) -> Result<bool> {
        build_close_payload(code, reason)?;

        let mut st = self.shared.state.lock();
        if st.phase.is_terminal() || st.enqueued_close {
            return Ok(false);
        }
        self.enqueue_close(&mut st, code, reason.map(str::to_string), cancel_after);
        drop(st);
        self.wake();
        Ok(true)
    }

    fn enqueue_close(
        &self,
        st: &mut State,
        code: u16,
        reason: Option<String>,
        cancel_after: Duration,
    ) {
        tracing::debug!(code, "close enqueued");
        st.enqueued_close = true;
        st.queue.push_back(Outgoing::Close {
            code,
            reason,
            cancel_after,
        });
        if st.phase == ConnectionState::Open {
            st.phase = ConnectionState::Closing;
        }
    }

    /// Tear the connection down immediately. Reported through
    /// [`WsListener::on_failure`] with [`WsError::Cancelled`].
    pub fn cancel(&self) {
        self.fail(WsError::Cancelled);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().phase
    }

    /// Payload bytes queued but not yet written.
    pub fn queue_size(&self) -> u64 {
        self.shared.state.lock().queue_size
    }

    pub fn sent_ping_count(&self) -> u32 {
        let st = self.shared.state.lock();
        st.heartbeat.as_ref().map_or(0, HeartbeatState::sent_ping_count)
    }

    pub fn received_ping_count(&self) -> u32 {
        self.shared.state.lock().received_ping_count
    }

    pub fn received_pong_count(&self) -> u32 {
        self.shared.state.lock().received_pong_count
    }

    /// The `Sec-WebSocket-Key` sent with the upgrade request.
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn request(&self) -> &UpgradeRequest {
        &self.shared.request
    }

    fn wake(&self) {
        // A full channel already holds a pending wakeup.
        let _ = self.shared.wake_tx.try_send(());
    }

    // ── Failure path ────────────────────────────────────────────────────

    /// Move to `Failed`, release the transport and notify the listener.
    /// Does nothing if the connection already ended.
    fn fail(&self, error: WsError) {
        self.fail_with_response(error, None);
    }

    fn fail_with_response(&self, error: WsError, response: Option<&UpgradeResponse>) {
        let control = {
            let mut st = self.shared.state.lock();
            if st.phase.is_terminal() {
                return;
            }
            st.phase = ConnectionState::Failed;
            st.pong_queue.clear();
            st.queue.clear();
            st.queue_size = 0;
            st.control.take()
        };
        self.wake();
        if let Some(control) = control {
            let _ = control.shutdown();
        }

        match error {
            WsError::Cancelled => tracing::debug!("websocket cancelled"),
            ref e => tracing::warn!(error = %e, "websocket failed"),
        }
        self.shared.listener.on_failure(self, &error, response);
    }

    /// Move to `Closed` after both close frames were exchanged.
    fn finish_close(&self, control: Option<Arc<dyn StreamControl>>, code: u16, reason: &str) {
        self.wake();
        if let Some(control) = control {
            let _ = control.shutdown();
        }
        tracing::debug!(code, reason, "websocket closed");
        self.shared.listener.on_closed(self, code, reason);
    }

    // ── Reader thread ───────────────────────────────────────────────────

    fn run_reader<T: Transport>(self, transport: T, wake_rx: Receiver<()>) {
        let streams = match transport.into_streams() {
            Ok(streams) => streams,
            Err(e) => return self.fail(e.into()),
        };

        {
            let mut st = self.shared.state.lock();
            if st.phase.is_terminal() {
                // Cancelled while dialing.
                let _ = streams.control.shutdown();
                return;
            }
            st.control = Some(Arc::clone(&streams.control));
        }

        let mut source = BufReader::new(streams.source);
        let mut sink = streams.sink;
        let response = match self.handshake(&mut source, &mut sink, &*streams.control) {
            Ok(response) => response,
            Err(e) => return self.fail(e),
        };
        if let Err(e) = check_response(&response, &self.shared.key) {
            return self.fail_with_response(e, Some(&response));
        }
        if let Err(e) = streams.control.set_read_timeout(None) {
            return self.fail(e.into());
        }

        {
            let mut st = self.shared.state.lock();
            if st.phase.is_terminal() {
                return;
            }
            st.phase = if st.enqueued_close {
                ConnectionState::Closing
            } else {
                ConnectionState::Open
            };
            st.heartbeat = self.shared.config.heartbeat_period().map(HeartbeatState::new);
        }
        tracing::debug!(
            host = %self.shared.request.host,
            path = %self.shared.request.path,
            "websocket open"
        );
        self.shared.listener.on_open(&self, &response);

        let writer = FrameWriter::new(Role::Client, sink);
        let writer_ws = self.clone();
        let spawned = thread::Builder::new()
            .name("ws-writer".to_string())
            .spawn(move || writer_ws.run_writer(writer, wake_rx));
        if let Err(e) = spawned {
            return self.fail(e.into());
        }

        self.loop_reader(source);
    }

    /// Send the upgrade request and read the response head. The caller
    /// validates the response and clears the read deadline.
    fn handshake(
        &self,
        source: &mut Source,
        sink: &mut Sink,
        control: &dyn StreamControl,
    ) -> Result<UpgradeResponse> {
        write_upgrade_request(sink, &self.shared.request, &self.shared.key)?;
        control.set_read_timeout(self.shared.config.handshake_deadline())?;
        read_upgrade_response(source)
    }

    fn loop_reader(&self, source: Source) {
        let mut reader = FrameReader::new(Role::Client, source, self.shared.config.max_message_size);
        let mut dispatch = Dispatch { ws: self };
        while !reader.is_closed() {
            if let Err(e) = reader.process_next_frame(&mut dispatch) {
                return self.fail(e);
            }
        }
    }

    fn on_read_ping(&self, payload: Vec<u8>) {
        let mut st = self.shared.state.lock();
        if st.phase.is_terminal() || (st.enqueued_close && st.queue.is_empty()) {
            return;
        }
        st.pong_queue.push_back(payload);
        st.received_ping_count += 1;
        drop(st);
        self.wake();
    }

    fn on_read_pong(&self) {
        let mut st = self.shared.state.lock();
        st.received_pong_count += 1;
        if let Some(heartbeat) = st.heartbeat.as_mut() {
            heartbeat.on_pong();
        }
    }

    fn on_read_close(&self, code: u16, reason: String) {
        {
            let mut st = self.shared.state.lock();
            if st.phase.is_terminal() {
                return;
            }
            st.phase = ConnectionState::Closing;
            st.peer_closing = true;
        }
        tracing::debug!(code, reason = %reason, "peer closing");
        self.shared.listener.on_closing(self, code, &reason);

        // Recorded only after `on_closing` returns so that `on_closed` can
        // never overtake it, whichever thread finishes the close.
        let control = {
            let mut st = self.shared.state.lock();
            if st.phase.is_terminal() {
                return;
            }
            st.received_close = Some((code, reason.clone()));
            if !st.sent_close {
                return;
            }
            st.phase = ConnectionState::Closed;
            st.control.take()
        };
        self.finish_close(control, code, &reason);
    }

    // ── Writer thread ───────────────────────────────────────────────────

    fn run_writer(self, mut writer: FrameWriter<Sink>, wake_rx: Receiver<()>) {
        let ticker = match self.shared.config.heartbeat_period() {
            Some(period) => tick(period),
            None => never(),
        };
        let mut deadline: Receiver<Instant> = never();

        loop {
            loop {
                match self.write_one_frame(&mut writer) {
                    Ok(Step::Wrote) => {}
                    Ok(Step::Idle) => break,
                    Ok(Step::CloseSent(cancel_after)) => deadline = after(cancel_after),
                    Ok(Step::Finished) => return,
                    Err(e) => return self.fail(e),
                }
            }

            select! {
                recv(wake_rx) -> _ => {}
                recv(ticker) -> _ => {
                    if let Err(e) = self.write_ping_frame(&mut writer) {
                        return self.fail(e);
                    }
                }
                recv(deadline) -> _ => {
                    tracing::debug!("peer did not answer close in time");
                    return self.cancel();
                }
            }
        }
    }

    /// Write the highest-priority queued frame: pong, then message, then close.
    fn write_one_frame(&self, writer: &mut FrameWriter<Sink>) -> Result<Step> {
        let pong;
        let item;
        {
            let mut st = self.shared.state.lock();
            if st.phase.is_terminal() {
                return Ok(Step::Finished);
            }
            pong = st.pong_queue.pop_front();
            item = match pong {
                Some(_) => None,
                None => match st.queue.pop_front() {
                    Some(item) => Some(item),
                    None => return Ok(Step::Idle),
                },
            };
        }

        if let Some(payload) = pong {
            writer.write_pong(&payload)?;
            return Ok(Step::Wrote);
        }

        match item {
            Some(Outgoing::Message { opcode, payload }) => {
                writer.write_message(opcode, &payload)?;
                let mut st = self.shared.state.lock();
                st.queue_size = st.queue_size.saturating_sub(payload.len() as u64);
                Ok(Step::Wrote)
            }
            Some(Outgoing::Close {
                code,
                reason,
                cancel_after,
            }) => {
                writer.write_close(code, reason.as_deref())?;
                tracing::debug!(code, "close frame sent");

                let (control, code, reason) = {
                    let mut st = self.shared.state.lock();
                    if st.phase.is_terminal() {
                        return Ok(Step::Finished);
                    }
                    st.sent_close = true;
                    match st.received_close.clone() {
                        Some((code, reason)) => {
                            st.phase = ConnectionState::Closed;
                            (st.control.take(), code, reason)
                        }
                        None => return Ok(Step::CloseSent(cancel_after)),
                    }
                };
                self.finish_close(control, code, &reason);
                Ok(Step::Finished)
            }
            None => Ok(Step::Idle),
        }
    }

    fn write_ping_frame(&self, writer: &mut FrameWriter<Sink>) -> Result<()> {
        let timed_out = {
            let mut st = self.shared.state.lock();
            // No pings once either close frame has been exchanged.
            if st.phase.is_terminal() || st.sent_close || st.peer_closing {
                return Ok(());
            }
            let Some(heartbeat) = st.heartbeat.as_mut() else {
                return Ok(());
            };
            match heartbeat.on_tick() {
                HeartbeatAction::SendPing => None,
                HeartbeatAction::TimedOut { successful } => {
                    Some(heartbeat.timeout_error(successful))
                }
            }
        };

        match timed_out {
            Some(error) => {
                self.fail(error);
                Ok(())
            }
            None => {
                writer.write_ping(&[])?;
                tracing::trace!("heartbeat ping sent");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("request", &self.shared.request)
            .field("state", &self.state())
            .finish()
    }
}

/// Routes reader callbacks into the engine.
struct Dispatch<'a> {
    ws: &'a WebSocket,
}

impl FrameCallback for Dispatch<'_> {
    fn on_read_text(&mut self, text: String) {
        self.ws.shared.listener.on_text(self.ws, text);
    }

    fn on_read_binary(&mut self, bytes: Vec<u8>) {
        self.ws.shared.listener.on_binary(self.ws, bytes);
    }

    fn on_read_ping(&mut self, payload: Vec<u8>) {
        self.ws.on_read_ping(payload);
    }

    fn on_read_pong(&mut self, _payload: Vec<u8>) {
        self.ws.on_read_pong();
    }

    fn on_read_close(&mut self, code: u16, reason: String) {
        self.ws.on_read_close(code, reason);
    }
}
