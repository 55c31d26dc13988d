//! End-to-end tests: the client engine against a scripted loopback server.
//!
//! The server side is built from the crate's own server-role frame codec so
//! every test also checks that client frames are masked.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use mesh_ws::handshake::compute_accept_key;
use mesh_ws::reader::{FrameCallback, FrameReader};
use mesh_ws::writer::FrameWriter;
use mesh_ws::{
    CloseCode, ConnectionState, Opcode, Role, UpgradeRequest, UpgradeResponse, WebSocket,
    WsConfig, WsError, WsListener,
};

const WAIT: Duration = Duration::from_secs(5);

// ── Client side ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Ev {
    Open,
    Text(String),
    Binary(Vec<u8>),
    Closing(u16, String),
    Closed(u16, String),
    Failure(String),
    /// Failure carrying the rejected upgrade response's status.
    Rejected(u16, String),
}

struct Events {
    tx: Sender<Ev>,
    /// Answer the peer's close frame from `on_closing`.
    reply_close: bool,
}

impl WsListener for Events {
    fn on_open(&self, _ws: &WebSocket, response: &UpgradeResponse) {
        assert_eq!(response.code, 101);
        let _ = self.tx.send(Ev::Open);
    }

    fn on_text(&self, _ws: &WebSocket, text: String) {
        let _ = self.tx.send(Ev::Text(text));
    }

    fn on_binary(&self, _ws: &WebSocket, bytes: Vec<u8>) {
        let _ = self.tx.send(Ev::Binary(bytes));
    }

    fn on_closing(&self, ws: &WebSocket, code: u16, reason: &str) {
        let _ = self.tx.send(Ev::Closing(code, reason.to_string()));
        if self.reply_close {
            ws.close(CloseCode::NORMAL, None).unwrap();
        }
    }

    fn on_closed(&self, _ws: &WebSocket, code: u16, reason: &str) {
        let _ = self.tx.send(Ev::Closed(code, reason.to_string()));
    }

    fn on_failure(&self, _ws: &WebSocket, error: &WsError, response: Option<&UpgradeResponse>) {
        let ev = match response {
            Some(response) => Ev::Rejected(response.code, error.to_string()),
            None => Ev::Failure(error.to_string()),
        };
        let _ = self.tx.send(ev);
    }
}

fn connect(port: u16, config: WsConfig, reply_close: bool) -> (WebSocket, Receiver<Ev>) {
    let (tx, rx) = unbounded();
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let ws = WebSocket::connect(
        stream,
        UpgradeRequest::new(format!("127.0.0.1:{port}"), "/ws").header("X-Test", "1"),
        config,
        Events { tx, reply_close },
    )
    .unwrap();
    (ws, rx)
}

fn next(rx: &Receiver<Ev>) -> Ev {
    rx.recv_timeout(WAIT).expect("timed out waiting for event")
}

/// No event arrives within a short grace period.
fn assert_quiet(rx: &Receiver<Ev>) {
    if let Ok(ev) = rx.recv_timeout(Duration::from_millis(200)) {
        panic!("unexpected event: {ev:?}");
    }
}

// ── Server side ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(u16, String),
}

#[derive(Default)]
struct Frames(VecDeque<Frame>);

impl FrameCallback for Frames {
    fn on_read_text(&mut self, text: String) {
        self.0.push_back(Frame::Text(text));
    }
    fn on_read_binary(&mut self, bytes: Vec<u8>) {
        self.0.push_back(Frame::Binary(bytes));
    }
    fn on_read_ping(&mut self, payload: Vec<u8>) {
        self.0.push_back(Frame::Ping(payload));
    }
    fn on_read_pong(&mut self, payload: Vec<u8>) {
        self.0.push_back(Frame::Pong(payload));
    }
    fn on_read_close(&mut self, code: u16, reason: String) {
        self.0.push_back(Frame::Close(code, reason));
    }
}

struct ServerConn {
    reader: FrameReader<BufReader<TcpStream>>,
    writer: FrameWriter<TcpStream>,
    /// Unframed access for writing malformed bytes.
    raw: TcpStream,
    pending: Frames,
    request_head: String,
}

impl ServerConn {
    /// Next frame from the client, or `None` once the connection is gone.
    fn next(&mut self) -> Option<Frame> {
        while self.pending.0.is_empty() {
            if self.reader.process_next_frame(&mut self.pending).is_err() {
                return None;
            }
        }
        self.pending.0.pop_front()
    }

    /// Block until the client tears the connection down.
    fn drain(&mut self) {
        while self.next().is_some() {}
    }
}

fn free_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

/// Read the upgrade request head and return it with the client's key.
fn read_request(reader: &mut BufReader<TcpStream>) -> (String, String) {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        if line == "\r\n" || line.is_empty() {
            break;
        }
        head.push_str(&line);
    }
    let key = head
        .lines()
        .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
        .unwrap()
        .trim()
        .to_string();
    (head, key)
}

/// Accept one connection, answer the upgrade with `respond(key)` and hand
/// the socket to `script`.
fn serve_raw<R, F>(respond: R, script: F) -> u16
where
    R: FnOnce(&str) -> String + Send + 'static,
    F: FnOnce(ServerConn) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        let mut write_half = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);
        let (request_head, key) = read_request(&mut reader);
        write_half.write_all(respond(&key).as_bytes()).unwrap();
        write_half.flush().unwrap();
        let raw = write_half.try_clone().unwrap();
        script(ServerConn {
            reader: FrameReader::new(Role::Server, reader, u64::MAX),
            writer: FrameWriter::new(Role::Server, write_half),
            raw,
            pending: Frames::default(),
            request_head,
        });
    });
    port
}

fn switching_protocols(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        compute_accept_key(key)
    )
}

fn serve<F>(script: F) -> u16
where
    F: FnOnce(ServerConn) + Send + 'static,
{
    serve_raw(switching_protocols, script)
}

// ── Handshake ───────────────────────────────────────────────────────────

#[test]
fn test_handshake_sends_request_headers() {
    let (head_tx, head_rx) = unbounded();
    let port = serve(move |mut conn| {
        head_tx.send(conn.request_head.clone()).unwrap();
        conn.drain();
    });
    let (ws, rx) = connect(port, WsConfig::default(), false);
    assert_eq!(next(&rx), Ev::Open);
    assert_eq!(ws.state(), ConnectionState::Open);

    let head = head_rx.recv_timeout(WAIT).unwrap();
    assert!(head.starts_with("GET /ws HTTP/1.1\r\n"));
    assert!(head.contains("Upgrade: websocket\r\n"));
    assert!(head.contains("Sec-WebSocket-Version: 13\r\n"));
    assert!(head.contains(&format!("Sec-WebSocket-Key: {}\r\n", ws.key())));
    assert!(head.contains("X-Test: 1\r\n"));
    assert_eq!(ws.request().path, "/ws");
    ws.cancel();
}

#[test]
fn test_handshake_rejects_wrong_accept() {
    let port = serve_raw(
        |_key| {
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: bm90IHRoZSByaWdodCBrZXk=\r\n\r\n"
                .to_string()
        },
        |mut conn| conn.drain(),
    );
    let (ws, rx) = connect(port, WsConfig::default(), false);
    match next(&rx) {
        Ev::Rejected(101, msg) => assert!(msg.contains("Sec-WebSocket-Accept"), "got: {msg}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(ws.state(), ConnectionState::Failed);
    assert!(!ws.send_text("nope"));
    assert_quiet(&rx);
}

#[test]
fn test_handshake_rejects_non_101() {
    let port = serve_raw(
        |_key| "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string(),
        |mut conn| conn.drain(),
    );
    let (_ws, rx) = connect(port, WsConfig::default(), false);
    match next(&rx) {
        Ev::Rejected(code, msg) => {
            assert_eq!(code, 404);
            assert!(
                msg.contains("Expected HTTP 101 response but was '404 Not Found'"),
                "got: {msg}"
            );
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn test_connection_refused_fails() {
    let port = free_port();
    let (tx, rx) = unbounded();
    let ws = WebSocket::connect(
        mesh_ws::TcpConnector::new(format!("127.0.0.1:{port}")),
        UpgradeRequest::new("127.0.0.1", "/"),
        WsConfig::default(),
        Events {
            tx,
            reply_close: false,
        },
    )
    .unwrap();
    assert!(matches!(next(&rx), Ev::Failure(_)));
    assert_eq!(ws.state(), ConnectionState::Failed);
}

// ── Messages ────────────────────────────────────────────────────────────

#[test]
fn test_echo_and_client_initiated_close() {
    let port = serve(|mut conn| {
        while let Some(frame) = conn.next() {
            match frame {
                Frame::Text(t) => conn.writer.write_message(Opcode::Text, t.as_bytes()).unwrap(),
                Frame::Binary(b) => conn.writer.write_message(Opcode::Binary, &b).unwrap(),
                Frame::Close(code, reason) => {
                    conn.writer.write_close(code, Some(&reason)).unwrap();
                    break;
                }
                _ => {}
            }
        }
    });

    let (ws, rx) = connect(port, WsConfig::default(), false);
    assert_eq!(next(&rx), Ev::Open);

    assert!(ws.send_text("hello"));
    assert_eq!(next(&rx), Ev::Text("hello".into()));

    let big: Vec<u8> = (0..50_000u32).map(|i| i as u8).collect();
    assert!(ws.send_binary(&big));
    assert_eq!(next(&rx), Ev::Binary(big));

    assert!(ws.close(1000, Some("bye")).unwrap());
    assert_eq!(ws.state(), ConnectionState::Closing);
    assert!(!ws.send_text("after close"));

    assert_eq!(next(&rx), Ev::Closing(1000, "bye".into()));
    assert_eq!(next(&rx), Ev::Closed(1000, "bye".into()));
    assert_eq!(ws.state(), ConnectionState::Closed);
    assert_eq!(ws.queue_size(), 0);
    assert_quiet(&rx);
}

#[test]
fn test_server_initiated_close() {
    let (frames_tx, frames_rx) = unbounded();
    let port = serve(move |mut conn| {
        conn.writer.write_close(1001, Some("restart")).unwrap();
        while let Some(frame) = conn.next() {
            let _ = frames_tx.send(frame);
        }
    });

    let (ws, rx) = connect(port, WsConfig::default(), true);
    assert_eq!(next(&rx), Ev::Open);
    assert_eq!(next(&rx), Ev::Closing(1001, "restart".into()));
    assert_eq!(next(&rx), Ev::Closed(1001, "restart".into()));
    assert_eq!(ws.state(), ConnectionState::Closed);

    assert_eq!(
        frames_rx.recv_timeout(WAIT).unwrap(),
        Frame::Close(1000, String::new())
    );
}

#[test]
fn test_fragmented_server_message() {
    let port = serve(|mut conn| {
        let mut sink = conn.writer.new_message_sink(Opcode::Text, None);
        for _ in 0..5 {
            sink.write_all("a".repeat(4000).as_bytes()).unwrap();
        }
        sink.finish().unwrap();
        conn.writer.write_message(Opcode::Binary, b"next").unwrap();
        conn.drain();
    });

    let (ws, rx) = connect(port, WsConfig::default(), false);
    assert_eq!(next(&rx), Ev::Open);
    assert_eq!(next(&rx), Ev::Text("a".repeat(20_000)));
    assert_eq!(next(&rx), Ev::Binary(b"next".to_vec()));
    ws.cancel();
}

#[test]
fn test_ping_is_answered_with_pong() {
    let (frames_tx, frames_rx) = unbounded();
    let port = serve(move |mut conn| {
        conn.writer.write_ping(b"are you there").unwrap();
        if let Some(frame) = conn.next() {
            let _ = frames_tx.send(frame);
        }
        conn.drain();
    });

    let (ws, rx) = connect(port, WsConfig::default(), false);
    assert_eq!(next(&rx), Ev::Open);
    assert_eq!(
        frames_rx.recv_timeout(WAIT).unwrap(),
        Frame::Pong(b"are you there".to_vec())
    );
    assert_eq!(ws.received_ping_count(), 1);
    ws.cancel();
}

#[test]
fn test_sends_before_open_are_delivered() {
    let (frames_tx, frames_rx) = unbounded();
    let port = serve_raw(
        |key| {
            // Give the client time to queue while still connecting.
            thread::sleep(Duration::from_millis(200));
            switching_protocols(key)
        },
        move |mut conn| {
            while let Some(frame) = conn.next() {
                let _ = frames_tx.send(frame);
            }
        },
    );

    let (ws, rx) = connect(port, WsConfig::default(), false);
    assert!(ws.send_text("early"));
    assert!(ws.send_binary(b"bird"));
    assert_eq!(next(&rx), Ev::Open);

    assert_eq!(frames_rx.recv_timeout(WAIT).unwrap(), Frame::Text("early".into()));
    assert_eq!(
        frames_rx.recv_timeout(WAIT).unwrap(),
        Frame::Binary(b"bird".to_vec())
    );
    ws.cancel();
}

// ── Backpressure ────────────────────────────────────────────────────────

#[test]
fn test_queue_overflow_sends_going_away_once() {
    let (frames_tx, frames_rx) = unbounded();
    let port = serve_raw(
        |key| {
            thread::sleep(Duration::from_millis(200));
            switching_protocols(key)
        },
        move |mut conn| {
            while let Some(frame) = conn.next() {
                let _ = frames_tx.send(frame);
            }
        },
    );

    let (ws, rx) = connect(port, WsConfig::default().max_queue_size(1024), false);
    assert!(ws.send_binary(&[1; 1000]));
    assert!(!ws.send_binary(&[2; 100]));
    assert!(!ws.send_binary(&[3; 1]));
    assert_eq!(next(&rx), Ev::Open);

    assert_eq!(frames_rx.recv_timeout(WAIT).unwrap(), Frame::Binary(vec![1; 1000]));
    assert_eq!(
        frames_rx.recv_timeout(WAIT).unwrap(),
        Frame::Close(CloseCode::GOING_AWAY, String::new())
    );
    ws.cancel();
    assert!(frames_rx.recv_timeout(Duration::from_millis(200)).is_err());
}

// ── Timers ──────────────────────────────────────────────────────────────

#[test]
fn test_unanswered_close_is_cancelled() {
    let (frames_tx, frames_rx) = unbounded();
    let port = serve(move |mut conn| {
        while let Some(frame) = conn.next() {
            let _ = frames_tx.send(frame);
        }
    });

    let (ws, rx) = connect(port, WsConfig::default(), false);
    assert_eq!(next(&rx), Ev::Open);
    assert!(ws
        .close_with_timeout(1000, Some("done"), Duration::from_millis(200))
        .unwrap());

    assert_eq!(
        frames_rx.recv_timeout(WAIT).unwrap(),
        Frame::Close(1000, "done".into())
    );
    assert_eq!(next(&rx), Ev::Failure(WsError::Cancelled.to_string()));
    assert_eq!(ws.state(), ConnectionState::Failed);
    assert_quiet(&rx);
}

#[test]
fn test_heartbeat_keeps_connection_alive() {
    let port = serve(|mut conn| {
        while let Some(frame) = conn.next() {
            if let Frame::Ping(payload) = frame {
                if conn.writer.write_pong(&payload).is_err() {
                    break;
                }
            }
        }
    });

    let config = WsConfig::default().ping_interval(Duration::from_millis(50));
    let (ws, rx) = connect(port, config, false);
    assert_eq!(next(&rx), Ev::Open);
    thread::sleep(Duration::from_millis(400));

    assert_eq!(ws.state(), ConnectionState::Open);
    assert!(ws.sent_ping_count() >= 3, "sent {}", ws.sent_ping_count());
    assert!(ws.received_pong_count() >= 2, "got {}", ws.received_pong_count());
    ws.cancel();
}

#[test]
fn test_heartbeat_stops_after_peer_close() {
    let port = serve(|mut conn| {
        conn.writer.write_close(1001, Some("bye")).unwrap();
        while let Some(frame) = conn.next() {
            if let Frame::Ping(payload) = frame {
                if conn.writer.write_pong(&payload).is_err() {
                    break;
                }
            }
        }
    });

    // The listener leaves the peer's close unanswered.
    let config = WsConfig::default().ping_interval(Duration::from_millis(50));
    let (ws, rx) = connect(port, config, false);
    assert_eq!(next(&rx), Ev::Open);
    assert_eq!(next(&rx), Ev::Closing(1001, "bye".into()));

    if let Ok(ev) = rx.recv_timeout(Duration::from_millis(400)) {
        panic!("unexpected event after peer close: {ev:?}");
    }
    assert_eq!(ws.state(), ConnectionState::Closing);
    ws.cancel();
}

#[test]
fn test_heartbeat_timeout_fails_connection() {
    let (frames_tx, frames_rx) = unbounded();
    let port = serve(move |mut conn| {
        while let Some(frame) = conn.next() {
            let _ = frames_tx.send(frame);
        }
    });

    let config = WsConfig::default().ping_interval(Duration::from_millis(100));
    let (ws, rx) = connect(port, config, false);
    assert_eq!(next(&rx), Ev::Open);
    assert_eq!(
        next(&rx),
        Ev::Failure(
            "sent ping but didn't receive pong within 100ms (after 0 successful ping/pongs)"
                .into()
        )
    );
    assert_eq!(ws.state(), ConnectionState::Failed);

    // Exactly one ping was written and nothing after the failure.
    assert_eq!(frames_rx.recv_timeout(WAIT).unwrap(), Frame::Ping(Vec::new()));
    assert!(frames_rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn test_pong_suppressed_after_close_is_drained() {
    let (frames_tx, frames_rx) = unbounded();
    let (ping_tx, ping_rx) = unbounded::<()>();
    let port = serve(move |mut conn| {
        while let Some(frame) = conn.next() {
            let closed = matches!(frame, Frame::Close(..));
            let _ = frames_tx.send(frame);
            if closed {
                // Hold the close unanswered and ping once asked to.
                if ping_rx.recv_timeout(WAIT).is_ok() {
                    conn.writer.write_ping(b"late").unwrap();
                }
                while let Some(frame) = conn.next() {
                    let _ = frames_tx.send(frame);
                }
                return;
            }
        }
    });

    let (ws, rx) = connect(port, WsConfig::default(), false);
    assert_eq!(next(&rx), Ev::Open);
    assert!(ws.close(1000, None).unwrap());
    assert_eq!(
        frames_rx.recv_timeout(WAIT).unwrap(),
        Frame::Close(1000, String::new())
    );

    // Our close frame has left the queue.
    assert!(!ws.pong(b"x"));

    ping_tx.send(()).unwrap();
    assert!(frames_rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(ws.received_ping_count(), 0);
    assert_eq!(ws.state(), ConnectionState::Closing);
    ws.cancel();
}

// ── Failures ────────────────────────────────────────────────────────────

#[test]
fn test_masked_server_frame_fails_once() {
    let port = serve(|mut conn| {
        // A client must reject masked frames from the server.
        conn.raw
            .write_all(&[0x81, 0x81, 1, 2, 3, 4, b'x' ^ 1])
            .unwrap();
        conn.drain();
    });

    let (ws, rx) = connect(port, WsConfig::default(), false);
    assert_eq!(next(&rx), Ev::Open);
    match next(&rx) {
        Ev::Failure(msg) => {
            assert!(msg.contains("Server-sent frames must not be masked."), "got: {msg}")
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!ws.send_text("x"));
    assert!(!ws.close(1000, None).unwrap());
    ws.cancel();
    assert_quiet(&rx);
}

#[test]
fn test_peer_disconnect_is_transport_failure() {
    let port = serve(|conn| drop(conn));
    let (ws, rx) = connect(port, WsConfig::default(), false);
    assert_eq!(next(&rx), Ev::Open);
    match next(&rx) {
        Ev::Failure(msg) => assert!(msg.contains("transport error"), "got: {msg}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(ws.state(), ConnectionState::Failed);
}
