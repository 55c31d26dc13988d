//! Mesh WebSocket client engine.
//!
//! Turns an upgraded byte stream into RFC 6455 frames and back, and runs the
//! connection lifecycle on top: upgrade handshake, outgoing queue with
//! backpressure, ping/pong heartbeats and the close handshake.
//!
//! ## Modules
//!
//! - [`protocol`]: Opcodes, header bits, length forms, close codes, masking
//! - [`reader`]: Frame decoder and message reassembly
//! - [`writer`]: Frame encoder and fragmenting message sink
//! - [`handshake`]: Client side of the HTTP/1.1 upgrade
//! - [`heartbeat`]: Ping/pong liveness tracking
//! - [`stream`]: Transport split into reader half, writer half and control
//! - [`connection`]: The engine itself ([`WebSocket`], [`WsListener`])
//! - [`config`]: Tunables, loadable from TOML
//!
//! ## Example
//!
//! ```no_run
//! use mesh_ws::{TcpConnector, UpgradeRequest, WebSocket, WsConfig, WsListener};
//!
//! struct Print;
//! impl WsListener for Print {
//!     fn on_text(&self, _ws: &WebSocket, text: String) {
//!         println!("{text}");
//!     }
//! }
//!
//! let ws = WebSocket::connect(
//!     TcpConnector::new("127.0.0.1:9000"),
//!     UpgradeRequest::new("127.0.0.1:9000", "/chat"),
//!     WsConfig::default(),
//!     Print,
//! )?;
//! ws.send_text("hello");
//! ws.close(1000, Some("done"))?;
//! # Ok::<(), mesh_ws::WsError>(())
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod heartbeat;
pub mod protocol;
pub mod reader;
pub mod stream;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

pub use config::WsConfig;
pub use connection::{ConnectionState, WebSocket, WsListener};
pub use error::{Result, WsError};
pub use handshake::{UpgradeRequest, UpgradeResponse};
pub use protocol::{CloseCode, Opcode, Role};
pub use stream::{StreamControl, Streams, TcpConnector, Transport};
