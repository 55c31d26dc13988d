//! Shared fixtures for unit tests.

use crate::reader::FrameCallback;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(u16, String),
}

/// Records reader callbacks in arrival order.
#[derive(Default)]
pub struct Recorder {
    pub events: Vec<Event>,
}

impl FrameCallback for Recorder {
    fn on_read_text(&mut self, text: String) {
        self.events.push(Event::Text(text));
    }

    fn on_read_binary(&mut self, bytes: Vec<u8>) {
        self.events.push(Event::Binary(bytes));
    }

    fn on_read_ping(&mut self, payload: Vec<u8>) {
        self.events.push(Event::Ping(payload));
    }

    fn on_read_pong(&mut self, payload: Vec<u8>) {
        self.events.push(Event::Pong(payload));
    }

    fn on_read_close(&mut self, code: u16, reason: String) {
        self.events.push(Event::Close(code, reason));
    }
}
