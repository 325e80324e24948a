//! Classification of inbound WebSocket messages and construction of echo replies.
//!
//! The library hands us whole messages (fragments already reassembled),
//! so the echo path only needs to know whether a message carries data
//! and, if so, whether it was text or binary.

use std::string::FromUtf8Error;
use tokio_tungstenite::tungstenite::Message;

/// Text/binary classification of a data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// What the session should do with a message it just read.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// A data message to echo.
    Data { kind: FrameKind, payload: Vec<u8> },
    /// Ping/pong. Pings are answered by the library on the next I/O call.
    Control,
    /// The peer started the closing handshake.
    Close,
}

impl Inbound {
    pub fn classify(message: Message) -> Self {
        match message {
            Message::Text(text) => Inbound::Data {
                kind: FrameKind::Text,
                payload: text.into_bytes(),
            },
            Message::Binary(payload) => Inbound::Data {
                kind: FrameKind::Binary,
                payload,
            },
            Message::Close(_) => Inbound::Close,
            // Raw frames are never produced by a read.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Inbound::Control,
        }
    }
}

/// Build the reply for `payload` with the same classification it arrived with.
///
/// Text payloads were valid UTF-8 on arrival, so the conversion only fails
/// if the buffer was altered in between.
pub fn echo_reply(kind: FrameKind, payload: Vec<u8>) -> Result<Message, FromUtf8Error> {
    match kind {
        FrameKind::Text => String::from_utf8(payload).map(Message::Text),
        FrameKind::Binary => Ok(Message::Binary(payload)),
    }
}
