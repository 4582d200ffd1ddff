//! NOTIFY payload framing.
//!
//! Postgres caps a NOTIFY payload at 8000 bytes of text. Small messages ride
//! inline as hex; anything larger is written to `tasq_message` and only its
//! row id is sent.

use crate::error::{Error, Result};

/// Largest NOTIFY payload Postgres accepts, in bytes.
pub const MAX_NOTIFY_PAYLOAD: usize = 7999;

/// Largest NOTIFY channel name Postgres accepts (NAMEDATALEN - 1).
pub const MAX_CHANNEL_LEN: usize = 63;

const INLINE: char = 'x';
const STORED: char = 'r';

/// What a NOTIFY payload on a tasq channel carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The message itself.
    Inline(Vec<u8>),
    /// Id of the `tasq_message` row holding the message.
    Stored(i64),
}

impl Notification {
    /// Whether `payload` fits inline once hex encoded.
    pub fn fits_inline(payload: &[u8]) -> bool {
        1 + payload.len() * 2 <= MAX_NOTIFY_PAYLOAD
    }

    pub fn encode(&self) -> String {
        match self {
            Notification::Inline(payload) => format!("{INLINE}{}", hex::encode(payload)),
            Notification::Stored(id) => format!("{STORED}{id}"),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let malformed = |detail: String| Error::Protocol(format!("bad notification: {detail}"));
        let mut chars = text.chars();
        match chars.next() {
            Some(INLINE) => hex::decode(chars.as_str())
                .map(Notification::Inline)
                .map_err(|e| malformed(e.to_string())),
            Some(STORED) => chars
                .as_str()
                .parse()
                .map(Notification::Stored)
                .map_err(|e| malformed(format!("row id: {e}"))),
            _ => Err(malformed(format!("unknown tag in {text:?}"))),
        }
    }
}
