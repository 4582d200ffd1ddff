//! Request and caller identifiers.

use std::fmt;

use rand::RngCore;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Length of a request id on the wire.
pub const REQUEST_ID_LEN: usize = 6;

/// Opaque per-request token. Encoded as raw bytes on the wire and as
/// lowercase hex when used as a map key or in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId([u8; REQUEST_ID_LEN]);

impl RequestId {
    /// Draw a fresh id from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; REQUEST_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; REQUEST_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; REQUEST_ID_LEN] = bytes.try_into().map_err(|_| {
            Error::MalformedEnvelope(format!(
                "request id must be {REQUEST_ID_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; REQUEST_ID_LEN] {
        &self.0
    }

    /// Stable string form, used as the correlation key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_bytes(RequestIdVisitor)
    }
}

struct RequestIdVisitor;

impl<'de> Visitor<'de> for RequestIdVisitor {
    type Value = RequestId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{REQUEST_ID_LEN} bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<RequestId, E> {
        let bytes: [u8; REQUEST_ID_LEN] = v
            .try_into()
            .map_err(|_| E::invalid_length(v.len(), &self))?;
        Ok(RequestId(bytes))
    }

    fn visit_borrowed_bytes<E: de::Error>(self, v: &'de [u8]) -> std::result::Result<RequestId, E> {
        self.visit_bytes(v)
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<RequestId, E> {
        self.visit_bytes(&v)
    }

    // Some encoders emit byte strings as integer arrays.
    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<RequestId, A::Error> {
        let mut bytes = [0u8; REQUEST_ID_LEN];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        if seq.next_element::<de::IgnoredAny>()?.is_some() {
            return Err(de::Error::invalid_length(REQUEST_ID_LEN + 1, &self));
        }
        Ok(RequestId(bytes))
    }
}

/// Fresh private identifier for a caller, optionally scoped by a namespace
/// (`{namespace}:{id}`).
pub fn caller_id(namespace: Option<&str>) -> String {
    let id = Uuid::new_v4().simple().to_string();
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}:{id}"),
        _ => id,
    }
}
