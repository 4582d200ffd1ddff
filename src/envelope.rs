//! Wire envelopes exchanged through the store.
//!
//! Both envelopes are positional MessagePack arrays:
//!
//! ```text
//! request:  [caller_id, request_id, expires_at, method, args?]
//! response: [request_id, status, result?]
//! ```
//!
//! The trailing optional field is left out of the array entirely when absent,
//! so it costs no bytes. `request_id` travels as a 6-byte bin.

use std::fmt;

use serde::de::{self, IgnoredAny, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::id::RequestId;
use crate::model::Status;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// Private response-channel identifier of the sender.
    pub caller_id: String,
    pub request_id: RequestId,
    /// Absolute deadline in milliseconds since [`crate::model::EPOCH_UNIX_MS`].
    pub expires_at: i64,
    pub method: String,
    pub args: Option<Value>,
}

impl RequestEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

impl Serialize for RequestEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = if self.args.is_some() { 5 } else { 4 };
        let mut tuple = serializer.serialize_tuple(len)?;
        tuple.serialize_element(&self.caller_id)?;
        tuple.serialize_element(&self.request_id)?;
        tuple.serialize_element(&self.expires_at)?;
        tuple.serialize_element(&self.method)?;
        if let Some(args) = &self.args {
            tuple.serialize_element(args)?;
        }
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for RequestEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_seq(RequestVisitor)
    }
}

struct RequestVisitor;

impl<'de> Visitor<'de> for RequestVisitor {
    type Value = RequestEnvelope;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a request array of 4 or 5 elements")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
        let caller_id = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let request_id = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
        let expires_at = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(2, &self))?;
        let method = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(3, &self))?;
        let args = seq.next_element::<Value>()?;
        if seq.next_element::<IgnoredAny>()?.is_some() {
            return Err(de::Error::invalid_length(6, &self));
        }
        Ok(RequestEnvelope {
            caller_id,
            request_id,
            expires_at,
            method,
            args,
        })
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub request_id: RequestId,
    /// Raw status code. Kept numeric so unknown codes survive decoding and
    /// can be reported as protocol errors.
    pub status: u32,
    pub result: Option<Value>,
}

impl ResponseEnvelope {
    pub fn success(request_id: RequestId, result: Value) -> Self {
        Self {
            request_id,
            status: Status::Success.code(),
            result: Some(result),
        }
    }

    pub fn rejected(request_id: RequestId) -> Self {
        Self::failure(request_id, Status::Rejected)
    }

    pub fn unknown_method(request_id: RequestId) -> Self {
        Self::failure(request_id, Status::UnknownMethod)
    }

    fn failure(request_id: RequestId, status: Status) -> Self {
        Self {
            request_id,
            status: status.code(),
            result: None,
        }
    }

    pub fn status(&self) -> Option<Status> {
        Status::from_code(self.status)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

impl Serialize for ResponseEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = if self.result.is_some() { 3 } else { 2 };
        let mut tuple = serializer.serialize_tuple(len)?;
        tuple.serialize_element(&self.request_id)?;
        tuple.serialize_element(&self.status)?;
        if let Some(result) = &self.result {
            tuple.serialize_element(result)?;
        }
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for ResponseEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_seq(ResponseVisitor)
    }
}

struct ResponseVisitor;

impl<'de> Visitor<'de> for ResponseVisitor {
    type Value = ResponseEnvelope;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a response array of 2 or 3 elements")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
        let request_id = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let status = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
        let result = seq.next_element::<Value>()?;
        if seq.next_element::<IgnoredAny>()?.is_some() {
            return Err(de::Error::invalid_length(4, &self));
        }
        Ok(ResponseEnvelope {
            request_id,
            status,
            result,
        })
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

fn encode<T: Serialize>(envelope: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(envelope).map_err(|e| Error::Other(format!("encode envelope: {e}")))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::MalformedEnvelope(e.to_string()))
}
