//! Wire frame shape and msgid allocation.
//!
//! `Frame` mirrors the MessagePack-RPC positional tuples exactly: a request
//! is `[0, msgid, method, params]`, a response is `[1, msgid, error, result]`,
//! a notification is `[2, method, params]`. The `Serialize`/`Deserialize`
//! impls below are hand-written rather than derived, because deriving on an
//! enum with named fields would emit a map or a differently-shaped
//! representation; the wire format requires the bare tagged tuple.

use rmpv::Value;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const MSGTYPE_REQUEST: u8 = 0;
pub const MSGTYPE_RESPONSE: u8 = 1;
pub const MSGTYPE_NOTIFICATION: u8 = 2;

/// A single value or array of values; notification/request params are
/// normalized to an array so positional dispatch always has a slice to
/// index into, matching the "params normalized to an array if scalar" rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Params(pub Value);

impl Params {
    pub fn new(value: Value) -> Self {
        match value {
            Value::Array(_) => Params(value),
            other => Params(Value::Array(vec![other])),
        }
    }

    pub fn as_slice(&self) -> &[Value] {
        match &self.0 {
            Value::Array(items) => items.as_slice(),
            _ => unreachable!("Params always normalizes to an array"),
        }
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// One decoded or to-be-encoded MessagePack-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request {
        msgid: u32,
        method: String,
        params: Params,
    },
    Response {
        msgid: u32,
        error: Value,
        result: Value,
    },
    Notification {
        method: String,
        params: Params,
    },
}

impl Frame {
    pub fn request(msgid: u32, method: impl Into<String>, params: Value) -> Self {
        Frame::Request {
            msgid,
            method: method.into(),
            params: Params::new(params),
        }
    }

    pub fn response_ok(msgid: u32, result: Value) -> Self {
        Frame::Response {
            msgid,
            error: Value::Nil,
            result,
        }
    }

    pub fn response_err(msgid: u32, error: Value) -> Self {
        Frame::Response {
            msgid,
            error,
            result: Value::Nil,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Frame::Notification {
            method: method.into(),
            params: Params::new(params),
        }
    }
}

impl Serialize for Frame {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Frame::Request {
                msgid,
                method,
                params,
            } => {
                let mut tup = serializer.serialize_tuple(4)?;
                tup.serialize_element(&MSGTYPE_REQUEST)?;
                tup.serialize_element(msgid)?;
                tup.serialize_element(method)?;
                tup.serialize_element(&params.0)?;
                tup.end()
            }
            Frame::Response {
                msgid,
                error,
                result,
            } => {
                let mut tup = serializer.serialize_tuple(4)?;
                tup.serialize_element(&MSGTYPE_RESPONSE)?;
                tup.serialize_element(msgid)?;
                tup.serialize_element(error)?;
                tup.serialize_element(result)?;
                tup.end()
            }
            Frame::Notification { method, params } => {
                let mut tup = serializer.serialize_tuple(3)?;
                tup.serialize_element(&MSGTYPE_NOTIFICATION)?;
                tup.serialize_element(method)?;
                tup.serialize_element(&params.0)?;
                tup.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(FrameVisitor)
    }
}

struct FrameVisitor;

impl<'de> Visitor<'de> for FrameVisitor {
    type Value = Frame;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a MessagePack-RPC message tuple")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Frame, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let msgtype: u8 = seq
            .next_element()?
            .ok_or_else(|| de::Error::custom("empty message tuple"))?;

        match msgtype {
            MSGTYPE_REQUEST => {
                let msgid: u32 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::custom("request missing msgid"))?;
                let method: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::custom("request missing method"))?;
                let params: Value = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::custom("request missing params"))?;
                Ok(Frame::Request {
                    msgid,
                    method,
                    params: Params::new(params),
                })
            }
            MSGTYPE_RESPONSE => {
                let msgid: u32 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::custom("response missing msgid"))?;
                let error: Value = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::custom("response missing error slot"))?;
                let result: Value = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::custom("response missing result slot"))?;
                Ok(Frame::Response {
                    msgid,
                    error,
                    result,
                })
            }
            MSGTYPE_NOTIFICATION => {
                let method: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::custom("notification missing method"))?;
                let params: Value = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::custom("notification missing params"))?;
                Ok(Frame::Notification {
                    method,
                    params: Params::new(params),
                })
            }
            other => Err(de::Error::custom(format!(
                "unknown message type tag: {other}"
            ))),
        }
    }
}

/// Monotonic per-engine msgid allocator, starting at 1 and wrapping on
/// overflow. Collisions with outstanding requests are not checked — the
/// spec accepts them as practically impossible given outstanding counts.
#[derive(Debug, Default)]
pub struct MsgIdAllocator(u32);

impl MsgIdAllocator {
    pub fn new() -> Self {
        MsgIdAllocator(0)
    }

    pub fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_add(1);
        self.0
    }
}
