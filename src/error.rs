//! Public error surface for the RPC runtime.
//!
//! Every error kind here corresponds to one of the seven failure categories
//! a connection can observe: a broken transport, a peer-returned error slot,
//! a malformed inbound message (split into request/response/generic-data
//! variants), a timer expiry, or an outbound encode failure.

use std::fmt;

/// Errors produced by the engine, transports and handlers.
///
/// `Response` carries the peer-supplied error value verbatim rather than a
/// stringified copy, since servers may put any MessagePack value there.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("remote returned an error: {0}")]
    Response(DisplayValue),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("request timed out")]
    Timeout,

    #[error("failed to serialize outbound message: {0}")]
    Serialization(String),
}

impl RpcError {
    pub fn response(value: rmpv::Value) -> Self {
        RpcError::Response(DisplayValue(value))
    }
}

/// Wraps `rmpv::Value` so it can sit behind `#[error(...)]`, which requires
/// `Display`, without forcing every caller to format the value itself.
#[derive(Debug, Clone)]
pub struct DisplayValue(pub rmpv::Value);

impl fmt::Display for DisplayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<rmpv::Value> for DisplayValue {
    fn from(value: rmpv::Value) -> Self {
        DisplayValue(value)
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
