//! Method registration and inbound dispatch contract.
//!
//! The original distinguishes a method that wants the calling `msgid`
//! from one that doesn't by inspecting the method's parameter list at
//! runtime. This crate replaces that with explicit opt-in registration:
//! `wants_msgid` is recorded once, at `register` time, and no reflection
//! ever runs on the hot path.

use crate::conn::ConnectionId;
use async_trait::async_trait;
use rmpv::Value;

/// A single exposed operation. `call` returns `Ok(result)` for success or
/// `Err(payload)` for a user-method failure; the engine turns the latter
/// into a response-error slot, never a panic. `conn` identifies the
/// calling connection, needed by methods like `subscribe` that register
/// the caller itself rather than an explicit argument.
#[async_trait]
pub trait RemoteMethod: Send + Sync {
    async fn call(&self, conn: ConnectionId, msgid: Option<u32>, params: &[Value]) -> Result<Value, Value>;

    /// Expected positional argument count, if fixed. `None` accepts any
    /// arity (the method itself is responsible for validating params).
    fn arity(&self) -> Option<usize> {
        None
    }
}

/// Outcome of dispatching one inbound request to a resolver.
pub enum DispatchOutcome {
    Result(Value),
    UserError(Value),
    UnknownMethod,
    WrongArity,
}

/// What the engine calls into to resolve inbound requests and
/// notifications. Implemented by `server::Dispatcher`; a pure client
/// engine has no resolver and treats every inbound request as unknown.
#[async_trait]
pub trait MethodResolver: Send + Sync {
    async fn dispatch_request(
        &self,
        conn: ConnectionId,
        msgid: u32,
        method: &str,
        params: &[Value],
    ) -> DispatchOutcome;

    async fn dispatch_notification(&self, conn: ConnectionId, method: &str, params: &[Value]);
}

/// A resolver with nothing registered; inbound requests are reported as
/// unknown methods, matching `MsgpackClientFactory.getRemoteMethod`
/// raising on the client side of the original.
pub struct NullResolver;

#[async_trait]
impl MethodResolver for NullResolver {
    async fn dispatch_request(
        &self,
        _conn: ConnectionId,
        _msgid: u32,
        _method: &str,
        _params: &[Value],
    ) -> DispatchOutcome {
        DispatchOutcome::UnknownMethod
    }

    async fn dispatch_notification(&self, _conn: ConnectionId, _method: &str, _params: &[Value]) {}
}
