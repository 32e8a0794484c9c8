//! `remote_`-prefixed method exposure.
//!
//! The prefix convention is a *registration-time* naming rule: callers
//! strip it themselves (or call [`Dispatcher::register_prefixed`]) before
//! the wire method name ever reaches the dispatch table, so there is no
//! per-call string check on the hot path.

use crate::conn::ConnectionId;
use crate::resolver::{DispatchOutcome, MethodResolver, RemoteMethod};
use async_trait::async_trait;
use rmpv::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

const DEFAULT_PREFIX: &str = "remote_";

struct Registration {
    handler: Arc<dyn RemoteMethod>,
    wants_msgid: bool,
}

/// A table of exposed operations, keyed by wire method name.
#[derive(Default)]
pub struct Dispatcher {
    methods: HashMap<String, Registration>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            methods: HashMap::new(),
        }
    }

    /// Registers `handler` under `name`. `wants_msgid` decides whether the
    /// calling msgid is passed to `handler.call`, replacing the original's
    /// parameter-introspection trick with an explicit opt-in.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn RemoteMethod>, wants_msgid: bool) {
        self.methods.insert(
            name.into(),
            Registration {
                handler,
                wants_msgid,
            },
        );
    }

    /// Strips `remote_` (or a caller-supplied prefix) from `name` before
    /// registering, mirroring the original's attribute-name convention.
    pub fn register_prefixed(
        &mut self,
        name: &str,
        prefix: Option<&str>,
        handler: Arc<dyn RemoteMethod>,
        wants_msgid: bool,
    ) {
        let prefix = prefix.unwrap_or(DEFAULT_PREFIX);
        let wire_name = name.strip_prefix(prefix).unwrap_or(name);
        self.register(wire_name, handler, wants_msgid);
    }

    pub fn register_fn<F, Fut>(
        &mut self,
        name: impl Into<String>,
        arity: Option<usize>,
        wants_msgid: bool,
        func: F,
    ) where
        F: Fn(ConnectionId, Option<u32>, &[Value]) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        self.register(name, Arc::new(FnMethod { func, arity }), wants_msgid);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }
}

#[async_trait]
impl MethodResolver for Dispatcher {
    async fn dispatch_request(
        &self,
        conn: ConnectionId,
        msgid: u32,
        method: &str,
        params: &[Value],
    ) -> DispatchOutcome {
        let Some(reg) = self.methods.get(method) else {
            return DispatchOutcome::UnknownMethod;
        };

        if let Some(expected) = reg.handler.arity() {
            if params.len() != expected {
                return DispatchOutcome::WrongArity;
            }
        }

        let msgid_arg = reg.wants_msgid.then_some(msgid);
        match reg.handler.call(conn, msgid_arg, params).await {
            Ok(value) => DispatchOutcome::Result(value),
            Err(value) => DispatchOutcome::UserError(value),
        }
    }

    async fn dispatch_notification(&self, conn: ConnectionId, method: &str, params: &[Value]) {
        if let Some(reg) = self.methods.get(method) {
            let _ = reg.handler.call(conn, None, params).await;
        }
    }
}

struct FnMethod<F> {
    func: F,
    arity: Option<usize>,
}

#[async_trait]
impl<F, Fut> RemoteMethod for FnMethod<F>
where
    F: Fn(ConnectionId, Option<u32>, &[Value]) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, Value>> + Send,
{
    async fn call(&self, conn: ConnectionId, msgid: Option<u32>, params: &[Value]) -> Result<Value, Value> {
        (self.func)(conn, msgid, params).await
    }

    fn arity(&self) -> Option<usize> {
        self.arity
    }
}
