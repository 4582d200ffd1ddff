//! Method table for a worker.
//!
//! Exact method-name lookup first, then an optional fallback that also
//! receives the method name. Handlers only see their arguments.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

/// Future returned by a handler invocation.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

type MethodFn = Arc<dyn Fn(Option<Value>) -> HandlerFuture + Send + Sync>;
type FallbackFn = Arc<dyn Fn(String, Option<Value>) -> HandlerFuture + Send + Sync>;

/// What a method name resolved to.
#[derive(Clone)]
pub enum Handler {
    /// A handler registered under the exact method name.
    Method(MethodFn),
    /// The fallback handler.
    Fallback(FallbackFn),
}

impl Handler {
    pub fn call(&self, method: &str, args: Option<Value>) -> HandlerFuture {
        match self {
            Handler::Method(f) => f(args),
            Handler::Fallback(f) => f(method.to_string(), args),
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Method(_) => f.write_str("Handler::Method"),
            Handler::Fallback(_) => f.write_str("Handler::Fallback"),
        }
    }
}

#[derive(Clone, Default)]
pub struct Handlers {
    methods: HashMap<String, MethodFn>,
    fallback: Option<FallbackFn>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler for `name`.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: MethodFn = Arc::new(move |args| f(args).boxed());
        self.methods.insert(name.into(), handler);
        self
    }

    /// Register a synchronous handler for `name`.
    pub fn sync_method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.method(name, move |args| std::future::ready(f(args)))
    }

    /// Handler for any method without an exact match.
    pub fn fallback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: FallbackFn = Arc::new(move |method, args| f(method, args).boxed());
        self.fallback = Some(handler);
        self
    }

    pub fn resolve(&self, method: &str) -> Option<Handler> {
        if let Some(f) = self.methods.get(method) {
            return Some(Handler::Method(Arc::clone(f)));
        }
        self.fallback.as_ref().map(|f| Handler::Fallback(Arc::clone(f)))
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty() && self.fallback.is_none()
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<_> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("Handlers")
            .field("methods", &methods)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
