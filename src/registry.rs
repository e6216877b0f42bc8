//! Method registry
//!
//! Maps Ethereum JSON-RPC method names to handler values. Populated once
//! at startup and immutable afterwards; dispatch never mutates it.

use crate::rpc::JsonRpcError;
use crate::subscriptions::SubscriptionSession;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Per-request context threaded into every handler.
#[derive(Clone, Default)]
pub struct RequestContext {
    /// Absolute deadline inherited from the HTTP layer. Upstream calls and
    /// backoff sleeps abort when it fires.
    pub deadline: Option<Instant>,

    /// The WebSocket session behind this request, when there is one.
    /// Subscription handlers refuse to run without it.
    pub session: Option<Arc<SubscriptionSession>>,
}

impl RequestContext {
    /// Context for a plain HTTP request with the given deadline.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            session: None,
        }
    }
}

/// One Ethereum method translation.
///
/// Implementations are stateless or guard their state internally; the
/// registry invokes them concurrently.
#[async_trait]
pub trait EthHandler: Send + Sync {
    /// The JSON-RPC method this handler serves, e.g. `eth_blockNumber`.
    fn method(&self) -> &'static str;

    /// Translate the request, calling upstream as needed.
    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("method already registered: {0}")]
    Duplicate(String),
}

/// The method table. Build with [`MethodRegistry::register`], then treat
/// as read-only.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: HashMap<&'static str, Arc<dyn EthHandler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. Registering the same method twice is a startup bug
    /// and fails loudly.
    pub fn register(&mut self, handler: Arc<dyn EthHandler>) -> Result<(), RegistryError> {
        let method = handler.method();
        if self.handlers.contains_key(method) {
            return Err(RegistryError::Duplicate(method.to_string()));
        }
        self.handlers.insert(method, handler);
        Ok(())
    }

    /// Look up and invoke the handler for `method`.
    pub async fn dispatch(
        &self,
        method: &str,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        match self.handlers.get(method) {
            Some(handler) => handler.handle(params, ctx).await,
            None => Err(JsonRpcError::method_not_found(method)),
        }
    }

    /// Whether `method` has a handler.
    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl EthHandler for Echo {
        fn method(&self) -> &'static str {
            "eth_echo"
        }

        async fn handle(
            &self,
            params: &JsonValue,
            _ctx: &RequestContext,
        ) -> Result<JsonValue, JsonRpcError> {
            Ok(params.clone())
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let mut registry = MethodRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();

        let ctx = RequestContext::default();
        let result = registry
            .dispatch("eth_echo", &json!(["hello"]), &ctx)
            .await
            .unwrap();
        assert_eq!(result, json!(["hello"]));
    }

    #[tokio::test]
    async fn unknown_method_is_minus_32601_with_name() {
        let registry = MethodRegistry::new();
        let ctx = RequestContext::default();
        let err = registry
            .dispatch("eth_foo", &json!([]), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "method not found: eth_foo");
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = MethodRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let err = registry.register(Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(m) if m == "eth_echo"));
    }
}
