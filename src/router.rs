//! Message routing: classify an inbound envelope by its type tag and run
//! the registered handler.
//!
//! The router owns nothing but the handler table. Lookup is synchronous;
//! handler bodies are async and are NOT serialized against each other —
//! two messages from the same connection may be in flight at once, so
//! handlers needing per-connection ordering must arrange it themselves.
//!
//! Failure containment is the point of this module: an unknown type is a
//! routing outcome, not an error; a handler `Err` or panic is caught at the
//! dispatch boundary and turned into an `error` message for the one
//! originating peer. Nothing escapes to tear down the connection or the
//! process.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;

use crate::protocol::Envelope;
use crate::registry::{Connection, ConnectionRegistry};

/// Everything a handler may need, passed explicitly — no ambient globals.
#[derive(Clone)]
pub struct HandlerContext {
    /// The connection the message arrived on. Replies go here.
    pub connection: Connection,
    /// The registry, for handlers that fan out (e.g. broadcast).
    pub registry: ConnectionRegistry,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Failed(String),
}

/// A handler returns an optional reply for the originating connection.
pub type HandlerResult = Result<Option<Envelope>, HandlerError>;

type Handler = Arc<dyn Fn(HandlerContext, Envelope) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Result of one dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivered: bool,
    pub reason: Option<&'static str>,
}

impl DispatchOutcome {
    fn ok() -> Self {
        Self { delivered: true, reason: None }
    }

    fn unknown_type() -> Self {
        Self { delivered: false, reason: Some("unknown_type") }
    }

    fn handler_failed() -> Self {
        Self { delivered: false, reason: Some("handler_error") }
    }

    pub fn is_unknown_type(&self) -> bool {
        self.reason == Some("unknown_type")
    }
}

/// Dispatch table over a registration-time-extensible set of message kinds.
#[derive(Clone, Default)]
pub struct MessageRouter {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a message type. Re-registering a type
    /// replaces the previous handler.
    pub fn register<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(HandlerContext, Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx, env| handler(ctx, env).boxed());
        self.handlers.write().insert(kind.into(), handler);
    }

    /// Number of registered message types.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route one envelope.
    ///
    /// The table lookup is synchronous; only the handler body awaits. On a
    /// miss this logs and returns an `unknown_type` outcome — the caller
    /// decides whether to notify the peer. A handler `Err` or panic is
    /// converted into an `error` message queued to the originating
    /// connection and never propagates.
    pub async fn dispatch(&self, ctx: HandlerContext, envelope: Envelope) -> DispatchOutcome {
        let handler = self.handlers.read().get(&envelope.kind).cloned();
        let Some(handler) = handler else {
            tracing::debug!(kind = %envelope.kind, "no handler for message type");
            return DispatchOutcome::unknown_type();
        };

        let kind = envelope.kind.clone();
        let fut = handler(ctx.clone(), envelope);
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(Some(reply))) => {
                ctx.connection.try_send(reply);
                DispatchOutcome::ok()
            }
            Ok(Ok(None)) => DispatchOutcome::ok(),
            Ok(Err(e)) => {
                tracing::warn!(kind = %kind, error = %e, "handler failed");
                ctx.connection.try_send(Envelope::error(format!("{kind}: {e}")));
                DispatchOutcome::handler_failed()
            }
            Err(panic) => {
                tracing::error!(
                    kind = %kind,
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                );
                ctx.connection
                    .try_send(Envelope::error(format!("{kind} failed internally")));
                DispatchOutcome::handler_failed()
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
