//! Handler abstraction for registered RPCs.

use crate::context::ServerContext;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// A unit of execution invoked for each call routed to this participant.
///
/// The handler owns the [`ServerContext`] and is expected to end the call
/// with [`ServerContext::finish`]. Handlers run on tokio worker tasks, never
/// on the connection's I/O loop.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn call(&self, context: ServerContext, args: Value);
}

/// Adapter turning an async closure into an [`RpcHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> RpcHandler for FnHandler<F>
where
    F: Fn(ServerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn call(&self, context: ServerContext, args: Value) {
        (self.f)(context, args).await
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```rust,ignore
/// let add = handler_fn(|mut ctx, args| async move {
///     let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
///     let _ = ctx.finish(RpcResult::ok(json!({ "sum": sum })));
/// });
/// connection.register("math.add", 100, add).await?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RpcHandler>
where
    F: Fn(ServerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Identity of a handler instance, used to reject duplicate registrations.
pub(crate) fn same_handler(a: &Arc<dyn RpcHandler>, b: &Arc<dyn RpcHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
