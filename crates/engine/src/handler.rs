//! Task handler trait
//!
//! Each worker owns exactly one handler. The handler receives the opaque
//! payload, deserializes whatever shape it expects and returns a JSON result
//! or a classified [`TaskError`].

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::error::TaskError;
use crate::task::TaskContext;

/// Type-specific task execution
///
/// # Example
///
/// ```ignore
/// struct Echo;
///
/// #[async_trait]
/// impl TaskHandler for Echo {
///     async fn process(&self, _ctx: &TaskContext, payload: Value) -> Result<Value, TaskError> {
///         Ok(payload)
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Execute one attempt of a task
    async fn process(
        &self,
        ctx: &TaskContext,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError>;

    /// Operation name used for request statistics
    ///
    /// Defaults to the payload's `op` field.
    fn operation_of(&self, payload: &serde_json::Value) -> String {
        payload
            .get("op")
            .and_then(|op| op.as_str())
            .unwrap_or("task")
            .to_string()
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a [`TaskHandler`]
///
/// ```
/// use pixelforge_engine::handler_fn;
///
/// let handler = handler_fn(|_ctx, payload| async move { Ok(payload) });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(TaskContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F, Fut>
where
    F: Fn(TaskContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
{
    async fn process(
        &self,
        ctx: &TaskContext,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        (self.f)(ctx.clone(), payload).await
    }
}
