//! Active trace context for the current task and a context-preserving executor

use crate::messaging::context::TraceContext;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info_span, warn, Instrument};

tokio::task_local! {
    static CURRENT_CONTEXT: TraceContext;
}

/// Context active in the calling task, if one was installed
pub fn current_context() -> Option<TraceContext> {
    CURRENT_CONTEXT.try_with(Clone::clone).ok()
}

/// Run `fut` with `context` as the active trace context
pub async fn with_context<F: Future>(context: TraceContext, fut: F) -> F::Output {
    CURRENT_CONTEXT.scope(context, fut).await
}

/// Bounded task executor that carries the submitter's trace context.
///
/// Work submitted from a handler runs on another tokio task; without the
/// handoff the spawned task would lose the handler's trace position.
#[derive(Clone)]
pub struct ContextPropagatingExecutor {
    permits: Arc<Semaphore>,
    pool_size: usize,
}

impl ContextPropagatingExecutor {
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Spawn `task` with `context` installed for its whole lifetime
    pub fn spawn<F, T>(&self, context: TraceContext, task: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        let span = info_span!(
            "handoff",
            trace_id = %context.trace_id(),
            span_id = %context.span_id(),
        );

        tokio::spawn(
            async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!("Executor permits closed, running task unbounded");
                        None
                    }
                };
                with_context(context, task).await
            }
            .instrument(span),
        )
    }

    /// Spawn `task` with the caller's active context, or a new root if none
    pub fn spawn_current<F, T>(&self, task: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let context = current_context().unwrap_or_else(TraceContext::new_root);
        self.spawn(context, task)
    }
}
