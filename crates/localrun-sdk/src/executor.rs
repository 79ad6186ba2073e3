// Executor pipeline: the composable unit-of-work primitive every job stage is built on.
//
// A pipeline is a tree over a closed set of node kinds (leaf, sequence, guard,
// cleanup) interpreted by `Executor::run`. Each node runs against a mutable
// state value `S` and a shared `ExecContext` carrying cancellation and the
// job-error slot used by composite sub-pipelines.

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Raised when cancellation is observed at a combinator boundary.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline cancelled")]
    Cancelled,
}

/// Execution context shared by every unit of a pipeline run.
///
/// Cloning is cheap: the cancellation token and the job-error slot are shared.
#[derive(Clone, Default)]
pub struct ExecContext {
    cancel: CancellationToken,
    job_error: Option<Arc<Mutex<Option<anyhow::Error>>>>,
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("has_job_error_slot", &self.job_error.is_some())
            .finish()
    }
}

impl ExecContext {
    /// Create a context driven by the given cancellation token.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            job_error: None,
        }
    }

    /// The cancellation token observed by this context.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with `PipelineError::Cancelled` when cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled.into());
        }
        Ok(())
    }

    /// A context with a fresh, never-cancelled token that still shares the
    /// job-error slot. Cleanup branches run under it so teardown is never
    /// skipped by an earlier cancellation.
    pub fn detached(&self) -> Self {
        Self {
            cancel: CancellationToken::new(),
            job_error: self.job_error.clone(),
        }
    }

    /// A context carrying a new, empty job-error slot.
    pub fn with_job_error_container(&self) -> Self {
        Self {
            cancel: self.cancel.clone(),
            job_error: Some(Arc::new(Mutex::new(None))),
        }
    }

    /// Record an error as the job's error. The last recorded error wins.
    ///
    /// Without a job-error slot the error is only logged.
    pub fn set_job_error(&self, err: anyhow::Error) {
        match self.job_error {
            Some(ref slot) => {
                *slot.lock() = Some(err);
            }
            None => {
                tracing::warn!(target: "pipeline", "No job error container for: {:#}", err);
            }
        }
    }

    /// Take the recorded job error, leaving the slot empty.
    pub fn take_job_error(&self) -> Option<anyhow::Error> {
        self.job_error.as_ref().and_then(|slot| slot.lock().take())
    }

    /// Whether a job error has been recorded.
    pub fn has_job_error(&self) -> bool {
        self.job_error
            .as_ref()
            .map(|slot| slot.lock().is_some())
            .unwrap_or(false)
    }
}

/// Boxed leaf function: one asynchronous unit of work.
pub type UnitFn<S> = Box<
    dyn for<'a> Fn(&'a mut S, &'a ExecContext) -> BoxFuture<'a, Result<()>> + Send + Sync,
>;

/// Boxed guard predicate, evaluated when the guard is reached.
pub type Predicate<S> = Box<dyn Fn(&S, &ExecContext) -> bool + Send + Sync>;

/// A cancelable, composable unit of work over state `S`.
pub enum Executor<S> {
    /// A single asynchronous operation.
    Leaf(UnitFn<S>),
    /// Run children in order; the first failure aborts the rest.
    Sequence(Vec<Executor<S>>),
    /// Run the child only when the predicate holds at invocation time.
    Guard(Predicate<S>, Box<Executor<S>>),
    /// Run the cleanup child after the main child, whatever its result.
    Cleanup(Box<Executor<S>>, Box<Executor<S>>),
}

impl<S> fmt::Debug for Executor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Executor::Leaf(_) => write!(f, "Leaf"),
            Executor::Sequence(units) => f.debug_tuple("Sequence").field(units).finish(),
            Executor::Guard(_, unit) => f.debug_tuple("Guard").field(unit).finish(),
            Executor::Cleanup(unit, cleanup) => {
                f.debug_tuple("Cleanup").field(unit).field(cleanup).finish()
            }
        }
    }
}

impl<S: Send + 'static> Executor<S> {
    /// Wrap an async function as a leaf unit.
    pub fn unit<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a ExecContext) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        Executor::Leaf(Box::new(f))
    }

    /// A unit that always fails with the message.
    pub fn fail(message: impl Into<String>) -> Self {
        let message = message.into();
        Executor::unit(move |_, _| {
            let message = message.clone();
            async move { Err(anyhow::anyhow!(message)) }.boxed()
        })
    }

    /// Run the units in order.
    pub fn sequence(units: impl IntoIterator<Item = Executor<S>>) -> Self {
        Executor::Sequence(units.into_iter().collect())
    }

    /// Run `next` after `self` succeeds.
    pub fn then(self, next: Executor<S>) -> Self {
        match self {
            Executor::Sequence(mut units) => {
                units.push(next);
                Executor::Sequence(units)
            }
            other => Executor::Sequence(vec![other, next]),
        }
    }

    /// Always run `cleanup` after `self`.
    pub fn finally(self, cleanup: Executor<S>) -> Self {
        Executor::Cleanup(Box::new(self), Box::new(cleanup))
    }

    /// Run `self` only when `predicate` holds when the guard is reached.
    pub fn when<P>(self, predicate: P) -> Self
    where
        P: Fn(&S, &ExecContext) -> bool + Send + Sync + 'static,
    {
        Executor::Guard(Box::new(predicate), Box::new(self))
    }

    /// Run `self` only when `condition` is true.
    pub fn if_bool(self, condition: bool) -> Self {
        self.when(move |_, _| condition)
    }

    /// Interpret the pipeline against `state`.
    ///
    /// Cancellation is observed before each unit of a sequence and before a
    /// guard's predicate. A unit that has already started is never abandoned.
    pub fn run<'a>(&'a self, state: &'a mut S, ctx: &'a ExecContext) -> BoxFuture<'a, Result<()>> {
        async move {
            match self {
                Executor::Leaf(f) => f(state, ctx).await,
                Executor::Sequence(units) => {
                    for unit in units {
                        ctx.check_cancelled()?;
                        unit.run(state, ctx).await?;
                    }
                    Ok(())
                }
                Executor::Guard(predicate, unit) => {
                    ctx.check_cancelled()?;
                    if predicate(state, ctx) {
                        unit.run(state, ctx).await
                    } else {
                        Ok(())
                    }
                }
                Executor::Cleanup(unit, cleanup) => {
                    let result = unit.run(state, ctx).await;
                    let cleanup_ctx = ctx.detached();
                    let cleanup_result = cleanup.run(state, &cleanup_ctx).await;
                    match (result, cleanup_result) {
                        (Err(err), Err(cleanup_err)) => {
                            tracing::debug!(
                                target: "pipeline",
                                "Cleanup failed after an earlier failure: {:#}",
                                cleanup_err
                            );
                            Err(err)
                        }
                        (Err(err), Ok(())) => Err(err),
                        (Ok(()), cleanup_result) => cleanup_result,
                    }
                }
            }
        }
        .boxed()
    }
}
