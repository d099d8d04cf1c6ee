//! Step type and the apply dispatch shared by every step kind.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

use crate::queue::{QueueError, QueueHandle};

/// Type alias for synchronous step bodies.
type ValueFn<T> = Box<dyn FnOnce(&QueueHandle<T>, T) -> anyhow::Result<T> + Send>;

/// Type alias for step bodies that return a future.
type AsyncFn<T> =
    Box<dyn FnOnce(QueueHandle<T>, T) -> BoxFuture<'static, anyhow::Result<T>> + Send>;

/// Type alias for observer bodies.
type ObserverFn<T> = Box<dyn FnOnce(Option<&T>, Option<&QueueError>) + Send>;

/// Failure callback that can be attached to a step.
///
/// The scheduler stores it alongside the step but never calls it.
pub type FailureHook = Arc<dyn Fn(&QueueError) + Send + Sync>;

pub(crate) enum StepKind<T> {
    /// Transforms the value synchronously.
    Value(ValueFn<T>),
    /// Produces the next value from a future.
    Async(AsyncFn<T>),
    /// Sees the value (or the failure) without changing it.
    Observer(ObserverFn<T>),
}

impl<T> StepKind<T> {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Async(_) => "async",
            Self::Observer(_) => "observer",
        }
    }
}

/// A single unit of work in an [`OperationQueue`](crate::OperationQueue).
///
/// Build one with a constructor, optionally attach a description, then
/// hand it to [`QueueHandle::push`] or use the `then_*` shortcuts.
pub struct Step<T> {
    kind: StepKind<T>,
    description: Option<String>,
    failure_hook: Option<FailureHook>,
    /// 0 for steps queued from outside a run, parent depth + 1 for discoveries.
    pub(crate) depth: u32,
}

impl<T: Send + 'static> Step<T> {
    fn from_kind(kind: StepKind<T>) -> Self {
        Self {
            kind,
            description: None,
            failure_hook: None,
            depth: 0,
        }
    }

    /// Step that maps the current value to the next one.
    pub fn value<F>(f: F) -> Self
    where
        F: FnOnce(T) -> anyhow::Result<T> + Send + 'static,
    {
        Self::from_kind(StepKind::Value(Box::new(move |_, input| f(input))))
    }

    /// Step whose body receives the queue handle and may append further steps.
    ///
    /// Anything appended from inside the body runs right after this step,
    /// before the step that was queued next.
    pub fn nested<F>(f: F) -> Self
    where
        F: FnOnce(&QueueHandle<T>, T) -> anyhow::Result<T> + Send + 'static,
    {
        Self::from_kind(StepKind::Value(Box::new(f)))
    }

    /// Step that consumes the value and passes the neutral value on.
    pub fn void<F>(f: F) -> Self
    where
        T: Default,
        F: FnOnce(T) -> anyhow::Result<()> + Send + 'static,
    {
        Self::value(move |input| f(input).map(|()| T::default()))
    }

    /// Step that ignores its input and yields `value`.
    pub fn constant(value: T) -> Self {
        Self::value(move |_| Ok(value))
    }

    /// Step backed by an asynchronous function.
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::from_kind(StepKind::Async(Box::new(move |_, input| f(input).boxed())))
    }

    /// Asynchronous step that owns a queue handle.
    ///
    /// Appends made through the handle at any point before the returned
    /// future resolves are treated as discoveries of this step.
    pub fn future_nested<F, Fut>(f: F) -> Self
    where
        F: FnOnce(QueueHandle<T>, T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::from_kind(StepKind::Async(Box::new(move |handle, input| {
            f(handle, input).boxed()
        })))
    }

    /// Step that observes the outcome so far.
    ///
    /// On success it receives `(Some(value), None)` and the value is forwarded
    /// untouched. After a failure it receives `(None, Some(error))` and the
    /// failure still propagates.
    pub fn observer<F>(f: F) -> Self
    where
        F: FnOnce(Option<&T>, Option<&QueueError>) + Send + 'static,
    {
        Self::from_kind(StepKind::Observer(Box::new(f)))
    }

    /// Attach a human-readable description used in logs, errors and recording.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach a failure hook. Reserved; the scheduler does not invoke it.
    pub fn on_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&QueueError) + Send + Sync + 'static,
    {
        self.failure_hook = Some(Arc::new(hook));
        self
    }

    /// Description set with [`describe`](Self::describe), if any.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns true if a failure hook was attached.
    pub fn has_failure_hook(&self) -> bool {
        self.failure_hook.is_some()
    }

    /// Returns true for steps built with [`observer`](Self::observer).
    pub fn is_observer(&self) -> bool {
        matches!(self.kind, StepKind::Observer(_))
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    /// Label for logs and errors: the description, or the run position.
    pub(crate) fn label(&self, index: u32) -> String {
        match &self.description {
            Some(description) => description.clone(),
            None => format!("{} step #{}", self.kind.name(), index),
        }
    }

    /// Apply the step to `input`.
    ///
    /// Errors and panics from value and async bodies come back as the same
    /// `Err` channel. Observers always forward `input`.
    pub(crate) async fn apply(
        self,
        handle: &QueueHandle<T>,
        label: &str,
        input: T,
    ) -> Result<T, QueueError> {
        match self.kind {
            StepKind::Value(f) => match panic::catch_unwind(AssertUnwindSafe(|| f(handle, input))) {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(source)) => Err(QueueError::step_failed(label, source)),
                Err(payload) => Err(QueueError::step_panicked(label, panic_message(&*payload))),
            },
            StepKind::Async(f) => {
                let handle = handle.clone();
                let future = match panic::catch_unwind(AssertUnwindSafe(|| f(handle, input))) {
                    Ok(future) => future,
                    Err(payload) => {
                        return Err(QueueError::step_panicked(label, panic_message(&*payload)))
                    }
                };
                match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(source)) => Err(QueueError::step_failed(label, source)),
                    Err(payload) => Err(QueueError::step_panicked(label, panic_message(&*payload))),
                }
            }
            StepKind::Observer(f) => {
                if let Err(payload) =
                    panic::catch_unwind(AssertUnwindSafe(|| f(Some(&input), None)))
                {
                    warn!(step = label, panic = %panic_message(&*payload), "observer panicked");
                }
                Ok(input)
            }
        }
    }

    /// Deliver an upstream failure. Returns false for steps that are not observers.
    pub(crate) fn notify(self, label: &str, error: &QueueError) -> bool {
        match self.kind {
            StepKind::Observer(f) => {
                let notified = panic::catch_unwind(AssertUnwindSafe(|| f(None, Some(error))));
                if let Err(payload) = notified {
                    warn!(step = label, panic = %panic_message(&*payload), "observer panicked");
                }
                true
            }
            StepKind::Value(_) | StepKind::Async(_) => false,
        }
    }
}

impl<T> fmt::Debug for Step<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("kind", &self.kind.name())
            .field("description", &self.description)
            .field("failure_hook", &self.failure_hook.is_some())
            .field("depth", &self.depth)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
