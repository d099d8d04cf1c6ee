//! Operation queue, its handle, and the scheduler that drains it.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::recorder::{NoopRecorder, Recorder, RunId, RunStatus, StepId, StepInfo, StepStatus};
use crate::state::{Placement, QueueState};
use crate::step::Step;

/// Queue over dynamically typed JSON values. The neutral value is `Null`.
pub type JsonQueue = OperationQueue<serde_json::Value>;

/// Error returned by a queue run.
#[derive(Error, Debug)]
pub enum QueueError {
    /// A step returned an error.
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    /// A step panicked while being applied.
    #[error("step '{step}' panicked: {message}")]
    StepPanicked { step: String, message: String },

    /// Recording failed.
    #[error("recorder error: {0}")]
    RecorderError(#[from] anyhow::Error),
}

impl QueueError {
    pub(crate) fn step_failed(step: &str, source: anyhow::Error) -> Self {
        Self::StepFailed {
            step: step.to_string(),
            source,
        }
    }

    pub(crate) fn step_panicked(step: &str, message: String) -> Self {
        Self::StepPanicked {
            step: step.to_string(),
            message,
        }
    }

    /// Label of the step that caused the failure, if a step did.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepFailed { step, .. } | Self::StepPanicked { step, .. } => Some(step),
            Self::RecorderError(_) => None,
        }
    }

    /// Returns true if the failing step panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::StepPanicked { .. })
    }
}

/// Serializable view of what is still queued.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub active: Option<String>,
    pub active_index: Option<u32>,
    pub pending: Vec<PendingStep>,
}

/// A queued step in a [`QueueSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct PendingStep {
    pub position: usize,
    pub kind: &'static str,
    /// 0 for steps queued from outside a run, deeper for discoveries.
    pub depth: u32,
    pub description: Option<String>,
}

/// Cloneable handle for appending to a queue.
///
/// Step bodies receive one so they can enqueue follow-up work. While a step
/// is active every append lands in the insertion buffer and runs right
/// after that step; otherwise it goes to the end of the pipeline.
pub struct QueueHandle<T> {
    name: &'static str,
    state: Arc<Mutex<QueueState<T>>>,
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            state: self.state.clone(),
        }
    }
}

impl<T> fmt::Debug for QueueHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle").field("name", &self.name).finish()
    }
}

impl<T: Default + Send + 'static> QueueHandle<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    // Never held across an await or while a step body runs.
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Name of the owning queue.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append a prepared step.
    pub fn push(&self, step: Step<T>) -> &Self {
        let kind = step.kind_name();
        let nested = self.lock().push(step) == Placement::Buffer;
        trace!(queue = self.name, kind, nested, "step appended");
        self
    }

    /// Append a step mapping the value to a new one.
    pub fn then<F>(&self, f: F) -> &Self
    where
        F: FnOnce(T) -> anyhow::Result<T> + Send + 'static,
    {
        self.push(Step::value(f))
    }

    /// Append a step whose body may append further steps through the handle.
    pub fn then_nested<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&QueueHandle<T>, T) -> anyhow::Result<T> + Send + 'static,
    {
        self.push(Step::nested(f))
    }

    /// Append a step whose result is discarded; the neutral value flows on.
    pub fn then_do<F>(&self, f: F) -> &Self
    where
        F: FnOnce(T) -> anyhow::Result<()> + Send + 'static,
    {
        self.push(Step::void(f))
    }

    /// Append a step that ignores its input and yields `value`.
    pub fn then_value(&self, value: T) -> &Self {
        self.push(Step::constant(value))
    }

    /// Append an asynchronous step.
    pub fn then_async<F, Fut>(&self, f: F) -> &Self
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.push(Step::future(f))
    }

    /// Append an asynchronous step that can append further steps.
    pub fn then_async_nested<F, Fut>(&self, f: F) -> &Self
    where
        F: FnOnce(QueueHandle<T>, T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.push(Step::future_nested(f))
    }

    /// Append an observer.
    pub fn observe<F>(&self, f: F) -> &Self
    where
        F: FnOnce(Option<&T>, Option<&QueueError>) + Send + 'static,
    {
        self.push(Step::observer(f))
    }

    /// Returns true while a step is being applied.
    pub fn is_active(&self) -> bool {
        self.lock().active().is_some()
    }

    /// Label of the step being applied, if any.
    pub fn active_step(&self) -> Option<String> {
        self.lock().active().map(|active| active.label.clone())
    }

    /// Number of steps waiting to run, including buffered discoveries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing is waiting to run.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Export the active step and what is queued, for diagnostics.
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.lock();
        QueueSnapshot {
            name: self.name.to_string(),
            active: state.active().map(|active| active.label.clone()),
            active_index: state.active().map(|active| active.index),
            pending: state.pending(),
        }
    }
}

/// An ordered queue of steps applied one at a time.
///
/// Steps appended before [`run`](Self::run) execute in FIFO order. Steps
/// appended while another step is active run immediately after it, ahead
/// of anything queued later. The first failure ends the run.
///
/// ```rust,ignore
/// let queue = OperationQueue::<Vec<u32>>::new("cascade");
/// queue
///     .then(|mut log| { log.push(1); Ok(log) })
///     .then_nested(|q, log| {
///         q.then(|mut log| { log.push(2); Ok(log) });
///         Ok(log)
///     })
///     .then(|mut log| { log.push(3); Ok(log) });
///
/// assert_eq!(queue.run().await?, vec![1, 2, 3]);
/// ```
pub struct OperationQueue<T> {
    handle: QueueHandle<T>,
    recorder: Arc<dyn Recorder>,
}

impl<T: Default + Send + 'static> OperationQueue<T> {
    /// Create an empty queue with the given name.
    pub fn new(name: &'static str) -> Self {
        Self {
            handle: QueueHandle::new(name),
            recorder: Arc::new(NoopRecorder),
        }
    }

    /// Set the recorder for this queue.
    pub fn with_recorder<R: Recorder + 'static>(mut self, recorder: R) -> Self {
        self.recorder = Arc::new(recorder);
        self
    }

    /// Name given to [`new`](Self::new).
    pub fn name(&self) -> &'static str {
        self.handle.name
    }

    /// A handle sharing this queue's state.
    pub fn handle(&self) -> QueueHandle<T> {
        self.handle.clone()
    }

    /// Append a prepared step.
    pub fn push(&self, step: Step<T>) -> &Self {
        self.handle.push(step);
        self
    }

    /// See [`QueueHandle::then`].
    pub fn then<F>(&self, f: F) -> &Self
    where
        F: FnOnce(T) -> anyhow::Result<T> + Send + 'static,
    {
        self.push(Step::value(f))
    }

    /// See [`QueueHandle::then_nested`].
    pub fn then_nested<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&QueueHandle<T>, T) -> anyhow::Result<T> + Send + 'static,
    {
        self.push(Step::nested(f))
    }

    /// See [`QueueHandle::then_do`].
    pub fn then_do<F>(&self, f: F) -> &Self
    where
        F: FnOnce(T) -> anyhow::Result<()> + Send + 'static,
    {
        self.push(Step::void(f))
    }

    /// See [`QueueHandle::then_value`].
    pub fn then_value(&self, value: T) -> &Self {
        self.push(Step::constant(value))
    }

    /// See [`QueueHandle::then_async`].
    pub fn then_async<F, Fut>(&self, f: F) -> &Self
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.push(Step::future(f))
    }

    /// See [`QueueHandle::then_async_nested`].
    pub fn then_async_nested<F, Fut>(&self, f: F) -> &Self
    where
        F: FnOnce(QueueHandle<T>, T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.push(Step::future_nested(f))
    }

    /// See [`QueueHandle::observe`].
    pub fn observe<F>(&self, f: F) -> &Self
    where
        F: FnOnce(Option<&T>, Option<&QueueError>) + Send + 'static,
    {
        self.push(Step::observer(f))
    }

    /// Number of steps waiting to run.
    pub fn len(&self) -> usize {
        self.handle.len()
    }

    /// Returns true if no step has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }

    /// Export what is queued, for diagnostics.
    pub fn snapshot(&self) -> QueueSnapshot {
        self.handle.snapshot()
    }

    /// Run the queue starting from the neutral value.
    pub async fn run(self) -> Result<T, QueueError> {
        self.run_with(T::default()).await
    }

    /// Run the queue starting from `initial`.
    ///
    /// Resolves with the last step's output once nothing is left, or with
    /// the first failure. After a failure, observers still queued are told
    /// about it and every other step is dropped without being applied.
    ///
    /// Recorder failures on `start_run`/`start_step` abort the run. Failures
    /// while recording a completion are logged and never replace the outcome.
    pub async fn run_with(self, initial: T) -> Result<T, QueueError> {
        let name = self.handle.name;
        let run_id = self.recorder.start_run(name).await?;
        debug!(queue = name, queued = self.handle.len(), "run started");

        let drained = self.drain(run_id, initial).await;
        let status = match &drained.outcome {
            Ok(_) => RunStatus::Completed {
                applied: drained.applied,
            },
            Err(e) => RunStatus::Failed {
                error: e.to_string(),
                dropped: drained.dropped,
            },
        };
        if let Err(e) = self.recorder.complete_run(run_id, status).await {
            warn!(queue = name, error = %e, "failed to record run completion");
        }

        match &drained.outcome {
            Ok(_) => debug!(queue = name, applied = drained.applied, "run completed"),
            Err(e) => debug!(queue = name, error = %e, dropped = drained.dropped, "run failed"),
        }
        drained.outcome
    }

    async fn drain(&self, run_id: RunId, initial: T) -> Drained<T> {
        let name = self.handle.name;
        let mut value = initial;
        let mut index = 0u32;

        loop {
            let next = self.handle.lock().activate_next(index);
            let Some((step, info)) = next else {
                return Drained {
                    outcome: Ok(value),
                    applied: index,
                    dropped: 0,
                };
            };

            let step_id = match self.recorder.start_step(run_id, &info).await {
                Ok(step_id) => step_id,
                Err(e) => {
                    // the popped step never ran and counts as dropped
                    self.handle.lock().settle();
                    let error = QueueError::from(e);
                    let dropped = 1 + self.notify_observers(&error, index + 1);
                    return Drained {
                        outcome: Err(error),
                        applied: index,
                        dropped,
                    };
                }
            };

            debug!(queue = name, step = %info.label, index, depth = info.depth, "applying step");
            let outcome = step.apply(&self.handle, &info.label, value).await;

            let spliced = self.handle.lock().settle();
            if spliced > 0 {
                trace!(queue = name, step = %info.label, spliced, "spliced nested steps");
            }
            index += 1;

            let status = match &outcome {
                Ok(_) => StepStatus::Completed { spliced },
                Err(e) => StepStatus::Failed {
                    error: e.to_string(),
                },
            };
            match outcome {
                Ok(output) => value = output,
                Err(error) => {
                    let dropped = self.notify_observers(&error, index);
                    self.record_step(step_id, status, &info).await;
                    return Drained {
                        outcome: Err(error),
                        applied: index,
                        dropped,
                    };
                }
            }
            self.record_step(step_id, status, &info).await;
        }
    }

    async fn record_step(&self, step_id: StepId, status: StepStatus, info: &StepInfo) {
        if let Err(e) = self.recorder.complete_step(step_id, status).await {
            warn!(
                queue = self.handle.name,
                step = %info.label,
                error = %e,
                "failed to record step completion"
            );
        }
    }

    /// Deliver `error` to remaining observers and drop everything else.
    ///
    /// Returns the number of dropped steps.
    fn notify_observers(&self, error: &QueueError, mut index: u32) -> usize {
        let remaining = self.handle.lock().take_remaining();
        let mut dropped = 0usize;
        for step in remaining {
            let label = step.label(index);
            if !step.notify(&label, error) {
                dropped += 1;
            }
            index += 1;
        }
        if dropped > 0 {
            debug!(queue = self.handle.name, dropped, "dropped steps after failure");
        }
        dropped
    }
}

/// Outcome of draining the pipeline, with counts for the recorder.
struct Drained<T> {
    outcome: Result<T, QueueError>,
    applied: u32,
    dropped: usize,
}

impl<T> fmt::Debug for OperationQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationQueue")
            .field("name", &self.handle.name)
            .finish()
    }
}
