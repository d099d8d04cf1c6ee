//! Recording interface for queue runs.

use async_trait::async_trait;

/// Unique identifier for a queue run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(pub i64);

/// Unique identifier for an applied step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepId(pub i64);

/// What a recorder learns about a step when it becomes active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInfo {
    /// Description, or `"<kind> step #<index>"`.
    pub label: String,
    /// `"value"`, `"async"` or `"observer"`.
    pub kind: &'static str,
    /// Position in application order, counting only applied steps.
    pub index: u32,
    /// 0 for steps queued before the run; each discovery is one deeper than
    /// the step that appended it.
    pub depth: u32,
}

impl StepInfo {
    /// Returns true if another step discovered this one mid-run.
    pub fn is_nested(&self) -> bool {
        self.depth > 0
    }
}

/// Final status of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// The queue drained; `applied` steps ran, nested discoveries included.
    Completed { applied: u32 },
    /// A step rejected; `dropped` queued steps were discarded unapplied.
    Failed { error: String, dropped: usize },
}

/// How an applied step settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// Fulfilled; `spliced` steps it discovered were moved to the queue head.
    Completed { spliced: usize },
    /// Rejected or panicked.
    Failed { error: String },
}

/// Records queue execution for observability.
///
/// Only steps that are actually applied are recorded; steps dropped after a
/// failure show up in [`RunStatus::Failed`] as a count. A failing `start_*`
/// call aborts the run, while failing `complete_*` calls are logged and
/// leave the run's outcome untouched.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Record the start of a run.
    async fn start_run(&self, queue_name: &str) -> anyhow::Result<RunId>;

    /// Record that a step became active.
    async fn start_step(&self, run_id: RunId, step: &StepInfo) -> anyhow::Result<StepId>;

    /// Record step settlement, after its discoveries were spliced.
    async fn complete_step(&self, step_id: StepId, status: StepStatus) -> anyhow::Result<()>;

    /// Record run completion.
    async fn complete_run(&self, run_id: RunId, status: RunStatus) -> anyhow::Result<()>;
}

/// A recorder that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopRecorder;

impl NoopRecorder {
    /// Create a new no-op recorder.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Recorder for NoopRecorder {
    async fn start_run(&self, _queue_name: &str) -> anyhow::Result<RunId> {
        Ok(RunId(0))
    }

    async fn start_step(&self, _run_id: RunId, _step: &StepInfo) -> anyhow::Result<StepId> {
        Ok(StepId(0))
    }

    async fn complete_step(&self, _step_id: StepId, _status: StepStatus) -> anyhow::Result<()> {
        Ok(())
    }

    async fn complete_run(&self, _run_id: RunId, _status: RunStatus) -> anyhow::Result<()> {
        Ok(())
    }
}
