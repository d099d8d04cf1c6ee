//! Pipeline, insertion buffer and active marker of one queue.

use std::collections::VecDeque;

use crate::queue::PendingStep;
use crate::recorder::StepInfo;
use crate::step::Step;

/// The step currently being applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ActiveStep {
    pub index: u32,
    pub label: String,
    pub depth: u32,
}

/// Where an appended step ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    Pipeline,
    Buffer,
}

/// Mutable scheduling state. Only the owning queue and its handles touch it.
pub(crate) struct QueueState<T> {
    pipeline: VecDeque<Step<T>>,
    buffer: Vec<Step<T>>,
    active: Option<ActiveStep>,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            pipeline: VecDeque::new(),
            buffer: Vec::new(),
            active: None,
        }
    }
}

impl<T: Send + 'static> QueueState<T> {
    /// Append a step: to the buffer while a step is active, else to the pipeline.
    pub fn push(&mut self, mut step: Step<T>) -> Placement {
        match &self.active {
            Some(active) => {
                step.depth = active.depth + 1;
                self.buffer.push(step);
                Placement::Buffer
            }
            None => {
                self.pipeline.push_back(step);
                Placement::Pipeline
            }
        }
    }

    /// Pop the pipeline head and mark it active.
    pub fn activate_next(&mut self, index: u32) -> Option<(Step<T>, StepInfo)> {
        debug_assert!(self.active.is_none(), "a step is already active");
        let step = self.pipeline.pop_front()?;
        let info = StepInfo {
            label: step.label(index),
            kind: step.kind_name(),
            index,
            depth: step.depth,
        };
        self.active = Some(ActiveStep {
            index,
            label: info.label.clone(),
            depth: info.depth,
        });
        Some((step, info))
    }

    /// Splice buffered discoveries onto the pipeline head and clear the marker.
    ///
    /// Returns the number of spliced steps.
    pub fn settle(&mut self) -> usize {
        let spliced = self.buffer.len();
        for step in self.buffer.drain(..).rev() {
            self.pipeline.push_front(step);
        }
        self.active = None;
        spliced
    }

    /// Remove everything still queued, in execution order.
    pub fn take_remaining(&mut self) -> Vec<Step<T>> {
        self.settle();
        self.pipeline.drain(..).collect()
    }

    pub fn active(&self) -> Option<&ActiveStep> {
        self.active.as_ref()
    }

    pub fn len(&self) -> usize {
        self.pipeline.len() + self.buffer.len()
    }

    /// Queued steps in the order they would run if the active step settled now.
    pub fn pending(&self) -> Vec<PendingStep> {
        self.buffer
            .iter()
            .chain(self.pipeline.iter())
            .enumerate()
            .map(|(position, step)| PendingStep {
                position,
                kind: step.kind_name(),
                depth: step.depth,
                description: step.description().map(str::to_string),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labelled(name: &str) -> Step<i32> {
        Step::constant(0).describe(name)
    }

    fn order(state: &QueueState<i32>) -> Vec<String> {
        state
            .pending()
            .into_iter()
            .filter_map(|p| p.description)
            .collect()
    }

    #[test]
    fn test_push_while_idle_goes_to_pipeline() {
        let mut state = QueueState::default();
        assert_eq!(state.push(labelled("a")), Placement::Pipeline);
        assert_eq!(state.push(labelled("b")), Placement::Pipeline);
        assert_eq!(order(&state), vec!["a", "b"]);
    }

    #[test]
    fn test_push_while_active_goes_to_buffer() {
        let mut state = QueueState::default();
        state.push(labelled("a"));
        state.push(labelled("b"));

        let (_, info) = state.activate_next(0).unwrap();
        assert_eq!(info.label, "a");
        assert!(!info.is_nested());
        assert_eq!(state.active().map(|a| a.index), Some(0));

        assert_eq!(state.push(labelled("a.1")), Placement::Buffer);
        assert_eq!(state.push(labelled("a.2")), Placement::Buffer);
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn test_settle_splices_buffer_in_order_at_head() {
        let mut state = QueueState::default();
        state.push(labelled("a"));
        state.push(labelled("b"));
        state.activate_next(0).unwrap();
        state.push(labelled("a.1"));
        state.push(labelled("a.2"));

        assert_eq!(state.settle(), 2);
        assert!(state.active().is_none());
        assert_eq!(order(&state), vec!["a.1", "a.2", "b"]);

        // after settling, appends go back to the tail
        assert_eq!(state.push(labelled("c")), Placement::Pipeline);
        assert_eq!(order(&state), vec!["a.1", "a.2", "b", "c"]);
    }

    #[test]
    fn test_discoveries_are_one_level_deeper_than_their_parent() {
        let mut state = QueueState::default();
        state.push(labelled("a"));
        state.activate_next(0).unwrap();
        state.push(labelled("a.1"));
        state.settle();

        let (_, info) = state.activate_next(1).unwrap();
        assert_eq!(info.depth, 1);
        assert!(info.is_nested());
        state.push(labelled("a.1.1"));
        assert_eq!(state.pending()[0].depth, 2);
        state.settle();

        let (_, info) = state.activate_next(2).unwrap();
        assert_eq!((info.label.as_str(), info.depth), ("a.1.1", 2));
    }

    #[test]
    fn test_settle_without_discoveries() {
        let mut state = QueueState::default();
        state.push(labelled("a"));
        state.activate_next(0).unwrap();
        assert_eq!(state.settle(), 0);
        assert!(state.activate_next(1).is_none());
        assert!(state.active().is_none());
    }

    #[test]
    fn test_take_remaining_includes_buffer_first() {
        let mut state = QueueState::default();
        state.push(labelled("a"));
        state.push(labelled("b"));
        state.activate_next(0).unwrap();
        state.push(labelled("a.1"));

        let remaining: Vec<_> = state
            .take_remaining()
            .iter()
            .filter_map(|s| s.description().map(str::to_string))
            .collect();
        assert_eq!(remaining, vec!["a.1", "b"]);
        assert_eq!(state.len(), 0);
        assert!(state.active().is_none());
    }
}
