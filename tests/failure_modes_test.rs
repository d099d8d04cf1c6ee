//! Tests for fail-fast behavior and observer notification.

use opqueue::{OperationQueue, QueueError, Step};
use std::sync::{Arc, Mutex};

type Events = Arc<Mutex<Vec<String>>>;

fn events() -> Events {
    Arc::new(Mutex::new(Vec::new()))
}

fn mark(
    events: &Events,
    name: &'static str,
) -> impl FnOnce(u32) -> anyhow::Result<u32> + Send + 'static {
    let events = events.clone();
    move |value| {
        events.lock().unwrap().push(name.to_string());
        Ok(value + 1)
    }
}

fn snapshot(events: &Events) -> Vec<String> {
    events.lock().unwrap().clone()
}

#[tokio::test]
async fn test_failure_stops_remaining_steps() {
    let log = events();
    let queue = OperationQueue::<u32>::new("fail-fast");
    queue
        .then(mark(&log, "a"))
        .push(Step::value(|_: u32| Err(anyhow::anyhow!("disk full"))).describe("write"))
        .then(mark(&log, "c"))
        .then(mark(&log, "d"));

    let err = queue.run().await.unwrap_err();
    assert_eq!(err.step(), Some("write"));
    assert_eq!(err.to_string(), "step 'write' failed: disk full");
    assert_eq!(snapshot(&log), vec!["a"]);
}

#[tokio::test]
async fn test_failure_drops_discoveries_of_failing_step() {
    let log = events();
    let nested = log.clone();
    let queue = OperationQueue::<u32>::new("fail-nested");
    let later = mark(&log, "later");
    queue
        .then_nested(move |q, _| {
            q.then(mark(&nested, "child"));
            Err(anyhow::anyhow!("parent failed after discovering a child"))
        })
        .then(later);

    let err = queue.run().await.unwrap_err();
    assert!(matches!(err, QueueError::StepFailed { .. }));
    assert!(snapshot(&log).is_empty());
}

#[tokio::test]
async fn test_failure_inside_nested_step_skips_parent_siblings() {
    let log = events();
    let inner = log.clone();
    let queue = OperationQueue::<u32>::new("nested-failure");
    let after = mark(&log, "after");
    let later_parent = log.clone();
    queue
        .then_nested(move |q, value| {
            q.then(|_| Err(anyhow::anyhow!("child failed")));
            q.then(mark(&inner, "second child"));
            Ok(value)
        })
        .then(after)
        .then_nested(move |q, value| {
            // never applied, so its discoveries never exist
            q.then(mark(&later_parent, "grandchild"));
            Ok(value)
        });

    let err = queue.run().await.unwrap_err();
    assert_eq!(err.step(), Some("value step #1"));
    assert!(snapshot(&log).is_empty());
}

#[tokio::test]
async fn test_async_failure_rejects_run() {
    let log = events();
    let queue = OperationQueue::<u32>::new("async-failure");
    queue
        .then_async(|_: u32| async move {
            tokio::task::yield_now().await;
            Err(anyhow::anyhow!("lookup failed"))
        })
        .then(mark(&log, "after"));

    let err = queue.run().await.unwrap_err();
    assert!(err.to_string().contains("lookup failed"));
    assert!(snapshot(&log).is_empty());
}

#[tokio::test]
async fn test_panic_is_reported_as_failure() {
    let log = events();
    let queue = OperationQueue::<u32>::new("panic");
    queue
        .push(
            Step::value(|_: u32| -> anyhow::Result<u32> { panic!("invariant broken") })
                .describe("validate"),
        )
        .then(mark(&log, "after"));

    let err = queue.run().await.unwrap_err();
    assert!(err.is_panic());
    assert_eq!(err.to_string(), "step 'validate' panicked: invariant broken");
    assert!(snapshot(&log).is_empty());
}

#[tokio::test]
async fn test_observer_after_failure_sees_error() {
    let log = events();
    let seen = log.clone();
    let queue = OperationQueue::<u32>::new("observer-failure");
    queue
        .then(mark(&log, "a"))
        .then(|_| Err(anyhow::anyhow!("rejected")))
        .then(mark(&log, "skipped"))
        .observe(move |value: Option<&u32>, error: Option<&QueueError>| {
            assert!(value.is_none());
            let error = error.expect("observer should receive the failure");
            seen.lock().unwrap().push(format!("observed: {error}"));
        });

    let err = queue.run().await.unwrap_err();
    assert!(err.to_string().contains("rejected"));
    assert_eq!(
        snapshot(&log),
        vec!["a", "observed: step 'value step #1' failed: rejected"]
    );
}

#[tokio::test]
async fn test_panicking_observer_does_not_mask_failure() {
    let queue = OperationQueue::<u32>::new("observer-panic");
    queue
        .then(|_| Err(anyhow::anyhow!("original")))
        .observe(|_: Option<&u32>, _| panic!("observer bug"));

    let err = queue.run().await.unwrap_err();
    assert!(err.to_string().contains("original"));
}

#[tokio::test]
async fn test_failure_hook_is_not_invoked() {
    let log = events();
    let hook_log = log.clone();
    let queue = OperationQueue::<u32>::new("hook");
    queue.push(
        Step::value(|_: u32| Err(anyhow::anyhow!("fails")))
            .on_failure(move |_| hook_log.lock().unwrap().push("hook".to_string())),
    );

    assert!(queue.run().await.is_err());
    assert!(snapshot(&log).is_empty());
}
