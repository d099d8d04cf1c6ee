//! Basic usage example for the operation queue.
//!
//! This example demonstrates:
//! - Appending value, async and observer steps
//! - A step that discovers follow-up work and enqueues it mid-run
//! - Fail-fast behavior with an observer reporting the failure

use opqueue::{OperationQueue, QueueHandle, Step};
use std::time::Duration;

/// Saved rows, in the order they were written.
type Log = Vec<String>;

fn write(row: &'static str) -> impl FnOnce(Log) -> anyhow::Result<Log> + Send + 'static {
    move |mut log| {
        println!("  writing {row}");
        log.push(row.to_string());
        Ok(log)
    }
}

/// Saving an order turns out to require saving its lines first.
fn save_order(queue: &QueueHandle<Log>, mut log: Log) -> anyhow::Result<Log> {
    println!("  writing order, found 2 lines");
    log.push("order".to_string());
    for line in ["line 1", "line 2"] {
        queue.then(write(line));
    }
    Ok(log)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("=== Operation Queue - Basic Example ===\n");

    // Example 1: nested discoveries run before the next queued step
    println!("--- Example 1: nested steps ---");
    let queue = OperationQueue::<Log>::new("save_order");
    queue
        .then_nested(save_order)
        .then_async(|mut log: Log| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            println!("  writing audit entry");
            log.push("audit".to_string());
            Ok(log)
        })
        .observe(|log: Option<&Log>, _| {
            if let Some(log) = log {
                println!("  {} rows written", log.len());
            }
        });

    let log = queue.run().await?;
    println!("\nWrite order: {:?}\n", log);

    // Example 2: the first failure stops the queue
    println!("--- Example 2: fail-fast ---");
    let queue = OperationQueue::<Log>::new("failing_order");
    queue
        .then(write("order"))
        .push(
            Step::value(|_: Log| Err(anyhow::anyhow!("unique constraint violated")))
                .describe("line 1"),
        )
        .then(write("line 2"))
        .observe(|_: Option<&Log>, error| {
            if let Some(error) = error {
                println!("  observer saw: {error}");
            }
        });

    match queue.run().await {
        Ok(log) => println!("\nUnexpected success: {:?}", log),
        Err(e) => eprintln!("\nExpected failure: {}", e),
    }

    Ok(())
}
