//! Order-preserving fan-out over independent units of work.
//!
//! Both enrichment stages run N independent units with bounded concurrency
//! and need the results back in input order. Two schedulers provide that:
//!
//! - [`run_async`] drives futures cooperatively on the calling task through
//!   `FuturesUnordered`. Units receive a shared [`Semaphore`] and decide for
//!   themselves which section holds a permit.
//! - [`run_pool`] runs blocking closures on a dedicated `rayon` pool and
//!   gathers results on the calling thread over a channel.
//!
//! Both invoke `on_complete` on the coordinating task/thread in completion
//! order, and both turn a panicking unit into `Err(message)` for that unit.

use anyhow::{Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Result of one unit: its output, or the panic message if it panicked.
pub type UnitResult<R> = std::result::Result<R, String>;

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn collect_slots<R>(slots: Vec<Option<UnitResult<R>>>) -> Vec<UnitResult<R>> {
    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err("unit produced no result".to_string())))
        .collect()
}

/// Run one future per item with at most `limit` permits outstanding.
pub async fn run_async<T, R, F, Fut, C>(
    items: Vec<T>,
    limit: usize,
    work: F,
    mut on_complete: C,
) -> Vec<UnitResult<R>>
where
    F: Fn(T, Arc<Semaphore>) -> Fut,
    Fut: Future<Output = R>,
    C: FnMut(usize, &UnitResult<R>),
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut slots: Vec<Option<UnitResult<R>>> = items.iter().map(|_| None).collect();

    let mut pending: FuturesUnordered<_> = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let unit = AssertUnwindSafe(work(item, Arc::clone(&semaphore))).catch_unwind();
            async move { (index, unit.await.map_err(panic_message)) }
        })
        .collect();

    while let Some((index, outcome)) = pending.next().await {
        on_complete(index, &outcome);
        slots[index] = Some(outcome);
    }

    collect_slots(slots)
}

/// Run `work` for each item on a pool of `workers` threads.
pub fn run_pool<T, R, F, C>(
    items: Vec<T>,
    workers: usize,
    work: F,
    mut on_complete: C,
) -> Result<Vec<UnitResult<R>>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
    C: FnMut(usize, &UnitResult<R>),
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("litrev-worker-{}", i))
        .build()
        .with_context(|| "Failed to build worker pool")?;

    let mut slots: Vec<Option<UnitResult<R>>> = items.iter().map(|_| None).collect();
    let (tx, rx) = mpsc::channel::<(usize, UnitResult<R>)>();
    let work = &work;

    pool.in_place_scope(|scope| {
        for (index, item) in items.into_iter().enumerate() {
            let tx = tx.clone();
            scope.spawn(move |_| {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| work(item))).map_err(panic_message);
                let _ = tx.send((index, outcome));
            });
        }
        drop(tx);

        for (index, outcome) in rx {
            on_complete(index, &outcome);
            slots[index] = Some(outcome);
        }
    });

    Ok(collect_slots(slots))
}
