//! Concurrent execution of independent operations with aggregated errors.
//!
//! These are the only concurrency constructs the engine uses. Every task runs
//! on its own tokio task; all tasks are awaited, even when some fail, so one
//! failing machine never hides the failures of its siblings.

use std::future::Future;

use tokio::task::JoinSet;
use tracing::Instrument;

use crate::error::{Error, Result, concat};

/// Runs all tasks concurrently and waits for every one of them.
///
/// Returns the successful outputs in submission order together with the
/// concatenation of all failures.
pub async fn settle<T, I, F>(tasks: I) -> (Vec<T>, Option<Error>)
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut set = JoinSet::new();
    for (idx, task) in tasks.into_iter().enumerate() {
        set.spawn(async move { (idx, task.await) }.in_current_span());
    }

    let mut done = Vec::with_capacity(set.len());
    let mut errs = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, Ok(value))) => done.push((idx, value)),
            Ok((_, Err(e))) => errs.push(Some(e)),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => errs.push(Some(Error::Cancelled)),
        }
    }

    done.sort_by_key(|(idx, _)| *idx);
    (done.into_iter().map(|(_, v)| v).collect(), concat(errs))
}

/// Runs all tasks concurrently; fails with every error if any task failed.
pub async fn fanout<T, I, F>(tasks: I) -> Result<Vec<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match settle(tasks).await {
        (values, None) => Ok(values),
        (_, Some(err)) => Err(err),
    }
}

/// Like [`fanout`] for tasks reporting whether they are done.
///
/// The combined result is done only if every task is done.
pub async fn fanout_done<I, F>(tasks: I) -> Result<bool>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<bool>> + Send + 'static,
{
    Ok(fanout(tasks).await?.into_iter().all(|done| done))
}
