//! Parallel composition primitives
//!
//! Bounded-concurrency aggregates over builders (or arbitrary fallible
//! futures for `map`). Result order always matches input order;
//! completion order is whatever it is. Dropping an aggregate (including
//! `all` bailing on its first error) drops the outstanding
//! children, which cancels them cooperatively.

use std::future::Future;

use futures::stream::{self, StreamExt, TryStreamExt};

use super::builder::CommandBuilder;
use crate::core::ExecResult;
use crate::error::ExecError;

/// Default concurrency cap for the aggregate primitives.
pub fn default_concurrency() -> usize {
    num_cpus::get().max(1)
}

fn cap(concurrency: usize) -> usize {
    concurrency.max(1)
}

/// Run all builders with at most `concurrency` in flight; first error
/// wins and cancels the rest. Results are positional.
pub async fn all(
    builders: Vec<CommandBuilder>,
    concurrency: usize,
) -> Result<Vec<ExecResult>, ExecError> {
    stream::iter(builders.into_iter().map(|b| b.run()))
        .buffered(cap(concurrency))
        .try_collect()
        .await
}

/// Run all builders to completion regardless of failures; per-builder
/// outcomes in input order.
pub async fn all_settled(
    builders: Vec<CommandBuilder>,
    concurrency: usize,
) -> Vec<Result<ExecResult, ExecError>> {
    stream::iter(builders.into_iter().map(|b| b.run()))
        .buffered(cap(concurrency))
        .collect()
        .await
}

/// Apply `f` to every item with bounded concurrency, preserving input
/// order in the result; first error wins.
pub async fn map<T, R, F, Fut>(
    items: Vec<T>,
    f: F,
    concurrency: usize,
) -> Result<Vec<R>, ExecError>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<R, ExecError>>,
{
    stream::iter(items.into_iter().map(f))
        .buffered(cap(concurrency))
        .try_collect()
        .await
}

/// Outcomes grouped by success and failure.
#[derive(Debug, Default)]
pub struct Settled {
    pub succeeded: Vec<ExecResult>,
    pub failed: Vec<ExecError>,
}

/// Like [`all_settled`], but grouped.
pub async fn settled(builders: Vec<CommandBuilder>, concurrency: usize) -> Settled {
    let mut outcome = Settled::default();
    for result in all_settled(builders, concurrency).await {
        match result {
            Ok(r) => outcome.succeeded.push(r),
            Err(e) => outcome.failed.push(e),
        }
    }
    outcome
}
