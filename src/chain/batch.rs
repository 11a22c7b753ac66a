//! Bounded-parallel batching for rate-limited public endpoints

use futures::future::join_all;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Run `f` over `items` in concurrent groups of `group_size`, pausing `delay` between groups.
///
/// Results are returned in input order.
pub async fn run_bounded<I, T, R, F, Fut>(
    items: I,
    group_size: usize,
    delay: Duration,
    f: F,
) -> Vec<R>
where
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let group_size = group_size.max(1);
    let mut iter = items.into_iter().peekable();
    let mut results = Vec::new();
    let mut groups = 0usize;

    while iter.peek().is_some() {
        if groups > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let group: Vec<Fut> = iter.by_ref().take(group_size).map(&f).collect();
        results.extend(join_all(group).await);
        groups += 1;
    }

    debug!("Ran {} items in {} groups", results.len(), groups);
    results
}
