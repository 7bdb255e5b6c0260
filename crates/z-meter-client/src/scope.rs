//! Ambient tag scopes.
//!
//! A scope attaches an agent tag or metadata to every event recorded while it
//! is active. Async code wraps a future with [`with_agent`] or
//! [`with_metadata`]; the tags follow that future across `.await` points and
//! worker threads but are not inherited by spawned tasks. Pass
//! [`current()`] into a spawned task and re-enter it with [`with_context`].
//! Synchronous code uses the `*_sync` variants, which hold the scope for the
//! duration of a closure on the current thread.
//!
//! ```ignore
//! scope::with_agent("planner", async {
//!     meter.record(observation);
//! })
//! .await;
//! ```

use std::future::Future;

use z_meter_core::TagContext;

tokio::task_local! {
    static CURRENT: TagContext;
}

/// The innermost active context, or an empty one outside any scope.
#[must_use]
pub fn current() -> TagContext {
    CURRENT.try_with(Clone::clone).unwrap_or_default()
}

/// Run `fut` with `context` as the active scope.
pub async fn with_context<F: Future>(context: TagContext, fut: F) -> F::Output {
    CURRENT.scope(context, fut).await
}

/// Run `fut` with `agent` as the agent tag. Inner scopes win.
pub async fn with_agent<F: Future>(agent: impl Into<String>, fut: F) -> F::Output {
    let context = current().with_agent(agent);
    CURRENT.scope(context, fut).await
}

/// Run `fut` with `entries` merged into the metadata. Inner keys win.
pub async fn with_metadata<F, I, K, V>(entries: I, fut: F) -> F::Output
where
    F: Future,
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let context = current().with_metadata(entries);
    CURRENT.scope(context, fut).await
}

/// Run `f` with `context` as the active scope.
pub fn with_context_sync<R>(context: TagContext, f: impl FnOnce() -> R) -> R {
    CURRENT.sync_scope(context, f)
}

/// Run `f` with `agent` as the agent tag.
pub fn with_agent_sync<R>(agent: impl Into<String>, f: impl FnOnce() -> R) -> R {
    let context = current().with_agent(agent);
    CURRENT.sync_scope(context, f)
}

/// Run `f` with `entries` merged into the metadata.
pub fn with_metadata_sync<R, I, K, V>(entries: I, f: impl FnOnce() -> R) -> R
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let context = current().with_metadata(entries);
    CURRENT.sync_scope(context, f)
}
