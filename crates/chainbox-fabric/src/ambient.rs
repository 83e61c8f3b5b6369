//! Ambient-network default-deny for handler execution.
//!
//! Handlers must do external I/O through `ctx.adapter(...)`; the crate's
//! sanctioned outbound HTTP handle refuses while a handler is on the stack.
//! The scope is a task-local: it is restored on every exit path including
//! panics and cancellation, and it covers the handler's own task. Nested
//! `ctx.call` invocations run inside the same scope.

use std::future::Future;
use std::sync::OnceLock;

use chainbox_types::FabricError;

tokio::task_local! {
    static AMBIENT_DENIED: ();
}

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Run a future with ambient outbound HTTP denied.
pub async fn with_ambient_deny<F>(future: F) -> F::Output
where
    F: Future,
{
    AMBIENT_DENIED.scope((), future).await
}

/// Whether the current task is inside a deny scope.
pub fn ambient_denied() -> bool {
    AMBIENT_DENIED.try_with(|_| ()).is_ok()
}

/// The process's sanctioned outbound HTTP client.
///
/// Fails with `FORBIDDEN` while a handler is executing; host code outside
/// handler scope gets a shared pooled client.
pub fn http_client() -> Result<reqwest::Client, FabricError> {
    if ambient_denied() {
        return Err(FabricError::forbidden(
            "ambient outbound HTTP is denied during handler execution; use ctx.adapter(...)",
        ));
    }
    Ok(SHARED_CLIENT
        .get_or_init(|| reqwest::Client::builder().build().unwrap_or_default())
        .clone())
}
