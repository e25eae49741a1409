//! Cooperative cancellation helpers.
//!
//! Every store operation and remote call receives a [`CancellationToken`].
//! Suspension points are wrapped with [`run_cancellable`] so a cancelled
//! token aborts the pending future and surfaces [`RagError::Cancelled`].

use std::future::Future;

use tokio_util::sync::CancellationToken;

use super::errors::RagError;

/// Fails fast when the token is already cancelled.
pub fn ensure_active(cancel: &CancellationToken) -> Result<(), RagError> {
    if cancel.is_cancelled() {
        return Err(RagError::Cancelled);
    }
    Ok(())
}

/// Races `fut` against cancellation of `cancel`.
pub async fn run_cancellable<F, T, E>(cancel: &CancellationToken, fut: F) -> Result<T, RagError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<RagError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RagError::Cancelled),
        res = fut => res.map_err(Into::into),
    }
}
