//! Cancellation and deadline propagation for public operations.

use std::future::Future;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// A cancellation/deadline token passed into every public operation.
///
/// A default `Context` never fires. An operation racing a context that
/// fires returns [`Error::Cancelled`] or [`Error::DeadlineExceeded`]; the
/// session it was driving is torn down either way. Cancellation does not
/// interrupt an in-flight kernel write: the writer finishes or errors, and
/// the session is closed afterwards.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never cancels.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that cancels when `token` does.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
            deadline: None,
        }
    }

    /// A context that fails operations with [`Error::DeadlineExceeded`]
    /// once `deadline` passes.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: None,
            deadline: Some(deadline),
        }
    }

    /// Attaches a deadline to this context, keeping any token.
    pub fn and_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The deadline, if one is set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves once the context fires, with the error to surface.
    pub(crate) async fn done(&self) -> Error {
        match (&self.cancel, self.deadline) {
            (None, None) => std::future::pending().await,
            (Some(token), None) => {
                token.cancelled().await;
                Error::Cancelled
            }
            (None, Some(deadline)) => {
                sleep_until(deadline).await;
                Error::DeadlineExceeded
            }
            (Some(token), Some(deadline)) => {
                tokio::select! {
                    _ = token.cancelled() => Error::Cancelled,
                    _ = sleep_until(deadline) => Error::DeadlineExceeded,
                }
            }
        }
    }

    /// Races `future` against this context.
    pub(crate) async fn run<T>(
        &self,
        future: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        tokio::select! {
            err = self.done() => Err(err),
            result = future => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn background_context_never_fires() {
        let ctx = Context::background();
        let result = ctx.run(async { Ok(5) }).await;
        assert_eq!(result.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires() {
        let ctx = Context::with_deadline(Instant::now() + Duration::from_millis(10));
        let result: Result<(), _> = ctx.run(std::future::pending()).await;
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn cancellation_fires() {
        let token = CancellationToken::new();
        token.cancel();

        let ctx = Context::with_cancellation(token);
        let result: Result<(), _> = ctx.run(std::future::pending()).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
