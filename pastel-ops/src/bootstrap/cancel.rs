//! Interrupt flag shared between the signal handler and a running bootstrap

use std::future::Future;
use tokio::sync::watch;

use crate::errors::OpsError;

/// Flips the flag; held by the Ctrl-C handler
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // No receivers left means nothing is running; nothing to stop
        let _ = self.tx.send(true);
    }
}

/// Observes the flag; checked before every step and raced against polling
#[derive(Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, Cancellation { rx })
}

impl Cancellation {
    /// Flag that can never be raised
    pub fn never() -> Self {
        cancellation().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn check(&self) -> Result<(), OpsError> {
        if self.is_cancelled() {
            Err(OpsError::Interrupted)
        } else {
            Ok(())
        }
    }

    async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `fut` unless the flag is raised first
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, OpsError>
    where
        F: Future<Output = Result<T, OpsError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(OpsError::Interrupted),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_check_after_cancel() {
        let (handle, cancel) = cancellation();
        assert!(cancel.check().is_ok());
        handle.cancel();
        assert!(matches!(cancel.check(), Err(OpsError::Interrupted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_interrupts_pending_future() {
        let (handle, cancel) = cancellation();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.cancel();
        });

        let result: Result<(), OpsError> = cancel
            .guard(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(OpsError::Interrupted)));
    }

    #[tokio::test]
    async fn test_never_lets_future_finish() {
        let value = Cancellation::never().guard(async { Ok::<_, OpsError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
