//! Cooperative stop signal for in-flight calls.

use tokio::sync::watch;

/// Triggers the paired [`StopSignal`]s.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

/// Resolves once a stop has been requested.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

#[must_use]
pub fn stop_pair() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (
        StopHandle {
            tx: std::sync::Arc::new(tx),
        },
        StopSignal { rx },
    )
}

impl StopSignal {
    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn stopped(&mut self) {
        // A closed channel without a stop never fires.
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Request a stop on Ctrl-C.
pub fn stop_on_ctrl_c(handle: StopHandle) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("received Ctrl+C, cancelling");
                handle.stop();
            }
            Err(e) => tracing::error!(error = %e, "failed to install Ctrl+C handler"),
        }
    });
}
