use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::watch,
};

#[derive(Debug, Snafu)]
#[snafu(display("failed to register handler for {signal}"))]
pub struct SignalError {
    source: std::io::Error,
    signal: &'static str,
}

/// Fans a shutdown signal out to every controller.
///
/// Each controller obtains its own future through [`SignalWatcher::handle`] and stops accepting
/// new work once it resolves.
pub struct SignalWatcher {
    watch_rx: watch::Receiver<bool>,
}

impl SignalWatcher {
    /// Resolves all handles on the first `SIGTERM` or `SIGINT`.
    pub fn shutdown_signals() -> Result<Self, SignalError> {
        let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu {
            signal: "SIGTERM",
        })?;
        let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu { signal: "SIGINT" })?;

        Ok(Self::from_future(async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
            }
        }))
    }

    /// Resolves all handles once `shutdown` completes.
    pub fn from_future<F>(shutdown: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (watch_tx, watch_rx) = watch::channel(false);

        tokio::spawn(async move {
            shutdown.await;
            watch_tx.send(true)
        });

        Self { watch_rx }
    }

    pub fn handle(&self) -> impl Future<Output = ()> + Send + use<> {
        let mut watch_rx = self.watch_rx.clone();

        async move {
            // An error means the sender is gone, which only happens after sending.
            watch_rx.wait_for(|stopped| *stopped).await.ok();
        }
    }
}
