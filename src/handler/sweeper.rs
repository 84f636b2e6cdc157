use super::{GC_BATCH, SaveHandler, SessionBackend, SessionHandler};
use crate::store::handlersocket::HandlerSocket;
use crate::store::{Error, IndexedStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Periodically removes expired sessions in the background.
///
/// Each tick keeps calling `gc` while a pass removes a full batch, so a
/// backlog larger than [`GC_BATCH`] drains within one tick.
///
/// # Example
///
/// ```rust,no_run
/// use hsess::{GcSweeper, ServerOptions, SessionBackend};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), hsess::store::Error> {
/// let backend = Arc::new(SessionBackend::connect(&ServerOptions::default()).await?);
/// let _task = GcSweeper::new(backend)
///     .interval(Duration::from_secs(60))
///     .max_lifetime(24 * 60 * 60)
///     .spawn();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct GcSweeper<C: IndexedStore = HandlerSocket> {
    backend: Arc<SessionBackend<C>>,
    interval: Duration,
    max_lifetime: u64,
}

impl<C: IndexedStore> GcSweeper<C> {
    /// Runs every 5 minutes and removes sessions idle for more than an hour
    /// unless configured otherwise.
    pub fn new(backend: Arc<SessionBackend<C>>) -> Self {
        Self {
            backend,
            interval: Duration::from_secs(300),
            max_lifetime: 60 * 60,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn max_lifetime(mut self, seconds: u64) -> Self {
        self.max_lifetime = seconds;
        self
    }

    /// Runs gc until a pass removes less than a full batch. Returns the total
    /// number of rows removed.
    pub async fn sweep(&self) -> Result<u64, Error> {
        let handler = SaveHandler::new(self.backend.clone());
        let mut total = 0;
        loop {
            let removed = handler.gc(self.max_lifetime).await?;
            total += removed;
            if removed < u64::from(GC_BATCH) {
                return Ok(total);
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                match self.sweep().await {
                    Ok(removed) => tracing::debug!(removed, "gc sweep finished"),
                    Err(err) => tracing::error!(err = %err, "gc sweep failed"),
                }
            }
        })
    }
}
