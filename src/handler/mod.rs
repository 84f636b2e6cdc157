//! The session lifecycle adapter.
//!
//! A [`SessionBackend`] owns the store client and the primary index binding and
//! is shared by every session. A [`SaveHandler`] is created per session and
//! maps the six lifecycle operations onto the backend.

use crate::bindings::IndexBindings;
use crate::options::ServerOptions;
use crate::record::{Clock, Columns, SessionRecord, Timestamp};
use crate::store::handlersocket::HandlerSocket;
use crate::store::{Error, IndexId, IndexedStore, Op};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

mod sweeper;
pub use sweeper::GcSweeper;

/// Most rows a single gc call removes.
pub const GC_BATCH: u32 = 1000;

/// The contract a host framework drives a session through.
///
/// `open` and `close` bracket one request; `read`, `write` and `destroy`
/// address one session id; `gc` is maintenance and may run from anywhere.
pub trait SessionHandler: Send + Sync {
    fn open(&self, save_path: &str, name: &str) -> impl Future<Output = Result<bool, Error>> + Send;

    fn close(&self) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Returns the stored payload, or empty bytes when there is none.
    fn read(&self, id: &str) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;

    /// Stores `payload` under `id` stamped with the current time.
    fn write(&self, id: &str, payload: &[u8]) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Removes the session. Succeeds when there was nothing to remove.
    fn destroy(&self, id: &str) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Removes at most [`GC_BATCH`] sessions last modified more than
    /// `max_lifetime` seconds ago and returns how many went.
    fn gc(&self, max_lifetime: u64) -> impl Future<Output = Result<u64, Error>> + Send;
}

/// The store connection and the bindings opened on it.
#[derive(Debug)]
pub struct SessionBackend<C: IndexedStore = HandlerSocket> {
    client: Arc<C>,
    bindings: IndexBindings,
    primary: IndexId,
    clock: Clock,
}

impl SessionBackend<HandlerSocket> {
    /// Connects to the configured HandlerSocket endpoint and opens the
    /// primary binding.
    pub async fn connect(options: &ServerOptions) -> Result<Self, Error> {
        options.validate()?;
        let client = HandlerSocket::connect(options).await.map_err(|err| {
            tracing::error!(err = %err, "failed to connect to the session store");
            err
        })?;

        Self::bind(Arc::new(client), options).await
    }
}

impl<C: IndexedStore> SessionBackend<C> {
    /// Opens the primary binding on an existing client.
    ///
    /// Fails with [`Error::IndexMissing`] when the session table is not there.
    pub async fn new(client: Arc<C>, options: &ServerOptions) -> Result<Self, Error> {
        options.validate()?;
        Self::bind(client, options).await
    }

    async fn bind(client: Arc<C>, options: &ServerOptions) -> Result<Self, Error> {
        let bindings = IndexBindings::new(&options.dbname, &options.dbtable);
        let primary = bindings.open_primary(client.as_ref()).await?;

        Ok(Self {
            client,
            bindings,
            primary,
            clock: Clock::local(),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn bindings(&self) -> &IndexBindings {
        &self.bindings
    }

    pub async fn fetch(&self, id: &str) -> Result<Option<SessionRecord>, Error> {
        let rows = self
            .client
            .find(self.primary, Op::Eq, &[id.as_bytes()], 1, 0)
            .await?;

        match rows.into_iter().next() {
            Some(row) => SessionRecord::from_row(row),
            None => Ok(None),
        }
    }

    pub async fn exists(&self, id: &str) -> Result<bool, Error> {
        let rows = self
            .client
            .find(self.primary, Op::Eq, &[id.as_bytes()], 1, 0)
            .await?;
        Ok(!rows.is_empty())
    }

    pub async fn insert(&self, id: &str, modified: Timestamp, payload: &[u8]) -> Result<(), Error> {
        let columns = Columns::new(id, modified, payload);
        self.client.insert(self.primary, &columns.values()).await
    }

    /// Returns the number of rows updated, zero when `id` is not stored.
    pub async fn update(&self, id: &str, modified: Timestamp, payload: &[u8]) -> Result<u64, Error> {
        let columns = Columns::new(id, modified, payload);
        self.client
            .update(self.primary, Op::Eq, &[id.as_bytes()], &columns.values(), 1, 0)
            .await
    }

    pub async fn remove(&self, id: &str) -> Result<u64, Error> {
        self.client
            .delete(self.primary, Op::Eq, &[id.as_bytes()], 1, 0)
            .await
    }

    /// Deletes up to [`GC_BATCH`] rows modified strictly before `cutoff`.
    pub async fn purge_expired(&self, cutoff: Timestamp) -> Result<u64, Error> {
        let gc = self.bindings.open_gc(self.client.as_ref()).await?;
        let cutoff = cutoff.to_string();
        self.client
            .delete(gc, Op::Lt, &[cutoff.as_bytes()], GC_BATCH, 0)
            .await
    }
}

/// The `(id, modified)` pair of the last row this handler read or wrote.
/// `modified` is `None` when the stored value could not be read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastSeen {
    pub id: String,
    pub modified: Option<Timestamp>,
}

/// Per-session adapter over a shared [`SessionBackend`].
#[derive(Debug)]
pub struct SaveHandler<C: IndexedStore = HandlerSocket> {
    backend: Arc<SessionBackend<C>>,
    last_seen: Mutex<Option<LastSeen>>,
}

impl<C: IndexedStore> SaveHandler<C> {
    pub fn new(backend: Arc<SessionBackend<C>>) -> Self {
        Self {
            backend,
            last_seen: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &Arc<SessionBackend<C>> {
        &self.backend
    }

    pub fn last_seen(&self) -> Option<LastSeen> {
        self.last_seen.lock().clone()
    }

    /// Whether the cache vouches for `id`. A cache entry for another id is
    /// dropped.
    fn cached(&self, id: &str) -> bool {
        let mut last_seen = self.last_seen.lock();
        match last_seen.as_ref() {
            Some(seen) if seen.id == id => true,
            Some(_) => {
                *last_seen = None;
                false
            }
            None => false,
        }
    }

    async fn update_or_insert(&self, id: &str, now: Timestamp, payload: &[u8]) -> Result<(), Error> {
        if self.backend.update(id, now, payload).await? > 0 {
            return Ok(());
        }

        // gone since it was last seen, or stored with identical values
        match self.backend.insert(id, now, payload).await {
            Ok(()) | Err(Error::DuplicateKey) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn insert_or_update(&self, id: &str, now: Timestamp, payload: &[u8]) -> Result<(), Error> {
        match self.backend.insert(id, now, payload).await {
            Err(Error::DuplicateKey) => {
                tracing::debug!("session row appeared concurrently, updating instead");
                self.backend.update(id, now, payload).await.map(|_| ())
            }
            other => other,
        }
    }
}

impl<C: IndexedStore> SessionHandler for SaveHandler<C> {
    async fn open(&self, _save_path: &str, _name: &str) -> Result<bool, Error> {
        Ok(true)
    }

    async fn close(&self) -> Result<bool, Error> {
        Ok(true)
    }

    #[tracing::instrument(name = "reading session", skip(self))]
    async fn read(&self, id: &str) -> Result<Vec<u8>, Error> {
        let record = self.backend.fetch(id).await.map_err(|err| {
            tracing::error!(err = %err, "failed to read session");
            err
        })?;

        let Some(record) = record else {
            return Ok(Vec::new());
        };
        if record.id != id {
            let err = Error::Protocol(format!(
                "lookup for one session returned the row of `{}`",
                record.id
            ));
            tracing::error!(err = %err, "failed to read session");
            return Err(err);
        }

        *self.last_seen.lock() = Some(LastSeen {
            id: record.id,
            modified: record.modified,
        });
        Ok(record.payload)
    }

    #[tracing::instrument(name = "writing session", skip(self, payload), fields(size = payload.len()))]
    async fn write(&self, id: &str, payload: &[u8]) -> Result<bool, Error> {
        let now = self.backend.clock().now();

        let written = if self.cached(id) {
            self.update_or_insert(id, now, payload).await
        } else {
            match self.backend.exists(id).await {
                Ok(true) => self.update_or_insert(id, now, payload).await,
                Ok(false) => self.insert_or_update(id, now, payload).await,
                Err(err) => Err(err),
            }
        };

        written.map_err(|err| {
            tracing::error!(err = %err, "failed to write session");
            err
        })?;

        *self.last_seen.lock() = Some(LastSeen {
            id: id.to_owned(),
            modified: Some(now),
        });
        Ok(true)
    }

    #[tracing::instrument(name = "destroying session", skip(self))]
    async fn destroy(&self, id: &str) -> Result<bool, Error> {
        let removed = self.backend.remove(id).await.map_err(|err| {
            tracing::error!(err = %err, "failed to destroy session");
            err
        })?;
        tracing::debug!(removed, "destroyed session");

        let mut last_seen = self.last_seen.lock();
        if last_seen.as_ref().is_some_and(|seen| seen.id == id) {
            *last_seen = None;
        }
        Ok(true)
    }

    #[tracing::instrument(name = "collecting expired sessions", skip(self))]
    async fn gc(&self, max_lifetime: u64) -> Result<u64, Error> {
        let cutoff = self.backend.clock().now().saturating_sub_secs(max_lifetime);
        let removed = self.backend.purge_expired(cutoff).await.map_err(|err| {
            tracing::error!(err = %err, "failed to collect expired sessions");
            err
        })?;

        tracing::debug!(removed, cutoff = %cutoff, "collected expired sessions");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    async fn handler() -> (MemoryStore, SaveHandler<MemoryStore>) {
        let store = MemoryStore::new().with_session_table("session", "php_session");
        let backend = SessionBackend::new(Arc::new(store.clone()), &ServerOptions::default())
            .await
            .unwrap()
            .with_clock(Clock::utc());
        (store, SaveHandler::new(Arc::new(backend)))
    }

    #[tokio::test]
    async fn test_read_caches_last_seen() {
        let (_, handler) = handler().await;
        assert!(handler.read("abc").await.unwrap().is_empty());
        assert_eq!(handler.last_seen(), None);

        handler.write("abc", b"x=1").await.unwrap();
        let fresh = SaveHandler::new(handler.backend().clone());
        assert_eq!(fresh.read("abc").await.unwrap(), b"x=1");
        assert_eq!(fresh.last_seen().map(|seen| seen.id), Some("abc".to_string()));
    }

    #[tokio::test]
    async fn test_write_for_other_id_drops_cache() {
        let (store, handler) = handler().await;
        handler.write("a", b"1").await.unwrap();
        handler.write("b", b"2").await.unwrap();

        assert_eq!(handler.last_seen().map(|seen| seen.id), Some("b".to_string()));
        assert_eq!(store.row_count("session", "php_session"), 2);
    }

    #[tokio::test]
    async fn test_destroy_clears_matching_cache_only() {
        let (_, handler) = handler().await;
        handler.write("a", b"1").await.unwrap();

        assert!(handler.destroy("other").await.unwrap());
        assert!(handler.last_seen().is_some());

        assert!(handler.destroy("a").await.unwrap());
        assert!(handler.last_seen().is_none());
    }

    #[tokio::test]
    async fn test_zero_date_row_is_still_read() {
        let (store, handler) = handler().await;
        store
            .insert(
                crate::bindings::Binding::Primary.handle(),
                &[b"abc".as_slice(), b"0000-00-00 00:00:00", b"user_id=5"],
            )
            .await
            .unwrap();

        assert_eq!(handler.read("abc").await.unwrap(), b"user_id=5");
        assert_eq!(
            handler.last_seen(),
            Some(LastSeen {
                id: "abc".to_string(),
                modified: None,
            })
        );

        handler.write("abc", b"user_id=6").await.unwrap();
        assert_eq!(store.row_count("session", "php_session"), 1);
        assert!(handler.backend().fetch("abc").await.unwrap().unwrap().modified.is_some());
    }

    #[tokio::test]
    async fn test_cached_write_recreates_a_vanished_row() {
        let (store, handler) = handler().await;
        handler.write("a", b"1").await.unwrap();
        handler.backend().remove("a").await.unwrap();

        handler.write("a", b"2").await.unwrap();
        assert_eq!(store.row_count("session", "php_session"), 1);
        assert_eq!(handler.read("a").await.unwrap(), b"2");
    }
}
