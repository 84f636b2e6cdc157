//! The per-request view of a session.
//!
//! [`SessionLayer`](crate::SessionLayer) reads the payload before the handler
//! runs and writes it back afterwards; a [`Session`] only ever touches the
//! in-memory copy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Serialize, de::DeserializeOwned};

mod cookie_options;
pub use cookie_options::CookieOptions;

mod id;
pub use id::Id;

use crate::store;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] store::Error),
    #[error("failed to encode session payload: {0}")]
    Encode(String),
    #[error("failed to decode session payload: {0}")]
    Decode(String),
}

type Result<T> = std::result::Result<T, Error>;

#[cfg(feature = "bincode")]
pub(crate) fn serialize_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| Error::Encode(e.to_string()))
}

#[cfg(feature = "bincode")]
pub(crate) fn deserialize_value<T: DeserializeOwned>(value: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(value, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| Error::Decode(e.to_string()))
}

#[cfg(feature = "messagepack")]
pub(crate) fn serialize_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
}

#[cfg(feature = "messagepack")]
pub(crate) fn deserialize_value<T: DeserializeOwned>(value: &[u8]) -> Result<T> {
    rmp_serde::from_slice(value).map_err(|e| Error::Decode(e.to_string()))
}

/// A handle to the current request's session.
///
/// Typed access stores one value as the whole payload. `raw` and `set_raw`
/// bypass serialisation for payloads written by other applications.
///
/// # Example
///
/// ```rust
/// use axum::{Router, routing::get};
/// use hsess::Session;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Default, Serialize, Deserialize)]
/// struct Visits {
///     count: u32,
/// }
///
/// let _: Router<()> = Router::new().route(
///     "/",
///     get(|session: Session| async move {
///         let mut visits: Visits = session.get().unwrap().unwrap_or_default();
///         visits.count += 1;
///         session.set(&visits).unwrap();
///         visits.count.to_string()
///     }),
/// );
/// ```
#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Returns the session ID, if it exists.
    pub fn id(&self) -> Option<Id> {
        *self.inner.id.read()
    }

    /// Decodes the payload. An empty payload is no value.
    pub fn get<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let payload = self.inner.payload.read();
        if payload.is_empty() {
            return Ok(None);
        }

        deserialize_value(&payload).map(Some).map_err(|err| {
            tracing::error!(err = %err, "failed to decode session payload");
            err
        })
    }

    /// Replaces the payload with `value`, assigning an id if there is none.
    pub fn set<T: Serialize>(&self, value: &T) -> Result<()> {
        let encoded = serialize_value(value)?;
        self.set_raw(encoded);
        Ok(())
    }

    pub fn raw(&self) -> Vec<u8> {
        self.inner.payload.read().clone()
    }

    pub fn set_raw(&self, payload: impl Into<Vec<u8>>) {
        *self.inner.payload.write() = payload.into();
        self.inner.id_or_gen();
        self.inner.changed.store(true, Ordering::Relaxed);
    }

    /// Destroys the session once the response is produced.
    pub fn delete(&self) {
        self.inner.deleted.store(true, Ordering::Relaxed);
    }

    /// Moves the session to a fresh id. The row under the old id is destroyed
    /// when the session is saved.
    #[tracing::instrument(name = "regenerating the session id", skip(self))]
    pub fn regenerate(&self) -> Id {
        let new_id = Id::default();
        let old_id = self.inner.id.write().replace(new_id);

        if let Some(old_id) = old_id {
            self.inner.replaced.lock().get_or_insert(old_id);
        }
        self.inner.changed.store(true, Ordering::Relaxed);
        new_id
    }
}

/// Session state shared between [`SessionLayer`](crate::SessionLayer) and the
/// request's [`Session`] handles.
#[derive(Debug, Default)]
pub struct Inner {
    pub(crate) id: RwLock<Option<Id>>,
    pub(crate) payload: RwLock<Vec<u8>>,
    // set when the payload is replaced or the id regenerated
    pub(crate) changed: AtomicBool,
    // set when the session is deleted
    pub(crate) deleted: AtomicBool,
    // the id that was stored before the first regeneration
    pub(crate) replaced: Mutex<Option<Id>>,
    // whether the id arrived with a stored session
    pub(crate) existing: bool,
}

impl Inner {
    pub fn new(id: Option<Id>, payload: Vec<u8>) -> Self {
        Self {
            existing: id.is_some(),
            id: RwLock::new(id),
            payload: RwLock::new(payload),
            ..Default::default()
        }
    }

    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Relaxed)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Relaxed)
    }

    fn id_or_gen(&self) -> Id {
        *self.id.write().get_or_insert_with(Id::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Cart {
        items: Vec<String>,
    }

    #[test]
    fn test_typed_payload() {
        let session = Session::new(Arc::new(Inner::default()));
        assert_eq!(session.get::<Cart>().unwrap(), None);
        assert!(session.id().is_none());

        let cart = Cart {
            items: vec!["apple".to_string()],
        };
        session.set(&cart).unwrap();
        assert_eq!(session.get::<Cart>().unwrap(), Some(cart));
        assert!(session.id().is_some());
        assert!(session.inner.is_changed());
    }

    #[test]
    fn test_garbage_payload_fails_to_decode() {
        let session = Session::new(Arc::new(Inner::new(None, b"\xff\xff\xff".to_vec())));
        assert!(matches!(session.get::<Cart>(), Err(Error::Decode(_))));
    }

    #[test]
    fn test_regenerate_keeps_first_id() {
        let original = Id::default();
        let session = Session::new(Arc::new(Inner::new(Some(original), Vec::new())));

        let first = session.regenerate();
        let second = session.regenerate();
        assert_ne!(first, original);
        assert_eq!(session.id(), Some(second));
        assert_eq!(*session.inner.replaced.lock(), Some(original));
    }
}
