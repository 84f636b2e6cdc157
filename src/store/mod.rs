//! The remote indexed store the session adapter runs against.
//!
//! An indexed store exposes point and range operations through index handles
//! that are opened once per connection and then addressed by number. The
//! [`IndexedStore`] trait is that capability; [`handlersocket::HandlerSocket`]
//! speaks it to a MySQL HandlerSocket endpoint and [`memory::MemoryStore`]
//! emulates it in process.

use std::fmt;
use std::future::Future;
use std::time::Duration;

pub mod handlersocket;
pub mod memory;

/// Name under which every store exposes a table's primary key.
pub const PRIMARY: &str = "PRIMARY";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("store error {code}: {message}")]
    Server { code: i32, message: String },

    #[error("index `{index}` on `{db}.{table}` does not exist")]
    IndexMissing {
        db: String,
        table: String,
        index: String,
    },

    #[error("a row with this primary key already exists")]
    DuplicateKey,

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// A connection-scoped index handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexId(u32);

impl IndexId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Comparison applied between the index column and the supplied key.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    pub const fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
        }
    }

    /// Whether matching rows are visited from the key downwards.
    pub const fn is_descending(self) -> bool {
        matches!(self, Op::Lt | Op::Le)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fetched row, in the order of the fields the index was opened with.
/// `None` is the store's NULL.
pub type Row = Vec<Option<Vec<u8>>>;

/// What an index handle is bound to.
#[derive(Clone, Copy, Debug)]
pub struct IndexSpec<'a> {
    pub db: &'a str,
    pub table: &'a str,
    pub index: &'a str,
    /// Columns fetched by `find` and written by `insert`/`update`, in order.
    pub fields: &'a [&'a str],
}

impl IndexSpec<'_> {
    pub(crate) fn missing(&self) -> Error {
        Error::IndexMissing {
            db: self.db.to_owned(),
            table: self.table.to_owned(),
            index: self.index.to_owned(),
        }
    }
}

/// Indexed point and range access to a remote row store.
///
/// Every operation addresses an index handle previously bound with
/// [`open_index`](IndexedStore::open_index). Re-opening a handle rebinds it.
pub trait IndexedStore: Send + Sync + 'static {
    /// Binds `id` to the given table, index and field list.
    ///
    /// Returns [`Error::IndexMissing`] when the table, index or one of the
    /// fields does not exist.
    fn open_index(
        &self,
        id: IndexId,
        spec: &IndexSpec<'_>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Fetches at most `limit` rows whose index column compares to `keys`
    /// by `op`, after skipping `offset` matches.
    fn find(
        &self,
        id: IndexId,
        op: Op,
        keys: &[&[u8]],
        limit: u32,
        offset: u32,
    ) -> impl Future<Output = Result<Vec<Row>, Error>> + Send;

    /// Inserts one row made of `values`, in the order of the bound fields.
    ///
    /// Returns [`Error::DuplicateKey`] when the primary key is taken.
    fn insert(
        &self,
        id: IndexId,
        values: &[&[u8]],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Overwrites the bound fields of the matching rows with `values`.
    ///
    /// Returns the number of rows modified.
    fn update(
        &self,
        id: IndexId,
        op: Op,
        keys: &[&[u8]],
        values: &[&[u8]],
        limit: u32,
        offset: u32,
    ) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Deletes the matching rows.
    ///
    /// Returns the number of rows removed.
    fn delete(
        &self,
        id: IndexId,
        op: Op,
        keys: &[&[u8]],
        limit: u32,
        offset: u32,
    ) -> impl Future<Output = Result<u64, Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_wire_form() {
        assert_eq!(Op::Eq.to_string(), "=");
        assert_eq!(Op::Le.as_str(), "<=");
        assert!(Op::Lt.is_descending());
        assert!(!Op::Ge.is_descending());
    }
}
