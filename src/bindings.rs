//! Index handles used by the session adapter.
//!
//! Handles form a flat per-connection namespace. Each [`Binding`] owns a fixed
//! handle so adding another index cannot collide with the existing ones.

use crate::store::{Error, IndexId, IndexSpec, IndexedStore, PRIMARY};

/// Session table columns, in wire order.
pub const FIELDS: [&str; 3] = ["id", "modified", "data"];

/// Secondary index over the `modified` column.
pub const GC_INDEX: &str = "modified";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Binding {
    /// `PRIMARY` over `id,modified,data`. Opened once, serves read, write
    /// and destroy.
    Primary,
    /// `modified` with no projected columns. Re-opened for every gc pass.
    GarbageCollection,
}

impl Binding {
    pub const fn handle(self) -> IndexId {
        match self {
            Binding::Primary => IndexId::new(1),
            Binding::GarbageCollection => IndexId::new(2),
        }
    }

    pub const fn index(self) -> &'static str {
        match self {
            Binding::Primary => PRIMARY,
            Binding::GarbageCollection => GC_INDEX,
        }
    }

    pub const fn fields(self) -> &'static [&'static str] {
        match self {
            Binding::Primary => &FIELDS,
            Binding::GarbageCollection => &[],
        }
    }
}

/// Opens [`Binding`]s against one session table.
#[derive(Clone, Debug)]
pub struct IndexBindings {
    db: String,
    table: String,
}

impl IndexBindings {
    pub fn new(db: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            table: table.into(),
        }
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn open_primary<C: IndexedStore>(&self, client: &C) -> Result<IndexId, Error> {
        self.open(client, Binding::Primary).await
    }

    pub async fn open_gc<C: IndexedStore>(&self, client: &C) -> Result<IndexId, Error> {
        self.open(client, Binding::GarbageCollection).await
    }

    async fn open<C: IndexedStore>(&self, client: &C, binding: Binding) -> Result<IndexId, Error> {
        let spec = IndexSpec {
            db: &self.db,
            table: &self.table,
            index: binding.index(),
            fields: binding.fields(),
        };

        client
            .open_index(binding.handle(), &spec)
            .await
            .map_err(|err| {
                tracing::error!(
                    err = %err,
                    db = %self.db,
                    table = %self.table,
                    index = binding.index(),
                    "failed to open session index"
                );
                err
            })?;

        tracing::debug!(handle = %binding.handle(), index = binding.index(), "opened session index");
        Ok(binding.handle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn test_bindings_do_not_share_handles() {
        assert_ne!(
            Binding::Primary.handle(),
            Binding::GarbageCollection.handle()
        );
        assert_eq!(Binding::Primary.handle().get(), 1);
        assert_eq!(Binding::GarbageCollection.handle().get(), 2);
        assert_eq!(Binding::Primary.fields(), &["id", "modified", "data"]);
        assert!(Binding::GarbageCollection.fields().is_empty());
    }

    #[tokio::test]
    async fn test_open_against_memory_store() {
        let store = MemoryStore::new().with_session_table("session", "php_session");
        let bindings = IndexBindings::new("session", "php_session");

        assert_eq!(
            bindings.open_primary(&store).await.unwrap(),
            Binding::Primary.handle()
        );
        assert_eq!(
            bindings.open_gc(&store).await.unwrap(),
            Binding::GarbageCollection.handle()
        );
    }

    #[tokio::test]
    async fn test_missing_table_is_reported() {
        let store = MemoryStore::new().with_session_table("session", "php_session");
        let bindings = IndexBindings::new("session", "sessions");

        match bindings.open_primary(&store).await {
            Err(Error::IndexMissing { table, index, .. }) => {
                assert_eq!(table, "sessions");
                assert_eq!(index, "PRIMARY");
            }
            other => panic!("expected a missing index, got {other:?}"),
        }
    }
}
