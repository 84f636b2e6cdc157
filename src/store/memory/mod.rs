use crate::bindings::{FIELDS, GC_INDEX};
use crate::store::{Error, IndexId, IndexSpec, IndexedStore, Op, PRIMARY, Row};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An in-memory indexed store.
///
/// Tables hold a primary key on their first column and any number of
/// single-column secondary indexes. Range lookups compare column bytes
/// lexically, the same way the session timestamps are meant to be compared.
/// Clones share the same tables and the same handle namespace, like several
/// users of one connection.
///
/// ### Note
///
/// Do not use this in a production environment.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<HashMap<String, Table>>>,
    handles: Arc<DashMap<IndexId, OpenIndex>>,
}

#[derive(Debug, Default)]
struct Table {
    columns: Vec<String>,
    /// Secondary index name to column position.
    indexes: HashMap<String, usize>,
    /// Rows keyed by their primary key column.
    rows: BTreeMap<Vec<u8>, Vec<Option<Vec<u8>>>>,
}

#[derive(Debug, Clone)]
struct OpenIndex {
    table: String,
    column: usize,
    fields: Vec<usize>,
}

fn table_key(db: &str, table: &str) -> String {
    format!("{db}.{table}")
}

fn bad_request(message: &str) -> Error {
    Error::Server {
        code: 1,
        message: message.to_string(),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table whose primary key is `columns[0]`.
    pub fn with_table(self, db: &str, table: &str, columns: &[&str], secondary: &[&str]) -> Self {
        let indexes = secondary
            .iter()
            .filter_map(|name| {
                columns
                    .iter()
                    .position(|column| column == name)
                    .map(|position| (name.to_string(), position))
            })
            .collect();

        self.tables.write().insert(
            table_key(db, table),
            Table {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                indexes,
                rows: BTreeMap::new(),
            },
        );
        self
    }

    /// Adds a session table: `id`, `modified`, `data` with an index on `modified`.
    pub fn with_session_table(self, db: &str, table: &str) -> Self {
        self.with_table(db, table, &FIELDS, &[GC_INDEX])
    }

    /// Number of rows currently stored in `db.table`.
    pub fn row_count(&self, db: &str, table: &str) -> usize {
        self.tables
            .read()
            .get(&table_key(db, table))
            .map_or(0, |table| table.rows.len())
    }

    fn handle(&self, id: IndexId) -> Result<OpenIndex, Error> {
        self.handles
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| bad_request("stmtnum"))
    }
}

impl Table {
    /// Primary keys of the rows matching `op key`, in scan order, after
    /// `offset` and `limit` are applied.
    fn select(&self, index: &OpenIndex, op: Op, keys: &[&[u8]], limit: u32, offset: u32) -> Result<Vec<Vec<u8>>, Error> {
        let [key] = keys else {
            return Err(bad_request("kpnum"));
        };

        let mut matches: Vec<(&[u8], &Vec<u8>)> = self
            .rows
            .iter()
            .filter_map(|(pk, row)| {
                let value = row.get(index.column)?.as_deref()?;
                let hit = match op {
                    Op::Eq => value == *key,
                    Op::Lt => value < *key,
                    Op::Le => value <= *key,
                    Op::Gt => value > *key,
                    Op::Ge => value >= *key,
                };
                hit.then_some((value, pk))
            })
            .collect();

        matches.sort();
        if op.is_descending() {
            matches.reverse();
        }

        Ok(matches
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|(_, pk)| pk.clone())
            .collect())
    }

    fn project(&self, pk: &[u8], fields: &[usize]) -> Row {
        self.rows.get(pk).map_or_else(Vec::new, |row| {
            fields.iter().map(|&field| row[field].clone()).collect()
        })
    }

    fn assign(&self, row: &mut [Option<Vec<u8>>], fields: &[usize], values: &[&[u8]]) -> Result<(), Error> {
        if values.len() != fields.len() {
            return Err(bad_request("nflds"));
        }
        for (&field, value) in fields.iter().zip(values) {
            row[field] = Some(value.to_vec());
        }
        Ok(())
    }
}

impl IndexedStore for MemoryStore {
    async fn open_index(&self, id: IndexId, spec: &IndexSpec<'_>) -> Result<(), Error> {
        let key = table_key(spec.db, spec.table);
        let tables = self.tables.read();
        let table = tables.get(&key).ok_or_else(|| spec.missing())?;

        let column = if spec.index == PRIMARY {
            0
        } else {
            *table.indexes.get(spec.index).ok_or_else(|| spec.missing())?
        };

        let fields = spec
            .fields
            .iter()
            .map(|name| table.columns.iter().position(|column| column == name))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| spec.missing())?;

        self.handles.insert(
            id,
            OpenIndex {
                table: key,
                column,
                fields,
            },
        );
        Ok(())
    }

    async fn find(
        &self,
        id: IndexId,
        op: Op,
        keys: &[&[u8]],
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Row>, Error> {
        let index = self.handle(id)?;
        let tables = self.tables.read();
        let table = tables.get(&index.table).ok_or_else(|| bad_request("tbl"))?;

        let pks = table.select(&index, op, keys, limit, offset)?;
        Ok(pks
            .iter()
            .map(|pk| table.project(pk, &index.fields))
            .collect())
    }

    async fn insert(&self, id: IndexId, values: &[&[u8]]) -> Result<(), Error> {
        let index = self.handle(id)?;
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&index.table)
            .ok_or_else(|| bad_request("tbl"))?;

        let mut row = vec![None; table.columns.len()];
        table.assign(&mut row, &index.fields, values)?;
        let Some(pk) = row[0].clone() else {
            return Err(bad_request("pk"));
        };
        if table.rows.contains_key(&pk) {
            return Err(Error::DuplicateKey);
        }

        table.rows.insert(pk, row);
        Ok(())
    }

    async fn update(
        &self,
        id: IndexId,
        op: Op,
        keys: &[&[u8]],
        values: &[&[u8]],
        limit: u32,
        offset: u32,
    ) -> Result<u64, Error> {
        let index = self.handle(id)?;
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&index.table)
            .ok_or_else(|| bad_request("tbl"))?;

        let pks = table.select(&index, op, keys, limit, offset)?;
        let mut updated = 0;
        for pk in pks {
            let Some(mut row) = table.rows.remove(&pk) else {
                continue;
            };
            let original = row.clone();
            if let Err(err) = table.assign(&mut row, &index.fields, values) {
                table.rows.insert(pk, original);
                return Err(err);
            }

            let new_pk = row[0].clone().unwrap_or_else(|| pk.clone());
            if new_pk != pk && table.rows.contains_key(&new_pk) {
                table.rows.insert(pk, original);
                return Err(Error::DuplicateKey);
            }
            table.rows.insert(new_pk, row);
            updated += 1;
        }

        Ok(updated)
    }

    async fn delete(
        &self,
        id: IndexId,
        op: Op,
        keys: &[&[u8]],
        limit: u32,
        offset: u32,
    ) -> Result<u64, Error> {
        let index = self.handle(id)?;
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&index.table)
            .ok_or_else(|| bad_request("tbl"))?;

        let pks = table.select(&index, op, keys, limit, offset)?;
        let mut removed = 0;
        for pk in pks {
            if table.rows.remove(&pk).is_some() {
                removed += 1;
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::Binding;

    async fn session_store() -> MemoryStore {
        let store = MemoryStore::new().with_session_table("session", "php_session");
        for binding in [Binding::Primary, Binding::GarbageCollection] {
            let spec = IndexSpec {
                db: "session",
                table: "php_session",
                index: binding.index(),
                fields: binding.fields(),
            };
            store.open_index(binding.handle(), &spec).await.unwrap();
        }
        store
    }

    async fn put(store: &MemoryStore, id: &str, modified: &str, data: &str) {
        store
            .insert(
                Binding::Primary.handle(),
                &[id.as_bytes(), modified.as_bytes(), data.as_bytes()],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_point_operations() {
        let store = session_store().await;
        let primary = Binding::Primary.handle();
        put(&store, "a", "2024-01-01 00:00:00", "one").await;

        let rows = store.find(primary, Op::Eq, &[b"a".as_slice()], 1, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][2].as_deref(), Some(&b"one"[..]));

        assert!(matches!(
            store
                .insert(primary, &[b"a".as_slice(), b"2024-01-01 00:00:00", b"dup"])
                .await,
            Err(Error::DuplicateKey)
        ));

        let updated = store
            .update(
                primary,
                Op::Eq,
                &[b"a".as_slice()],
                &[b"a".as_slice(), b"2024-01-01 00:00:01", b"two"],
                1,
                0,
            )
            .await
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(store.row_count("session", "php_session"), 1);

        let missing = store.find(primary, Op::Eq, &[b"b".as_slice()], 1, 0).await.unwrap();
        assert!(missing.is_empty());

        assert_eq!(store.delete(primary, Op::Eq, &[b"a".as_slice()], 1, 0).await.unwrap(), 1);
        assert_eq!(store.delete(primary, Op::Eq, &[b"a".as_slice()], 1, 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_range_delete_on_secondary_index() {
        let store = session_store().await;
        put(&store, "old-1", "2024-01-01 00:00:00", "x").await;
        put(&store, "old-2", "2024-01-01 00:30:00", "x").await;
        put(&store, "new", "2024-01-01 02:00:00", "x").await;

        let gc = Binding::GarbageCollection.handle();
        let cutoff = b"2024-01-01 01:00:00".as_slice();

        assert!(store.find(gc, Op::Lt, &[cutoff], 10, 0).await.unwrap()[0].is_empty());
        assert_eq!(store.delete(gc, Op::Lt, &[cutoff], 1, 0).await.unwrap(), 1);
        assert_eq!(store.delete(gc, Op::Lt, &[cutoff], 10, 0).await.unwrap(), 1);
        assert_eq!(store.row_count("session", "php_session"), 1);
    }

    #[tokio::test]
    async fn test_unknown_index_and_handle() {
        let store = MemoryStore::new().with_session_table("session", "php_session");
        let spec = IndexSpec {
            db: "session",
            table: "php_session",
            index: "expires",
            fields: &[],
        };
        assert!(matches!(
            store.open_index(IndexId::new(3), &spec).await,
            Err(Error::IndexMissing { .. })
        ));
        assert!(matches!(
            store.find(IndexId::new(3), Op::Eq, &[b"a".as_slice()], 1, 0).await,
            Err(Error::Server { .. })
        ));
    }
}
