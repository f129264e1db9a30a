//! Row storage seam.
//!
//! The engine talks to persistence through [`RowStore`]: batched reads,
//! partial-row writes, existence checks and the reverse-reference scan
//! cross-model invalidation relies on. Two backends ship here — an
//! in-memory store for tests and scratch work, and a redb-backed store
//! for durable single-node deployments.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::OrmError;
use crate::value::{Row, Value};

/// Storage interface for model rows.
///
/// Ids are allocated by the store, monotonically per model, starting
/// at 1 (0 stays the "new record" sentinel). All operations are
/// batched: computing or invalidating a field over N records must not
/// issue O(N) store calls.
pub trait RowStore: Send + Sync {
    /// Insert a row, returning its new id.
    fn create(&self, model: &str, values: &Row) -> Result<i64, OrmError>;

    /// Read full rows for `ids`, in input order, skipping missing ids.
    fn read(&self, model: &str, ids: &[i64]) -> Result<Vec<(i64, Row)>, OrmError>;

    /// Merge `values` into each row. Fails on the first missing id.
    fn write(&self, model: &str, ids: &[i64], values: &Row) -> Result<(), OrmError>;

    /// Delete rows. Missing ids are ignored.
    fn delete(&self, model: &str, ids: &[i64]) -> Result<(), OrmError>;

    /// Subset of `ids` that have a backing row, in input order.
    fn exists(&self, model: &str, ids: &[i64]) -> Result<Vec<i64>, OrmError>;

    /// Ids of `model` rows whose relational `field` references any of
    /// `targets` (`Ref` match or `RefList` overlap). Ascending order.
    fn search_ref(&self, model: &str, field: &str, targets: &[i64]) -> Result<Vec<i64>, OrmError>;

    /// All ids of a model, ascending.
    fn search_all(&self, model: &str) -> Result<Vec<i64>, OrmError>;
}

fn value_references(value: &Value, targets: &[i64]) -> bool {
    match value {
        Value::Ref(id) => targets.contains(id),
        Value::RefList(ids) => ids.iter().any(|id| targets.contains(id)),
        _ => false,
    }
}

// ── MemStore ────────────────────────────────────────────────────────

/// In-memory RowStore. The default backend for tests and for onchange
/// scratch environments layered over a durable store.
pub struct MemStore {
    rows: RwLock<BTreeMap<String, BTreeMap<i64, Row>>>,
    seq: RwLock<BTreeMap<String, i64>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            seq: RwLock::new(BTreeMap::new()),
        }
    }
}

impl RowStore for MemStore {
    fn create(&self, model: &str, values: &Row) -> Result<i64, OrmError> {
        let mut seq = self.seq.write().unwrap();
        let next = seq.entry(model.to_string()).or_insert(0);
        *next += 1;
        let id = *next;
        drop(seq);

        let mut rows = self.rows.write().unwrap();
        rows.entry(model.to_string())
            .or_default()
            .insert(id, values.clone());
        Ok(id)
    }

    fn read(&self, model: &str, ids: &[i64]) -> Result<Vec<(i64, Row)>, OrmError> {
        let rows = self.rows.read().unwrap();
        let table = rows.get(model);
        let mut out = Vec::new();
        for id in ids {
            if let Some(row) = table.and_then(|t| t.get(id)) {
                out.push((*id, row.clone()));
            }
        }
        Ok(out)
    }

    fn write(&self, model: &str, ids: &[i64], values: &Row) -> Result<(), OrmError> {
        let mut rows = self.rows.write().unwrap();
        let table = rows.entry(model.to_string()).or_default();
        for id in ids {
            let row = table.get_mut(id).ok_or_else(|| OrmError::MissingRecord {
                model: model.to_string(),
                id: *id,
            })?;
            for (k, v) in values {
                row.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }

    fn delete(&self, model: &str, ids: &[i64]) -> Result<(), OrmError> {
        let mut rows = self.rows.write().unwrap();
        if let Some(table) = rows.get_mut(model) {
            for id in ids {
                table.remove(id);
            }
        }
        Ok(())
    }

    fn exists(&self, model: &str, ids: &[i64]) -> Result<Vec<i64>, OrmError> {
        let rows = self.rows.read().unwrap();
        let table = rows.get(model);
        Ok(ids
            .iter()
            .copied()
            .filter(|id| table.map_or(false, |t| t.contains_key(id)))
            .collect())
    }

    fn search_ref(&self, model: &str, field: &str, targets: &[i64]) -> Result<Vec<i64>, OrmError> {
        let rows = self.rows.read().unwrap();
        let mut out = Vec::new();
        if let Some(table) = rows.get(model) {
            for (id, row) in table {
                if row
                    .get(field)
                    .map_or(false, |v| value_references(v, targets))
                {
                    out.push(*id);
                }
            }
        }
        Ok(out)
    }

    fn search_all(&self, model: &str) -> Result<Vec<i64>, OrmError> {
        let rows = self.rows.read().unwrap();
        Ok(rows
            .get(model)
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default())
    }
}

// ── RedbStore ───────────────────────────────────────────────────────

const ROWS: TableDefinition<&str, &[u8]> = TableDefinition::new("rows");
const SEQ: TableDefinition<&str, i64> = TableDefinition::new("seq");

/// RowStore backed by redb — a pure-Rust embedded key-value database.
///
/// Rows are stored as JSON under `"{model}:{id:020}"` keys; the zero
/// padding keeps per-model keys contiguous and ordered for prefix scans.
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a redb database at the given path.
    pub fn open(path: &Path) -> Result<Self, OrmError> {
        let db = Database::create(path).map_err(|e| OrmError::Storage(e.to_string()))?;

        // Ensure both tables exist by doing a write transaction.
        let write_txn = db
            .begin_write()
            .map_err(|e| OrmError::Storage(e.to_string()))?;
        {
            let _rows = write_txn
                .open_table(ROWS)
                .map_err(|e| OrmError::Storage(e.to_string()))?;
            let _seq = write_txn
                .open_table(SEQ)
                .map_err(|e| OrmError::Storage(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| OrmError::Storage(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn row_key(model: &str, id: i64) -> String {
        format!("{}:{:020}", model, id)
    }

    fn decode_row(bytes: &[u8]) -> Result<Row, OrmError> {
        serde_json::from_slice(bytes).map_err(|e| OrmError::Storage(e.to_string()))
    }

    fn encode_row(row: &Row) -> Result<Vec<u8>, OrmError> {
        serde_json::to_vec(row).map_err(|e| OrmError::Storage(e.to_string()))
    }

    /// Scan all `(id, row)` pairs of a model, ascending by id.
    fn scan_model(&self, model: &str) -> Result<Vec<(i64, Row)>, OrmError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| OrmError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(ROWS)
            .map_err(|e| OrmError::Storage(e.to_string()))?;

        let prefix = format!("{}:", model);
        let mut out = Vec::new();
        let iter = table
            .range(prefix.as_str()..)
            .map_err(|e| OrmError::Storage(e.to_string()))?;
        for entry in iter {
            let entry = entry.map_err(|e| OrmError::Storage(e.to_string()))?;
            let key = entry.0.value().to_string();
            if !key.starts_with(&prefix) {
                break;
            }
            let id: i64 = key[prefix.len()..]
                .parse()
                .map_err(|_| OrmError::Storage(format!("malformed row key: {}", key)))?;
            out.push((id, Self::decode_row(entry.1.value())?));
        }
        Ok(out)
    }
}

impl RowStore for RedbStore {
    fn create(&self, model: &str, values: &Row) -> Result<i64, OrmError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| OrmError::Storage(e.to_string()))?;
        let id;
        {
            let mut seq = write_txn
                .open_table(SEQ)
                .map_err(|e| OrmError::Storage(e.to_string()))?;
            let next = match seq.get(model) {
                Ok(Some(v)) => v.value() + 1,
                Ok(None) => 1,
                Err(e) => return Err(OrmError::Storage(e.to_string())),
            };
            seq.insert(model, next)
                .map_err(|e| OrmError::Storage(e.to_string()))?;
            id = next;

            let mut rows = write_txn
                .open_table(ROWS)
                .map_err(|e| OrmError::Storage(e.to_string()))?;
            rows.insert(
                Self::row_key(model, id).as_str(),
                Self::encode_row(values)?.as_slice(),
            )
            .map_err(|e| OrmError::Storage(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| OrmError::Storage(e.to_string()))?;
        Ok(id)
    }

    fn read(&self, model: &str, ids: &[i64]) -> Result<Vec<(i64, Row)>, OrmError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| OrmError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(ROWS)
            .map_err(|e| OrmError::Storage(e.to_string()))?;

        let mut out = Vec::new();
        for id in ids {
            match table.get(Self::row_key(model, *id).as_str()) {
                Ok(Some(bytes)) => out.push((*id, Self::decode_row(bytes.value())?)),
                Ok(None) => {}
                Err(e) => return Err(OrmError::Storage(e.to_string())),
            }
        }
        Ok(out)
    }

    fn write(&self, model: &str, ids: &[i64], values: &Row) -> Result<(), OrmError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| OrmError::Storage(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(ROWS)
                .map_err(|e| OrmError::Storage(e.to_string()))?;
            for id in ids {
                let key = Self::row_key(model, *id);
                let mut row = match table.get(key.as_str()) {
                    Ok(Some(bytes)) => Self::decode_row(bytes.value())?,
                    Ok(None) => {
                        return Err(OrmError::MissingRecord {
                            model: model.to_string(),
                            id: *id,
                        });
                    }
                    Err(e) => return Err(OrmError::Storage(e.to_string())),
                };
                for (k, v) in values {
                    row.insert(k.clone(), v.clone());
                }
                table
                    .insert(key.as_str(), Self::encode_row(&row)?.as_slice())
                    .map_err(|e| OrmError::Storage(e.to_string()))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| OrmError::Storage(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, model: &str, ids: &[i64]) -> Result<(), OrmError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| OrmError::Storage(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(ROWS)
                .map_err(|e| OrmError::Storage(e.to_string()))?;
            for id in ids {
                table
                    .remove(Self::row_key(model, *id).as_str())
                    .map_err(|e| OrmError::Storage(e.to_string()))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| OrmError::Storage(e.to_string()))?;
        Ok(())
    }

    fn exists(&self, model: &str, ids: &[i64]) -> Result<Vec<i64>, OrmError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| OrmError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(ROWS)
            .map_err(|e| OrmError::Storage(e.to_string()))?;

        let mut out = Vec::new();
        for id in ids {
            match table.get(Self::row_key(model, *id).as_str()) {
                Ok(Some(_)) => out.push(*id),
                Ok(None) => {}
                Err(e) => return Err(OrmError::Storage(e.to_string())),
            }
        }
        Ok(out)
    }

    fn search_ref(&self, model: &str, field: &str, targets: &[i64]) -> Result<Vec<i64>, OrmError> {
        let mut out = Vec::new();
        for (id, row) in self.scan_model(model)? {
            if row
                .get(field)
                .map_or(false, |v| value_references(v, targets))
            {
                out.push(id);
            }
        }
        Ok(out)
    }

    fn search_all(&self, model: &str) -> Result<Vec<i64>, OrmError> {
        Ok(self.scan_model(model)?.into_iter().map(|(id, _)| id).collect())
    }
}
