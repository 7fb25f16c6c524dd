//! The database boundary: one record store plus two tree indexes per table.
//!
//! Rows are opaque to the storage stack; callers describe them through the
//! [`Row`] trait and serde, and the database serializes them with bincode.
//! For a database at path `P`, rows live in `P`, the unique primary index
//! (16-byte row id to record id) in `P.pidx`, and the non-unique secondary
//! index (a `(String, i32)` composite key to record id) in `P.sidx`.

use bstore_api::codec::{RowIdCodec, StrI32Codec, U32Codec};
use bstore_api::controller::Device;
use bstore_api::store::{RecordSupport, StoreSupport};
use bstore_api::types::{Geometry, RowId};
use log::debug;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use super::btree::{BTree, TreeOptions};
use super::error_store::DbError;
use super::node_manager::DEFAULT_MIN_ENTRIES;
use super::record_store::RecordStore;

/// A storable row: serializable, addressed by a unique 16-byte id, and
/// queryable through a composite `(String, i32)` secondary key.
pub trait Row: Serialize + DeserializeOwned {
    /// The unique identifier of this row
    fn id(&self) -> RowId;
    /// The secondary key this row is indexed under
    fn secondary_key(&self) -> (String, i32);
}

/// File name suffix of the primary index.
const PRIMARY_INDEX_EXT: &str = "pidx";
/// File name suffix of the secondary index.
const SECONDARY_INDEX_EXT: &str = "sidx";

fn side_path(path: &Path, ext: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

/// An embedded single-table database of rows of type `R`.
pub struct Database<R> {
    records: RecordStore,
    primary: BTree<RowId, u32, RowIdCodec, U32Codec>,
    secondary: BTree<(String, i32), u32, StrI32Codec, U32Codec>,
    _rows: PhantomData<R>,
}

impl<R: Row> Database<R> {
    /// Open the database at `path`, creating its files on first use.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(DbError::Input("empty database path"));
        }
        let records = if path.exists() {
            RecordStore::mountstore(Device::load(path)?, Geometry::data_default())?
        } else {
            RecordStore::mkstore(path, Geometry::data_default())?
        };

        let primary_path = side_path(path, PRIMARY_INDEX_EXT);
        let primary_options = TreeOptions {
            unique: true,
            min_entries: DEFAULT_MIN_ENTRIES,
        };
        let primary = if primary_path.exists() {
            BTree::mountstore(
                Device::load(&primary_path)?,
                Geometry::index_default(),
                primary_options,
            )?
        } else {
            BTree::mkstore(&primary_path, Geometry::index_default(), primary_options)?
        };

        let secondary_path = side_path(path, SECONDARY_INDEX_EXT);
        let secondary_options = TreeOptions {
            unique: false,
            min_entries: DEFAULT_MIN_ENTRIES,
        };
        let secondary = if secondary_path.exists() {
            BTree::mountstore(
                Device::load(&secondary_path)?,
                Geometry::index_default(),
                secondary_options,
            )?
        } else {
            BTree::mkstore(&secondary_path, Geometry::index_default(), secondary_options)?
        };

        debug!("opened database at {}", path.display());
        Ok(Database {
            records,
            primary,
            secondary,
            _rows: PhantomData,
        })
    }

    /// Store a new row.
    /// Fails with [`DbError::KeyExists`] when a row with the same id is
    /// already present; nothing is written in that case.
    pub fn insert(&mut self, row: &R) -> Result<(), DbError> {
        let id = row.id();
        if self.primary.get(&id)?.is_some() {
            return Err(DbError::KeyExists);
        }
        let payload = bincode::serialize(row)?;
        let record_id = self.records.r_create(&payload)?;
        self.primary.insert(id, record_id)?;
        self.secondary.insert(row.secondary_key(), record_id)?;
        self.primary.save_changes()?;
        self.secondary.save_changes()?;
        Ok(())
    }

    /// Look up a row by its id.
    pub fn find(&mut self, id: &RowId) -> Result<Option<R>, DbError> {
        let record_id = match self.primary.get(id)? {
            Some((_, record_id)) => record_id,
            None => return Ok(None),
        };
        let payload = self
            .records
            .r_find(record_id)?
            .ok_or(DbError::NotFound)?;
        Ok(Some(bincode::deserialize(&payload)?))
    }

    /// All rows whose secondary key equals `(nationality, age)`, in index
    /// order. The scan walks the secondary index from the search key and
    /// stops at the first strictly greater key.
    pub fn find_by(&mut self, nationality: &str, age: i32) -> Result<Vec<R>, DbError> {
        let key = (nationality.to_string(), age);
        let mut record_ids = Vec::new();
        {
            let mut scan = self.secondary.larger_than_or_eq(&key)?;
            while let Some(item) = scan.next() {
                let (k, record_id) = item.map_err(DbError::Tree)?;
                if k > key {
                    break;
                }
                record_ids.push(record_id);
            }
        }
        let mut rows = Vec::with_capacity(record_ids.len());
        for record_id in record_ids {
            let payload = self
                .records
                .r_find(record_id)?
                .ok_or(DbError::NotFound)?;
            rows.push(bincode::deserialize(&payload)?);
        }
        Ok(rows)
    }

    /// Delete a row: drops its record and both index entries.
    /// Fails with [`DbError::NotFound`] when no row with this id exists.
    pub fn delete(&mut self, row: &R) -> Result<(), DbError> {
        let id = row.id();
        let record_id = match self.primary.get(&id)? {
            Some((_, record_id)) => record_id,
            None => return Err(DbError::NotFound),
        };
        self.primary.delete(&id)?;
        self.secondary
            .delete_by_value(&row.secondary_key(), &record_id, |a, b| a.cmp(b))?;
        self.records.r_delete(record_id)?;
        self.primary.save_changes()?;
        Ok(())
    }

    /// Close the database, flushing all three files.
    /// Consuming the handle makes use-after-close unrepresentable.
    pub fn close(mut self) -> Result<(), DbError> {
        self.primary.save_changes()?;
        self.secondary.save_changes()?;
        let Database {
            records,
            primary,
            secondary,
            ..
        } = self;
        let dev = records.unmountstore();
        dev.flush()?;
        let dev = primary.unmountstore();
        dev.flush()?;
        let dev = secondary.unmountstore();
        dev.flush()?;
        Ok(())
    }
}

// The scenario tests for this layer are shared through the api crate.
#[cfg(all(test, any(feature = "db", feature = "all")))]
#[path = "../../api/store-tests/db_test.rs"]
mod tests;
