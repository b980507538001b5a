//! redb-backed index storage for one dataset.
//!
//! One database file per dataset holds the default index table plus one
//! table per filtered index. Keys iterate in byte order, which is the
//! storage order filtered indexes inherit their positions from.
//!
//! "Not found" on gets and deletes is absorbed here (treated as already
//! absent); every other storage error is fatal and propagates.

use std::path::Path;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};

use super::IndexError;
use crate::marshal::Object;

const DEFAULT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("default");

/// A default-index value: the deserialized object, or a sentinel recording
/// that the object path is known but not yet deserialized.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultEntry {
    Pending,
    Object(Object),
}

impl DefaultEntry {
    fn encode(&self) -> Vec<u8> {
        match self {
            // No serialized object is empty, so the empty value is a safe
            // sentinel.
            DefaultEntry::Pending => Vec::new(),
            DefaultEntry::Object(object) => {
                serde_json::to_vec(object).expect("JSON value serializes")
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, IndexError> {
        if bytes.is_empty() {
            return Ok(DefaultEntry::Pending);
        }
        serde_json::from_slice(bytes)
            .map(DefaultEntry::Object)
            .map_err(IndexError::Corrupt)
    }
}

/// Handle to one dataset's index database.
pub struct IndexStore {
    db: Database,
}

impl IndexStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(|e| IndexError::Open {
            path: path.display().to_string(),
            source: e,
        })?;
        // Make sure the default table exists so reads never miss it.
        let wtx = db.begin_write()?;
        wtx.open_table(DEFAULT_TABLE)?;
        wtx.commit()?;
        Ok(IndexStore { db })
    }

    // -- default index -------------------------------------------------------

    pub fn put_default(&self, path: &str, entry: &DefaultEntry) -> Result<(), IndexError> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(DEFAULT_TABLE)?;
            table.insert(path, entry.encode().as_slice())?;
        }
        wtx.commit()?;
        Ok(())
    }

    /// Insert the pending sentinel unless the path is already present.
    /// Returns whether a new entry was created.
    pub fn insert_pending_if_absent(&self, path: &str) -> Result<bool, IndexError> {
        let wtx = self.db.begin_write()?;
        let inserted;
        {
            let mut table = wtx.open_table(DEFAULT_TABLE)?;
            inserted = table.get(path)?.is_none();
            if inserted {
                table.insert(path, [].as_slice())?;
            }
        }
        wtx.commit()?;
        Ok(inserted)
    }

    pub fn get_default(&self, path: &str) -> Result<Option<DefaultEntry>, IndexError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(DEFAULT_TABLE)?;
        match table.get(path)? {
            Some(guard) => Ok(Some(DefaultEntry::decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Delete an entry; deleting an absent path is not an error.
    pub fn delete_default(&self, path: &str) -> Result<(), IndexError> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(DEFAULT_TABLE)?;
            table.remove(path)?;
        }
        wtx.commit()?;
        Ok(())
    }

    pub fn default_len(&self) -> Result<u64, IndexError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(DEFAULT_TABLE)?;
        Ok(table.len()?)
    }

    /// All default-index keys in storage order.
    pub fn default_paths(&self) -> Result<Vec<String>, IndexError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(DEFAULT_TABLE)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (key, _) = item?;
            out.push(key.value().to_owned());
        }
        Ok(out)
    }

    /// Visit every default entry in storage order.
    pub fn for_each_default(
        &self,
        mut f: impl FnMut(&str, DefaultEntry) -> Result<(), IndexError>,
    ) -> Result<(), IndexError> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(DEFAULT_TABLE)?;
        for item in table.iter()? {
            let (key, value) = item?;
            f(key.value(), DefaultEntry::decode(value.value())?)?;
        }
        Ok(())
    }

    /// Remove every default entry whose path is not in `keep`.
    ///
    /// Heals entries left behind by changes made while the dataset was
    /// unloaded; the cache must always converge to the working copy.
    pub fn retain_default(
        &self,
        keep: &std::collections::BTreeSet<String>,
    ) -> Result<usize, IndexError> {
        let stale: Vec<String> = self
            .default_paths()?
            .into_iter()
            .filter(|path| !keep.contains(path))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(DEFAULT_TABLE)?;
            for path in &stale {
                table.remove(path.as_str())?;
            }
        }
        wtx.commit()?;
        Ok(stale.len())
    }

    // -- filtered indexes ----------------------------------------------------

    /// Replace a filtered index's contents wholesale: position → path,
    /// dense from 0, in the order given.
    pub fn replace_filtered(&self, id: &str, paths: &[String]) -> Result<(), IndexError> {
        let name = filtered_table_name(id);
        let def: TableDefinition<u64, &str> = TableDefinition::new(&name);
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(def)?;
            // Clear, then refill; never patched in place.
            let existing: Vec<u64> = table
                .iter()?
                .map(|item| item.map(|(k, _)| k.value()))
                .collect::<Result<_, _>>()?;
            for key in existing {
                table.remove(key)?;
            }
            for (pos, path) in paths.iter().enumerate() {
                table.insert(pos as u64, path.as_str())?;
            }
        }
        wtx.commit()?;
        Ok(())
    }

    pub fn filtered_get(&self, id: &str, position: u64) -> Result<Option<String>, IndexError> {
        let name = filtered_table_name(id);
        let def: TableDefinition<u64, &str> = TableDefinition::new(&name);
        let rtx = self.db.begin_read()?;
        let table = match rtx.open_table(def) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(table.get(position)?.map(|guard| guard.value().to_owned()))
    }

    /// Inverse positional lookup, by linear scan of the filtered index.
    pub fn filtered_position_of(
        &self,
        id: &str,
        path: &str,
    ) -> Result<Option<u64>, IndexError> {
        let name = filtered_table_name(id);
        let def: TableDefinition<u64, &str> = TableDefinition::new(&name);
        let rtx = self.db.begin_read()?;
        let table = match rtx.open_table(def) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        for item in table.iter()? {
            let (pos, candidate) = item?;
            if candidate.value() == path {
                return Ok(Some(pos.value()));
            }
        }
        Ok(None)
    }

    pub fn filtered_len(&self, id: &str) -> Result<u64, IndexError> {
        let name = filtered_table_name(id);
        let def: TableDefinition<u64, &str> = TableDefinition::new(&name);
        let rtx = self.db.begin_read()?;
        match rtx.open_table(def) {
            Ok(table) => Ok(table.len()?),
            Err(redb::TableError::TableDoesNotExist(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

fn filtered_table_name(id: &str) -> String {
    format!("filtered/{id}")
}
