// src/storage/mod.rs

//! Persistent storage environment
//!
//! All databases share one storage environment (a single SQLite file).
//! Each database owns five named tables inside it: `<name>_packages`,
//! `<name>_provides`, `<name>_requires`, `<name>_libprovides` and
//! `<name>_librequires`. Rows are keyed by entry name with an
//! auto-assigned numeric [`StorageID`] as secondary key; values are
//! JSON-serialized.

pub mod cache;

use crate::error::{Error, Result};
use crate::packages::Package;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

pub use cache::{PackageCache, StoreResult};

/// Numeric secondary key of a stored entry; 0 is never assigned
pub type StorageID = u64;

/// The process-wide storage environment holding all database tables
pub struct StorageEnvironment {
    conn: Arc<Mutex<Connection>>,
    cache: PackageCache,
    storages: Mutex<std::collections::HashMap<String, Arc<DatabaseStorage>>>,
    next_storage_ref: AtomicU64,
}

impl StorageEnvironment {
    /// Open (or create) the environment file
    ///
    /// `cache_limit` bounds the process-wide package cache by entry count.
    pub fn open(path: &Path, cache_limit: usize) -> Result<Arc<Self>> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("unable to open \"{}\": {}", path.display(), e)))?;
        // journal_mode answers with the resulting mode
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Arc::new(Self {
            conn: Arc::new(Mutex::new(conn)),
            cache: PackageCache::new(cache_limit),
            storages: Mutex::new(std::collections::HashMap::new()),
            next_storage_ref: AtomicU64::new(1),
        }))
    }

    /// In-memory environment for tests and throwaway setups
    pub fn open_in_memory(cache_limit: usize) -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory()?;
        Ok(Arc::new(Self {
            conn: Arc::new(Mutex::new(conn)),
            cache: PackageCache::new(cache_limit),
            storages: Mutex::new(std::collections::HashMap::new()),
            next_storage_ref: AtomicU64::new(1),
        }))
    }

    pub fn cache(&self) -> &PackageCache {
        &self.cache
    }

    /// Open (or create) the per-database storage with its five tables
    ///
    /// The same handle is returned for repeated calls with the same name
    /// so cache keying stays stable.
    pub fn database_storage(&self, unique_name: &str) -> Result<Arc<DatabaseStorage>> {
        if let Some(existing) = self
            .storages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(unique_name)
        {
            return Ok(Arc::clone(existing));
        }
        if unique_name.is_empty()
            || !unique_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::Config(format!(
                "invalid storage table name \"{}\"",
                unique_name
            )));
        }
        let prefix = unique_name.replace('-', "_");
        {
            let conn = self.lock_conn();
            for suffix in TABLE_SUFFIXES {
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {prefix}{suffix} (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        name TEXT NOT NULL UNIQUE,
                        data TEXT NOT NULL
                    )"
                ))?;
            }
        }
        debug!("opened storage tables for \"{}\"", unique_name);
        let storage = Arc::new(DatabaseStorage {
            conn: Arc::clone(&self.conn),
            prefix,
            storage_ref: self.next_storage_ref.fetch_add(1, Ordering::Relaxed),
        });
        self.storages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(unique_name.to_string(), Arc::clone(&storage));
        Ok(storage)
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        // a poisoned mutex means another thread panicked mid-operation;
        // the transaction it held has rolled back, so the state is intact
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

const TABLE_SUFFIXES: [&str; 5] = [
    "_packages",
    "_provides",
    "_requires",
    "_libprovides",
    "_librequires",
];

/// The non-package tables of a database storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexTable {
    ProvidedDeps,
    RequiredDeps,
    ProvidedLibs,
    RequiredLibs,
}

impl IndexTable {
    fn suffix(self) -> &'static str {
        match self {
            IndexTable::ProvidedDeps => "_provides",
            IndexTable::RequiredDeps => "_requires",
            IndexTable::ProvidedLibs => "_libprovides",
            IndexTable::RequiredLibs => "_librequires",
        }
    }
}

/// Handle to one database's five tables within the shared environment
pub struct DatabaseStorage {
    conn: Arc<Mutex<Connection>>,
    prefix: String,
    /// Stable identifier used for cache keying
    storage_ref: u64,
}

impl DatabaseStorage {
    pub fn storage_ref(&self) -> u64 {
        self.storage_ref
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Begin a read-only transaction
    pub fn ro_transaction(&self) -> Result<RoTransaction<'_>> {
        let guard = self.lock_conn();
        guard.execute_batch("BEGIN DEFERRED")?;
        Ok(RoTransaction { guard })
    }

    /// Begin a read-write transaction; exclusive, aborted on drop
    pub fn rw_transaction(&self) -> Result<RwTransaction<'_>> {
        let guard = self.lock_conn();
        guard.execute_batch("BEGIN IMMEDIATE")?;
        Ok(RwTransaction {
            guard,
            finished: false,
        })
    }

    pub fn get_package_by_name(
        &self,
        conn: &Connection,
        name: &str,
    ) -> Result<Option<(StorageID, Package)>> {
        let row: Option<(i64, String)> = conn
            .query_row(
                &format!("SELECT id, data FROM {}_packages WHERE name = ?1", self.prefix),
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(id, data)| Ok((id as StorageID, serde_json::from_str(&data)?)))
            .transpose()
    }

    pub fn get_package_by_id(
        &self,
        conn: &Connection,
        id: StorageID,
    ) -> Result<Option<(StorageID, Package)>> {
        let row: Option<String> = conn
            .query_row(
                &format!("SELECT data FROM {}_packages WHERE id = ?1", self.prefix),
                params![id as i64],
                |row| row.get(0),
            )
            .optional()?;
        row.map(|data| Ok((id, serde_json::from_str(&data)?))).transpose()
    }

    /// Insert or update a package row; returns its storage id
    pub fn put_package(
        &self,
        conn: &Connection,
        package: &Package,
        known_id: Option<StorageID>,
    ) -> Result<StorageID> {
        let data = serde_json::to_string(package)?;
        if let Some(id) = known_id {
            conn.execute(
                &format!(
                    "INSERT INTO {0}_packages (id, name, data) VALUES (?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name, data = excluded.data",
                    self.prefix
                ),
                params![id as i64, package.name, data],
            )?;
            return Ok(id);
        }
        conn.execute(
            &format!(
                "INSERT INTO {0}_packages (name, data) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET data = excluded.data",
                self.prefix
            ),
            params![package.name, data],
        )?;
        let id: i64 = conn.query_row(
            &format!("SELECT id FROM {}_packages WHERE name = ?1", self.prefix),
            params![package.name],
            |row| row.get(0),
        )?;
        Ok(id as StorageID)
    }

    /// Delete a package row; returns whether a record existed
    pub fn delete_package(&self, conn: &Connection, name: &str) -> Result<bool> {
        let rows = conn.execute(
            &format!("DELETE FROM {}_packages WHERE name = ?1", self.prefix),
            params![name],
        )?;
        Ok(rows > 0)
    }

    /// Replace one key of an index table with the given package-name list
    pub fn put_index_entry(
        &self,
        conn: &Connection,
        table: IndexTable,
        key: &str,
        package_names: &[String],
    ) -> Result<()> {
        let data = serde_json::to_string(package_names)?;
        conn.execute(
            &format!(
                "INSERT INTO {0}{1} (name, data) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET data = excluded.data",
                self.prefix,
                table.suffix()
            ),
            params![key, data],
        )?;
        Ok(())
    }

    pub fn get_index_entry(
        &self,
        conn: &Connection,
        table: IndexTable,
        key: &str,
    ) -> Result<Option<Vec<String>>> {
        let row: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT data FROM {0}{1} WHERE name = ?1",
                    self.prefix,
                    table.suffix()
                ),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        row.map(|data| Ok(serde_json::from_str(&data)?)).transpose()
    }

    /// Truncate an index table
    pub fn clear_index(&self, conn: &Connection, table: IndexTable) -> Result<()> {
        conn.execute_batch(&format!("DELETE FROM {}{}", self.prefix, table.suffix()))?;
        Ok(())
    }

    /// Truncate all five tables
    pub fn clear_all_tables(&self, conn: &Connection) -> Result<()> {
        for suffix in TABLE_SUFFIXES {
            conn.execute_batch(&format!("DELETE FROM {}{}", self.prefix, suffix))?;
        }
        Ok(())
    }

    pub fn package_count(&self, conn: &Connection) -> Result<u64> {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}_packages", self.prefix),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

/// A read-only transaction; rolled back on drop
pub struct RoTransaction<'env> {
    guard: MutexGuard<'env, Connection>,
}

impl RoTransaction<'_> {
    pub fn conn(&self) -> &Connection {
        &self.guard
    }
}

impl Drop for RoTransaction<'_> {
    fn drop(&mut self) {
        let _ = self.guard.execute_batch("ROLLBACK");
    }
}

/// A read-write transaction; committed explicitly, aborted on drop
pub struct RwTransaction<'env> {
    guard: MutexGuard<'env, Connection>,
    finished: bool,
}

impl RwTransaction<'_> {
    pub fn conn(&self) -> &Connection {
        &self.guard
    }

    pub fn commit(mut self) -> Result<()> {
        self.guard.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for RwTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.guard.execute_batch("ROLLBACK");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_package(name: &str, version: &str) -> Package {
        Package::from_pkg_file_name(&format!("{}-{}-x86_64.pkg.tar.zst", name, version)).unwrap()
    }

    #[test]
    fn test_put_and_get_by_name_and_id() {
        let env = StorageEnvironment::open_in_memory(16).unwrap();
        let storage = env.database_storage("core").unwrap();

        let pkg = test_package("zlib", "1.2.11-4");
        let txn = storage.rw_transaction().unwrap();
        let id = storage.put_package(txn.conn(), &pkg, None).unwrap();
        txn.commit().unwrap();
        assert!(id > 0);

        let txn = storage.ro_transaction().unwrap();
        let (found_id, found) = storage
            .get_package_by_name(txn.conn(), "zlib")
            .unwrap()
            .unwrap();
        assert_eq!(found_id, id);
        assert_eq!(found, pkg);

        let (_, by_id) = storage.get_package_by_id(txn.conn(), id).unwrap().unwrap();
        assert_eq!(by_id.name, "zlib");
    }

    #[test]
    fn test_upsert_keeps_id() {
        let env = StorageEnvironment::open_in_memory(16).unwrap();
        let storage = env.database_storage("core").unwrap();

        let txn = storage.rw_transaction().unwrap();
        let id1 = storage
            .put_package(txn.conn(), &test_package("zlib", "1.2.11-4"), None)
            .unwrap();
        let id2 = storage
            .put_package(txn.conn(), &test_package("zlib", "1.2.12-1"), None)
            .unwrap();
        txn.commit().unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_rollback_on_drop() {
        let env = StorageEnvironment::open_in_memory(16).unwrap();
        let storage = env.database_storage("core").unwrap();

        {
            let txn = storage.rw_transaction().unwrap();
            storage
                .put_package(txn.conn(), &test_package("zlib", "1.2.11-4"), None)
                .unwrap();
            // dropped without commit
        }

        let txn = storage.ro_transaction().unwrap();
        assert!(storage
            .get_package_by_name(txn.conn(), "zlib")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_index_tables_round_trip() {
        let env = StorageEnvironment::open_in_memory(16).unwrap();
        let storage = env.database_storage("core").unwrap();

        let txn = storage.rw_transaction().unwrap();
        storage
            .put_index_entry(
                txn.conn(),
                IndexTable::ProvidedLibs,
                "elf-x86_64::libz.so.1",
                &["zlib".to_string()],
            )
            .unwrap();
        txn.commit().unwrap();

        let txn = storage.ro_transaction().unwrap();
        assert_eq!(
            storage
                .get_index_entry(txn.conn(), IndexTable::ProvidedLibs, "elf-x86_64::libz.so.1")
                .unwrap(),
            Some(vec!["zlib".to_string()])
        );
    }

    #[test]
    fn test_clear_all_tables() {
        let env = StorageEnvironment::open_in_memory(16).unwrap();
        let storage = env.database_storage("core").unwrap();

        let txn = storage.rw_transaction().unwrap();
        storage
            .put_package(txn.conn(), &test_package("zlib", "1.2.11-4"), None)
            .unwrap();
        storage
            .put_index_entry(txn.conn(), IndexTable::RequiredDeps, "glibc", &[])
            .unwrap();
        txn.commit().unwrap();

        let txn = storage.rw_transaction().unwrap();
        storage.clear_all_tables(txn.conn()).unwrap();
        txn.commit().unwrap();

        let txn = storage.ro_transaction().unwrap();
        assert_eq!(storage.package_count(txn.conn()).unwrap(), 0);
        assert!(storage
            .get_index_entry(txn.conn(), IndexTable::RequiredDeps, "glibc")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_rejects_bad_table_names() {
        let env = StorageEnvironment::open_in_memory(16).unwrap();
        assert!(env.database_storage("evil; DROP TABLE x").is_err());
    }
}
