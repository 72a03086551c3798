// src/storage/cache.rs

//! Process-wide LRU cache in front of the package storage
//!
//! Entries are keyed by `(storage, name)` with a secondary `(storage, id)`
//! index. Lookups promote to most-recently-used; insertions evict the
//! least-recently-used entry on overflow. The cache mutex is never held
//! while a storage transaction runs: read-modify-write operations re-read
//! the old row inside the transaction when the cache missed, so readers
//! may observe an old cache or old storage state but never a half-merged
//! entry.

use crate::error::Result;
use crate::packages::Package;
use crate::storage::{DatabaseStorage, StorageID};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Outcome of a [`PackageCache::store`] call
#[derive(Debug, Default)]
pub struct StoreResult {
    pub id: StorageID,
    pub old_entry: Option<Arc<Package>>,
    pub updated: bool,
}

#[derive(Clone)]
struct CachedPackage {
    id: StorageID,
    entry: Arc<Package>,
}

struct CacheEntries {
    lru: LruCache<(u64, String), CachedPackage>,
    by_id: HashMap<(u64, StorageID), String>,
}

impl CacheEntries {
    fn insert(&mut self, storage_ref: u64, name: String, cached: CachedPackage) {
        let new_id = cached.id;
        self.by_id.insert((storage_ref, new_id), name.clone());
        if let Some(((evicted_ref, evicted_name), evicted)) =
            self.lru.push((storage_ref, name.clone()), cached)
        {
            // push returns the displaced LRU entry, or the replaced value
            // under the same key
            if evicted_ref == storage_ref && evicted_name == name && evicted.id == new_id {
                return;
            }
            if self.by_id.get(&(evicted_ref, evicted.id)) == Some(&evicted_name) {
                self.by_id.remove(&(evicted_ref, evicted.id));
            }
        }
    }

    fn remove(&mut self, storage_ref: u64, name: &str) {
        if let Some(cached) = self.lru.pop(&(storage_ref, name.to_string())) {
            self.by_id.remove(&(storage_ref, cached.id));
        }
    }
}

/// Bounded cache of hot package entries shared by all database storages
pub struct PackageCache {
    entries: Mutex<CacheEntries>,
}

impl PackageCache {
    pub fn new(limit: usize) -> Self {
        let limit = NonZeroUsize::new(limit.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(CacheEntries {
                lru: LruCache::new(limit),
                by_id: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheEntries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up an entry by storage id, falling back to a read transaction
    pub fn retrieve_by_id(
        &self,
        storage: &DatabaseStorage,
        id: StorageID,
    ) -> Result<Option<(StorageID, Arc<Package>)>> {
        let storage_ref = storage.storage_ref();
        {
            let mut entries = self.lock();
            if let Some(name) = entries.by_id.get(&(storage_ref, id)).cloned() {
                if let Some(cached) = entries.lru.get(&(storage_ref, name)) {
                    return Ok(Some((cached.id, Arc::clone(&cached.entry))));
                }
            }
        }
        let txn = storage.ro_transaction()?;
        let Some((id, package)) = storage.get_package_by_id(txn.conn(), id)? else {
            return Ok(None);
        };
        drop(txn);
        let entry = Arc::new(package);
        self.lock().insert(
            storage_ref,
            entry.name.clone(),
            CachedPackage {
                id,
                entry: Arc::clone(&entry),
            },
        );
        Ok(Some((id, entry)))
    }

    /// Look up an entry by name, falling back to a read transaction
    pub fn retrieve(
        &self,
        storage: &DatabaseStorage,
        name: &str,
    ) -> Result<Option<(StorageID, Arc<Package>)>> {
        let storage_ref = storage.storage_ref();
        {
            let mut entries = self.lock();
            if let Some(cached) = entries.lru.get(&(storage_ref, name.to_string())) {
                trace!("cache hit for {}", name);
                return Ok(Some((cached.id, Arc::clone(&cached.entry))));
            }
        }
        let txn = storage.ro_transaction()?;
        let Some((id, package)) = storage.get_package_by_name(txn.conn(), name)? else {
            return Ok(None);
        };
        drop(txn);
        let entry = Arc::new(package);
        self.lock().insert(
            storage_ref,
            name.to_string(),
            CachedPackage {
                id,
                entry: Arc::clone(&entry),
            },
        );
        Ok(Some((id, entry)))
    }

    /// Atomic read-modify-write of one entry
    ///
    /// When an identical entry already exists and `force` is unset, nothing
    /// is written. Otherwise the entry inherits the contents-derived fields
    /// of the previous record (see
    /// [`Package::add_deps_and_provides_from_other_package`]), is written
    /// and committed, and the cache is updated afterwards.
    pub fn store(
        &self,
        storage: &DatabaseStorage,
        mut entry: Package,
        force: bool,
    ) -> Result<StoreResult> {
        let storage_ref = storage.storage_ref();
        let mut res = StoreResult::default();

        {
            let mut entries = self.lock();
            if let Some(cached) = entries.lru.get(&(storage_ref, entry.name.clone())) {
                res.id = cached.id;
                res.old_entry = Some(Arc::clone(&cached.entry));
                if *cached.entry == entry && !force {
                    return Ok(res);
                }
                entry.add_deps_and_provides_from_other_package(cached.entry.as_ref());
            }
        }

        let txn = storage.rw_transaction()?;
        if res.old_entry.is_none() {
            if let Some((id, old)) = storage.get_package_by_name(txn.conn(), &entry.name)? {
                entry.add_deps_and_provides_from_other_package(&old);
                res.id = id;
                res.old_entry = Some(Arc::new(old));
            }
        }
        let known_id = (res.id != 0).then_some(res.id);
        res.id = storage.put_package(txn.conn(), &entry, known_id)?;
        txn.commit()?;

        let name = entry.name.clone();
        let entry = Arc::new(entry);
        self.lock().insert(
            storage_ref,
            name,
            CachedPackage {
                id: res.id,
                entry,
            },
        );
        res.updated = true;
        Ok(res)
    }

    /// [`store`](Self::store) variant joining an externally held write
    /// transaction; used by bulk operations. The caller commits.
    pub fn store_in_txn(
        &self,
        storage: &DatabaseStorage,
        conn: &rusqlite::Connection,
        mut entry: Package,
    ) -> Result<StoreResult> {
        let storage_ref = storage.storage_ref();
        let mut res = StoreResult::default();

        {
            let mut entries = self.lock();
            if let Some(cached) = entries.lru.get(&(storage_ref, entry.name.clone())) {
                res.id = cached.id;
                res.old_entry = Some(Arc::clone(&cached.entry));
                entry.add_deps_and_provides_from_other_package(cached.entry.as_ref());
            }
        }
        if res.old_entry.is_none() {
            if let Some((id, old)) = storage.get_package_by_name(conn, &entry.name)? {
                entry.add_deps_and_provides_from_other_package(&old);
                res.id = id;
                res.old_entry = Some(Arc::new(old));
            }
        }
        let known_id = (res.id != 0).then_some(res.id);
        res.id = storage.put_package(conn, &entry, known_id)?;

        let name = entry.name.clone();
        let entry = Arc::new(entry);
        self.lock().insert(
            storage_ref,
            name,
            CachedPackage {
                id: res.id,
                entry,
            },
        );
        res.updated = true;
        Ok(res)
    }

    /// Drop an entry from cache and storage; returns whether a stored
    /// record existed
    pub fn invalidate(&self, storage: &DatabaseStorage, name: &str) -> Result<bool> {
        self.lock().remove(storage.storage_ref(), name);
        let txn = storage.rw_transaction()?;
        let existed = storage.delete_package(txn.conn(), name)?;
        if existed {
            txn.commit()?;
        }
        Ok(existed)
    }

    /// Truncate all five tables of the storage and drop its cache entries
    pub fn clear(&self, storage: &DatabaseStorage) -> Result<()> {
        self.clear_cache_only(storage);
        let txn = storage.rw_transaction()?;
        storage.clear_all_tables(txn.conn())?;
        txn.commit()?;
        Ok(())
    }

    /// Drop the storage's cache entries without touching storage; O(n)
    /// over the cache
    pub fn clear_cache_only(&self, storage: &DatabaseStorage) {
        let storage_ref = storage.storage_ref();
        let mut entries = self.lock();
        let stale: Vec<(u64, String)> = entries
            .lru
            .iter()
            .filter(|((r, _), _)| *r == storage_ref)
            .map(|(key, _)| key.clone())
            .collect();
        for (r, name) in stale {
            entries.remove(r, &name);
        }
    }

    /// Cached entry names of one storage in most-recently-used order
    pub fn cached_names_mru(&self, storage: &DatabaseStorage) -> Vec<String> {
        let storage_ref = storage.storage_ref();
        self.lock()
            .lru
            .iter()
            .filter(|((r, _), _)| *r == storage_ref)
            .map(|((_, name), _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::PackageOrigin;
    use crate::storage::StorageEnvironment;

    fn test_package(name: &str) -> Package {
        Package::from_pkg_file_name(&format!("{}-1.0-1-x86_64.pkg.tar.zst", name)).unwrap()
    }

    #[test]
    fn test_store_and_retrieve() {
        let env = StorageEnvironment::open_in_memory(8).unwrap();
        let storage = env.database_storage("core").unwrap();

        let res = env.cache().store(&storage, test_package("zlib"), false).unwrap();
        assert!(res.updated);
        assert!(res.old_entry.is_none());

        let (id, entry) = env.cache().retrieve(&storage, "zlib").unwrap().unwrap();
        assert_eq!(id, res.id);
        assert_eq!(entry.name, "zlib");

        let (_, by_id) = env.cache().retrieve_by_id(&storage, id).unwrap().unwrap();
        assert_eq!(by_id.name, "zlib");
    }

    #[test]
    fn test_store_identical_skips_write() {
        let env = StorageEnvironment::open_in_memory(8).unwrap();
        let storage = env.database_storage("core").unwrap();

        env.cache().store(&storage, test_package("zlib"), false).unwrap();
        let res = env.cache().store(&storage, test_package("zlib"), false).unwrap();
        assert!(!res.updated);
        assert!(res.old_entry.is_some());

        let forced = env.cache().store(&storage, test_package("zlib"), true).unwrap();
        assert!(forced.updated);
    }

    #[test]
    fn test_store_merges_contents_data() {
        let env = StorageEnvironment::open_in_memory(8).unwrap();
        let storage = env.database_storage("core").unwrap();

        let mut parsed = test_package("zlib");
        parsed.origin = PackageOrigin::PackageContents;
        parsed
            .libprovides
            .insert(crate::dependencies::LibraryId::elf("x86_64", "libz.so.1"));
        env.cache().store(&storage, parsed, false).unwrap();

        // a metadata refresh of the same build keeps the scraped data
        let res = env.cache().store(&storage, test_package("zlib"), true).unwrap();
        assert!(res.updated);
        let (_, entry) = env.cache().retrieve(&storage, "zlib").unwrap().unwrap();
        assert_eq!(entry.origin, PackageOrigin::PackageContents);
        assert!(entry
            .libprovides
            .contains(&crate::dependencies::LibraryId::elf("x86_64", "libz.so.1")));
    }

    #[test]
    fn test_merge_happens_without_cache_entry() {
        let env = StorageEnvironment::open_in_memory(8).unwrap();
        let storage = env.database_storage("core").unwrap();

        let mut parsed = test_package("zlib");
        parsed.origin = PackageOrigin::PackageContents;
        parsed
            .libprovides
            .insert(crate::dependencies::LibraryId::elf("x86_64", "libz.so.1"));
        env.cache().store(&storage, parsed, false).unwrap();
        env.cache().clear_cache_only(&storage);

        let res = env.cache().store(&storage, test_package("zlib"), true).unwrap();
        assert!(res.updated);
        let (_, entry) = env.cache().retrieve(&storage, "zlib").unwrap().unwrap();
        assert_eq!(entry.origin, PackageOrigin::PackageContents);
    }

    #[test]
    fn test_store_in_external_transaction() {
        let env = StorageEnvironment::open_in_memory(8).unwrap();
        let storage = env.database_storage("core").unwrap();

        // bulk store joining one transaction; nothing visible until commit
        {
            let txn = storage.rw_transaction().unwrap();
            for name in ["a", "b", "c"] {
                let res = env
                    .cache()
                    .store_in_txn(&storage, txn.conn(), test_package(name))
                    .unwrap();
                assert!(res.updated);
            }
            txn.commit().unwrap();
        }

        let txn = storage.ro_transaction().unwrap();
        assert_eq!(storage.package_count(txn.conn()).unwrap(), 3);
        drop(txn);
        assert!(env.cache().retrieve(&storage, "b").unwrap().is_some());
    }

    #[test]
    fn test_invalidate() {
        let env = StorageEnvironment::open_in_memory(8).unwrap();
        let storage = env.database_storage("core").unwrap();

        env.cache().store(&storage, test_package("zlib"), false).unwrap();
        assert!(env.cache().invalidate(&storage, "zlib").unwrap());
        assert!(env.cache().retrieve(&storage, "zlib").unwrap().is_none());
        assert!(!env.cache().invalidate(&storage, "zlib").unwrap());
    }

    #[test]
    fn test_lru_eviction_order() {
        let env = StorageEnvironment::open_in_memory(3).unwrap();
        let storage = env.database_storage("core").unwrap();
        let cache = env.cache();

        for name in ["a", "b", "c", "d"] {
            cache.store(&storage, test_package(name), false).unwrap();
        }
        // a evicted, MRU order d, c, b
        assert_eq!(cache.cached_names_mru(&storage), vec!["d", "c", "b"]);

        // touching b promotes it
        cache.retrieve(&storage, "b").unwrap().unwrap();
        cache.store(&storage, test_package("e"), false).unwrap();
        // c evicted, MRU order e, b, d
        assert_eq!(cache.cached_names_mru(&storage), vec!["e", "b", "d"]);

        // the evicted entries are still in storage
        assert!(cache.retrieve(&storage, "a").unwrap().is_some());
    }

    #[test]
    fn test_clear_drops_cache_and_storage() {
        let env = StorageEnvironment::open_in_memory(8).unwrap();
        let storage = env.database_storage("core").unwrap();

        env.cache().store(&storage, test_package("zlib"), false).unwrap();
        env.cache().clear(&storage).unwrap();
        assert!(env.cache().cached_names_mru(&storage).is_empty());
        assert!(env.cache().retrieve(&storage, "zlib").unwrap().is_none());
    }

    #[test]
    fn test_cache_isolated_per_storage() {
        let env = StorageEnvironment::open_in_memory(8).unwrap();
        let core = env.database_storage("core").unwrap();
        let extra = env.database_storage("extra").unwrap();

        env.cache().store(&core, test_package("zlib"), false).unwrap();
        assert!(env.cache().retrieve(&extra, "zlib").unwrap().is_none());
        assert!(env.cache().cached_names_mru(&extra).is_empty());
    }
}
