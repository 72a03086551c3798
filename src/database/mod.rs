// src/database/mod.rs

//! Database model
//!
//! A [`Database`] holds the packages of one repository for one
//! architecture plus four inverted indices: provided/required dependencies
//! (by name) and provided/required libraries (by ABI-tagged soname). Every
//! add/remove/update keeps the indices consistent with the package map.

pub mod load;

use crate::config::Config;
use crate::dependencies::{Dependency, DependencySet, LibraryId};
use crate::packages::Package;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::BitOr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Index of a database within the config; the aur scratch database has a
/// reserved id
pub type DatabaseId = usize;

/// Reserved [`DatabaseId`] of the aur scratch database
pub const AUR_DATABASE_ID: DatabaseId = usize::MAX;

/// Serialisable identification of a database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub arch: String,
}

/// Reference to the database a search result came from
///
/// In-process results carry the live id; deserialised results carry the
/// snapshot. Serialisation resolves the live arm via the config (see
/// [`PackageSearchResult::to_serializable`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseHandle {
    Live(DatabaseId),
    Info(DatabaseInfo),
}

/// A package found in some database
#[derive(Debug, Clone)]
pub struct PackageSearchResult {
    pub db: DatabaseHandle,
    pub pkg: Arc<Package>,
}

impl PackageSearchResult {
    pub fn new(db: DatabaseId, pkg: Arc<Package>) -> Self {
        Self {
            db: DatabaseHandle::Live(db),
            pkg,
        }
    }

    /// Resolve the live database reference into a serialisable snapshot
    pub fn to_serializable(&self, config: &Config) -> SerializedSearchResult {
        let db = match &self.db {
            DatabaseHandle::Live(id) => config
                .database_by_id(*id)
                .map(|db| DatabaseInfo {
                    name: db.name.clone(),
                    arch: db.arch.clone(),
                })
                .unwrap_or_default(),
            DatabaseHandle::Info(info) => info.clone(),
        };
        SerializedSearchResult {
            db,
            pkg: self.pkg.as_ref().clone(),
        }
    }
}

impl PartialEq for PackageSearchResult {
    fn eq(&self, other: &Self) -> bool {
        self.db == other.db && self.pkg == other.pkg
    }
}

/// The wire form of a [`PackageSearchResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedSearchResult {
    pub db: DatabaseInfo,
    pub pkg: Package,
}

impl From<SerializedSearchResult> for PackageSearchResult {
    fn from(serialized: SerializedSearchResult) -> Self {
        Self {
            db: DatabaseHandle::Info(serialized.db),
            pkg: Arc::new(serialized.pkg),
        }
    }
}

/// How pacman is supposed to use a database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseUsage(u8);

impl DatabaseUsage {
    pub const NONE: DatabaseUsage = DatabaseUsage(0);
    pub const SYNC: DatabaseUsage = DatabaseUsage(1);
    pub const SEARCH: DatabaseUsage = DatabaseUsage(1 << 1);
    pub const INSTALL: DatabaseUsage = DatabaseUsage(1 << 2);
    pub const UPGRADE: DatabaseUsage = DatabaseUsage(1 << 3);
    pub const ALL: DatabaseUsage = DatabaseUsage((1 << 4) - 1);

    pub fn contains(self, other: DatabaseUsage) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DatabaseUsage {
    type Output = DatabaseUsage;
    fn bitor(self, rhs: Self) -> Self {
        DatabaseUsage(self.0 | rhs.0)
    }
}

/// Signature verification policy; recorded only, never enforced here
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureLevel {
    #[default]
    Default,
    Never,
    Optional,
    Required,
}

/// An update of one package relative to some source database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageUpdate {
    pub old_version: Option<SerializedSearchResult>,
    pub new_version: Option<SerializedSearchResult>,
}

/// Result of [`Database::check_for_updates`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageUpdates {
    /// Same package present in a source with a newer version
    pub version_updates: Vec<PackageUpdate>,
    /// Packages only present in the sources
    pub package_updates: Vec<PackageUpdate>,
    /// Same package present in a source with an older version
    pub downgrades: Vec<PackageUpdate>,
    /// Packages of this database absent from every source
    pub orphans: Vec<SerializedSearchResult>,
}

/// Still-unresolved dependencies and libraries of one package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedDependencies {
    pub deps: Vec<Dependency>,
    pub libs: Vec<LibraryId>,
}

/// Where a package file lives on disk relative to its repository
#[derive(Debug, Clone, Default)]
pub struct PackageLocation {
    pub path_within_repo: PathBuf,
    /// Target of the repo-dir symlink (canonical storage), empty when the
    /// package file is a regular file
    pub storage_location: PathBuf,
    pub error: Option<String>,
    pub exists: bool,
}

/// One repository database for one architecture
#[derive(Default)]
pub struct Database {
    pub name: String,
    /// Path of the `.db` tarball
    pub path: PathBuf,
    /// Path of the paired `.files` tarball
    pub files_path: PathBuf,
    pub mirrors: Vec<String>,
    pub packages: HashMap<String, Arc<Package>>,
    pub usage: DatabaseUsage,
    pub signature_level: SignatureLevel,
    pub arch: String,
    /// Names of databases this database's packages may depend on
    pub dependencies: Vec<String>,
    pub provided_deps: DependencySet,
    pub required_deps: DependencySet,
    pub provided_libs: HashMap<LibraryId, Vec<Arc<Package>>>,
    pub required_libs: HashMap<LibraryId, Vec<Arc<Package>>>,
    pub local_pkg_dir: PathBuf,
    pub local_db_dir: PathBuf,
    pub last_update: Option<DateTime<Utc>>,
    pub sync_from_mirror: bool,
    /// Set when the database disappeared from the config but may still be
    /// referenced by an in-flight action
    pub to_be_discarded: bool,
}

impl Database {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            arch: "x86_64".to_string(),
            ..Default::default()
        }
    }

    /// `.files` path derived from the regular `.db` path
    pub fn files_path_from_regular_path(&self) -> PathBuf {
        let path = self.path.to_string_lossy();
        match path.find(".db") {
            Some(pos) => PathBuf::from(format!("{}{}{}", &path[..pos], ".files", &path[pos + 3..])),
            None => PathBuf::new(),
        }
    }

    /// Record a package's dependencies/provides in all four indices
    pub fn add_package_dependencies(&mut self, package: &Arc<Package>) {
        self.provided_deps
            .add(&Dependency::exact(&*package.name, package.version.clone()), &package.name);
        for provide in &package.provides {
            self.provided_deps.add(provide, &package.name);
        }
        for dep in &package.deps {
            self.required_deps.add(dep, &package.name);
        }
        for lib in &package.libprovides {
            let entries = self.provided_libs.entry(lib.clone()).or_default();
            if !entries.iter().any(|p| p.name == package.name) {
                entries.push(Arc::clone(package));
            }
        }
        for lib in &package.libdepends {
            let entries = self.required_libs.entry(lib.clone()).or_default();
            if !entries.iter().any(|p| p.name == package.name) {
                entries.push(Arc::clone(package));
            }
        }
    }

    /// Remove a package's entries from all four indices
    pub fn remove_package_dependencies(&mut self, package: &Package) {
        self.provided_deps.remove(&package.name, &package.name);
        for provide in &package.provides {
            self.provided_deps.remove(&provide.name, &package.name);
        }
        for dep in &package.deps {
            self.required_deps.remove(&dep.name, &package.name);
        }
        for lib in &package.libprovides {
            if let Some(entries) = self.provided_libs.get_mut(lib) {
                entries.retain(|p| p.name != package.name);
                if entries.is_empty() {
                    self.provided_libs.remove(lib);
                }
            }
        }
        for lib in &package.libdepends {
            if let Some(entries) = self.required_libs.get_mut(lib) {
                entries.retain(|p| p.name != package.name);
                if entries.is_empty() {
                    self.required_libs.remove(lib);
                }
            }
        }
    }

    /// Insert or replace a package, skipping identical content
    pub fn update_package(&mut self, package: Arc<Package>) {
        if let Some(existing) = self.packages.get(&package.name) {
            if **existing == *package {
                return;
            }
        }
        self.force_update_package(package);
    }

    /// Insert or replace a package unconditionally
    pub fn force_update_package(&mut self, package: Arc<Package>) {
        if let Some(old) = self.packages.remove(&package.name) {
            self.remove_package_dependencies(&old);
        }
        self.add_package_dependencies(&package);
        self.packages.insert(package.name.clone(), package);
    }

    /// Remove a package and its index entries
    pub fn remove_package(&mut self, name: &str) -> Option<Arc<Package>> {
        let removed = self.packages.remove(name)?;
        self.remove_package_dependencies(&removed);
        Some(removed)
    }

    /// Replace the whole package map; indices are recomputed from scratch
    pub fn replace_packages(
        &mut self,
        new_packages: Vec<Arc<Package>>,
        last_modified: Option<DateTime<Utc>>,
    ) {
        self.clear_packages();
        for package in new_packages {
            self.add_package_dependencies(&package);
            self.packages.insert(package.name.clone(), package);
        }
        self.last_update = last_modified;
        debug!("{}: replaced packages ({} entries)", self.name, self.packages.len());
    }

    pub fn clear_packages(&mut self) {
        self.packages.clear();
        self.provided_deps.clear();
        self.required_deps.clear();
        self.provided_libs.clear();
        self.required_libs.clear();
    }

    /// Linear scan over the package map
    pub fn find_packages(
        &self,
        pred: impl Fn(&Database, &Package) -> bool,
    ) -> Vec<Arc<Package>> {
        let mut matches: Vec<Arc<Package>> = self
            .packages
            .values()
            .filter(|pkg| pred(self, pkg))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        matches
    }

    /// Locate a package file within the repository directory
    ///
    /// Follows a single level of symlink to obtain the canonical storage
    /// location of files shared between repositories.
    pub fn locate_package(&self, file_name: &str) -> PackageLocation {
        let mut location = PackageLocation {
            path_within_repo: self.local_pkg_dir.join(file_name),
            ..Default::default()
        };
        if file_name.is_empty() {
            location.error = Some("no file name".to_string());
            return location;
        }
        match location.path_within_repo.symlink_metadata() {
            Ok(metadata) => {
                location.exists = true;
                if metadata.file_type().is_symlink() {
                    match std::fs::read_link(&location.path_within_repo) {
                        Ok(target) => {
                            location.storage_location = if target.is_absolute() {
                                target
                            } else {
                                self.local_pkg_dir.join(target)
                            };
                            location.exists = location.storage_location.exists();
                        }
                        Err(e) => {
                            location.error = Some(e.to_string());
                            location.exists = false;
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => location.error = Some(e.to_string()),
        }
        location
    }

    /// Compare this database against the given update sources
    pub fn check_for_updates(&self, update_sources: &[&Database]) -> PackageUpdates {
        let mut updates = PackageUpdates::default();
        let as_result = |db: &Database, pkg: &Arc<Package>| SerializedSearchResult {
            db: DatabaseInfo {
                name: db.name.clone(),
                arch: db.arch.clone(),
            },
            pkg: pkg.as_ref().clone(),
        };

        for package in self.packages.values() {
            let newest_source = update_sources
                .iter()
                .filter_map(|source| {
                    source
                        .packages
                        .get(&package.name)
                        .map(|candidate| (*source, candidate))
                })
                .max_by(|(_, a), (_, b)| a.version.cmp(&b.version));

            let Some((source, candidate)) = newest_source else {
                updates.orphans.push(as_result(self, package));
                continue;
            };
            let update = PackageUpdate {
                old_version: Some(as_result(self, package)),
                new_version: Some(as_result(source, candidate)),
            };
            match candidate.version.cmp(&package.version) {
                std::cmp::Ordering::Greater => updates.version_updates.push(update),
                std::cmp::Ordering::Less => updates.downgrades.push(update),
                std::cmp::Ordering::Equal => {}
            }
        }

        // packages only the sources know about
        for source in update_sources {
            for candidate in source.packages.values() {
                if !self.packages.contains_key(&candidate.name) {
                    updates.package_updates.push(PackageUpdate {
                        old_version: None,
                        new_version: Some(as_result(source, candidate)),
                    });
                }
            }
        }

        sort_updates(&mut updates);
        updates
    }

    /// Simulate a package transition and report what would become
    /// unresolvable
    ///
    /// Removals are applied before additions: a dependency whose only
    /// providers are proposed for removal counts as unresolved unless a
    /// proposed-new package or a surviving package still provides it.
    pub fn detect_unresolved_packages(
        &self,
        config: &Config,
        proposed_new: &[Arc<Package>],
        proposed_removed: &DependencySet,
    ) -> Vec<(Arc<Package>, UnresolvedDependencies)> {
        let relevant_dbs = config.databases_relevant_for(self);

        let dep_resolvable = |dep: &Dependency| -> bool {
            if proposed_new.iter().any(|pkg| pkg.provides_dependency(dep)) {
                return true;
            }
            let removed_providers = proposed_removed.packages_matching(dep);
            let mut surviving = self.provided_deps.packages_matching(dep);
            for db in &relevant_dbs {
                surviving.extend(db.provided_deps.packages_matching(dep));
            }
            surviving.iter().any(|name| !removed_providers.contains(name))
        };
        let lib_resolvable = |lib: &LibraryId| -> bool {
            if proposed_new.iter().any(|pkg| pkg.libprovides.contains(lib)) {
                return true;
            }
            let removed_providers = proposed_removed.packages_matching(&Dependency::from_name(lib.as_str()));
            let mut providers: Vec<&Arc<Package>> =
                self.provided_libs.get(lib).into_iter().flatten().collect();
            for db in &relevant_dbs {
                providers.extend(db.provided_libs.get(lib).into_iter().flatten());
            }
            providers.iter().any(|pkg| !removed_providers.contains(&pkg.name))
        };

        let mut unresolved = Vec::new();
        let mut names: Vec<&String> = self.packages.keys().collect();
        names.sort();
        for name in names {
            let package = &self.packages[name];
            let mut entry = UnresolvedDependencies::default();
            for dep in &package.deps {
                if !dep_resolvable(dep) {
                    entry.deps.push(dep.clone());
                }
            }
            for lib in &package.libdepends {
                if !lib_resolvable(lib) {
                    entry.libs.push(lib.clone());
                }
            }
            if !entry.deps.is_empty() || !entry.libs.is_empty() {
                unresolved.push((Arc::clone(package), entry));
            }
        }
        unresolved
    }

    /// Filter predicate for database tarball contents: only the `desc`,
    /// `files` and `depends` files inside per-package directories matter
    pub fn is_file_relevant(directory: &str, name: &str, _mode: u32) -> bool {
        !directory.is_empty() && matches!(name, "desc" | "files" | "depends")
    }

    /// Consistency check: do the four indices match a from-scratch rebuild?
    #[cfg(test)]
    pub fn verify_indices(&self) -> bool {
        let mut fresh = Database::new(self.name.clone(), self.path.clone());
        for package in self.packages.values() {
            fresh.add_package_dependencies(package);
        }
        fresh.provided_deps == self.provided_deps
            && fresh.required_deps == self.required_deps
            && index_names(&fresh.provided_libs) == index_names(&self.provided_libs)
            && index_names(&fresh.required_libs) == index_names(&self.required_libs)
    }
}

#[cfg(test)]
fn index_names(
    index: &HashMap<LibraryId, Vec<Arc<Package>>>,
) -> HashMap<LibraryId, Vec<String>> {
    index
        .iter()
        .map(|(lib, packages)| {
            let mut names: Vec<String> = packages.iter().map(|p| p.name.clone()).collect();
            names.sort();
            (lib.clone(), names)
        })
        .collect()
}

fn sort_updates(updates: &mut PackageUpdates) {
    let key = |u: &PackageUpdate| {
        u.old_version
            .as_ref()
            .or(u.new_version.as_ref())
            .map(|r| r.pkg.name.clone())
            .unwrap_or_default()
    };
    updates.version_updates.sort_by_key(key);
    updates.package_updates.sort_by_key(key);
    updates.downgrades.sort_by_key(key);
    updates.orphans.sort_by(|a, b| a.pkg.name.cmp(&b.pkg.name));
}

/// Statistics snapshot of one database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStatistics {
    pub name: String,
    pub package_count: usize,
    pub arch: String,
    pub last_update: Option<DateTime<Utc>>,
    pub local_pkg_dir: PathBuf,
    pub main_mirror: String,
    pub sync_from_mirror: bool,
}

impl DatabaseStatistics {
    pub fn new(db: &Database) -> Self {
        Self {
            name: db.name.clone(),
            package_count: db.packages.len(),
            arch: db.arch.clone(),
            last_update: db.last_update,
            local_pkg_dir: db.local_pkg_dir.clone(),
            main_mirror: db.mirrors.first().cloned().unwrap_or_default(),
            sync_from_mirror: db.sync_from_mirror,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::PackageOrigin;
    use crate::version::PackageVersion;

    fn pkg(file_name: &str) -> Arc<Package> {
        Arc::new(Package::from_pkg_file_name(file_name).unwrap())
    }

    fn pkg_with_deps(file_name: &str, deps: &[&str], provides: &[&str]) -> Arc<Package> {
        let mut package = Package::from_pkg_file_name(file_name).unwrap();
        package.deps = deps.iter().map(|d| Dependency::parse(d)).collect();
        package.provides = provides.iter().map(|p| Dependency::parse(p)).collect();
        Arc::new(package)
    }

    #[test]
    fn test_update_package_maintains_indices() {
        let mut db = Database::new("core", "core.db");
        db.update_package(pkg_with_deps(
            "openssl-3.0.0-1-x86_64.pkg.tar.zst",
            &["glibc"],
            &["libcrypto.so=3"],
        ));

        assert!(db.provided_deps.provides(&Dependency::parse("openssl")));
        assert!(db.provided_deps.provides(&Dependency::parse("libcrypto.so=3")));
        assert!(db.required_deps.contains_name("glibc"));
        assert!(db.verify_indices());

        db.remove_package("openssl");
        assert!(db.packages.is_empty());
        assert!(db.provided_deps.is_empty());
        assert!(db.required_deps.is_empty());
    }

    #[test]
    fn test_update_replaces_old_index_entries() {
        let mut db = Database::new("core", "core.db");
        db.update_package(pkg_with_deps(
            "openssl-3.0.0-1-x86_64.pkg.tar.zst",
            &["glibc"],
            &[],
        ));
        db.force_update_package(pkg_with_deps(
            "openssl-3.0.1-1-x86_64.pkg.tar.zst",
            &["glibc", "zlib"],
            &[],
        ));

        assert_eq!(db.packages.len(), 1);
        assert_eq!(
            db.packages["openssl"].version,
            PackageVersion::parse("3.0.1-1").unwrap()
        );
        assert!(db.required_deps.contains_name("zlib"));
        assert!(db.verify_indices());
    }

    #[test]
    fn test_library_indices() {
        let mut db = Database::new("foo", "foo.db");
        let mut package = Package::from_pkg_file_name("syncthingtray-0.6.2-1-x86_64.pkg.tar.xz").unwrap();
        package.origin = PackageOrigin::PackageContents;
        package
            .libprovides
            .insert(LibraryId::elf("x86_64", "libsyncthingconnector.so.0.6.2"));
        package.libdepends.insert(LibraryId::elf("x86_64", "libc.so.6"));
        db.update_package(Arc::new(package));

        let provided = db
            .provided_libs
            .get(&LibraryId::elf("x86_64", "libsyncthingconnector.so.0.6.2"))
            .unwrap();
        assert_eq!(provided.len(), 1);
        assert_eq!(provided[0].name, "syncthingtray");
        assert!(db
            .required_libs
            .contains_key(&LibraryId::elf("x86_64", "libc.so.6")));

        db.remove_package("syncthingtray");
        assert!(db.provided_libs.is_empty());
        assert!(db.required_libs.is_empty());
    }

    #[test]
    fn test_replace_packages_recomputes() {
        let mut db = Database::new("core", "core.db");
        db.update_package(pkg_with_deps("a-1.0-1-x86_64.pkg.tar.zst", &["b"], &[]));
        db.replace_packages(
            vec![pkg_with_deps("c-1.0-1-x86_64.pkg.tar.zst", &["d"], &[])],
            Some(Utc::now()),
        );

        assert!(!db.packages.contains_key("a"));
        assert!(db.packages.contains_key("c"));
        assert!(!db.required_deps.contains_name("b"));
        assert!(db.required_deps.contains_name("d"));
        assert!(db.last_update.is_some());
    }

    #[test]
    fn test_check_for_updates() {
        let mut stable = Database::new("stable", "stable.db");
        stable.update_package(pkg("boost-1.72.0-1-x86_64.pkg.tar.zst"));
        stable.update_package(pkg("cmake-3.9.0-1-x86_64.pkg.tar.zst"));
        stable.update_package(pkg("orphaned-1.0-1-x86_64.pkg.tar.zst"));

        let mut testing = Database::new("testing", "testing.db");
        testing.update_package(pkg("boost-1.73.0-1-x86_64.pkg.tar.zst"));
        testing.update_package(pkg("cmake-3.8.2-1-x86_64.pkg.tar.zst"));
        testing.update_package(pkg("brand-new-0.1-1-x86_64.pkg.tar.zst"));

        let updates = stable.check_for_updates(&[&testing]);
        assert_eq!(updates.version_updates.len(), 1);
        assert_eq!(
            updates.version_updates[0].new_version.as_ref().unwrap().pkg.name,
            "boost"
        );
        assert_eq!(updates.downgrades.len(), 1);
        assert_eq!(
            updates.downgrades[0].new_version.as_ref().unwrap().pkg.name,
            "cmake"
        );
        assert_eq!(updates.orphans.len(), 1);
        assert_eq!(updates.orphans[0].pkg.name, "orphaned");
        assert_eq!(updates.package_updates.len(), 1);
        assert_eq!(
            updates.package_updates[0].new_version.as_ref().unwrap().pkg.name,
            "brand-new"
        );
    }

    #[test]
    fn test_is_file_relevant() {
        assert!(Database::is_file_relevant("zlib-1.2.11-4", "desc", 0));
        assert!(Database::is_file_relevant("zlib-1.2.11-4", "depends", 0));
        assert!(Database::is_file_relevant("zlib-1.2.11-4", "files", 0));
        assert!(!Database::is_file_relevant("zlib-1.2.11-4", "install", 0));
        assert!(!Database::is_file_relevant("", "desc", 0));
    }

    #[test]
    fn test_files_path_from_regular_path() {
        let db = Database::new("core", "/repo/core.db.tar.zst");
        assert_eq!(
            db.files_path_from_regular_path(),
            PathBuf::from("/repo/core.files.tar.zst")
        );
    }

    #[test]
    fn test_locate_package_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("zlib-1.2.11-4-x86_64.pkg.tar.zst"), b"pkg").unwrap();

        let mut db = Database::new("core", "core.db");
        db.local_pkg_dir = dir.path().to_path_buf();

        let location = db.locate_package("zlib-1.2.11-4-x86_64.pkg.tar.zst");
        assert!(location.exists);
        assert!(location.storage_location.as_os_str().is_empty());
        assert!(location.error.is_none());

        let missing = db.locate_package("missing-1.0-1-x86_64.pkg.tar.zst");
        assert!(!missing.exists);
        assert!(missing.error.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_package_follows_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let any_dir = dir.path().join("any");
        std::fs::create_dir(&any_dir).unwrap();
        std::fs::write(any_dir.join("foo-1.0-1-any.pkg.tar.zst"), b"pkg").unwrap();

        let arch_dir = dir.path().join("x86_64");
        std::fs::create_dir(&arch_dir).unwrap();
        std::os::unix::fs::symlink(
            "../any/foo-1.0-1-any.pkg.tar.zst",
            arch_dir.join("foo-1.0-1-any.pkg.tar.zst"),
        )
        .unwrap();

        let mut db = Database::new("core", "core.db");
        db.local_pkg_dir = arch_dir;

        let location = db.locate_package("foo-1.0-1-any.pkg.tar.zst");
        assert!(location.exists);
        assert!(location
            .storage_location
            .to_string_lossy()
            .ends_with("any/foo-1.0-1-any.pkg.tar.zst"));
    }
}
