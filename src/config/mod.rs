// src/config/mod.rs

//! Configuration graph
//!
//! The [`Config`] owns every [`Database`] plus the `aur` scratch database
//! and provides name lookup, denotation parsing, cross-database searches,
//! inter-database dependency ordering and dependency-closure expansion.
//! All reads and writes go through the service's config lock; the config
//! is never ambient state.

pub mod build_order;
pub mod license;

use crate::database::{
    Database, DatabaseId, DatabaseStatistics, PackageSearchResult, AUR_DATABASE_ID,
};
use crate::dependencies::{Dependency, DependencySet};
use crate::database::SignatureLevel;
use crate::packages::Package;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub use build_order::{BuildOrderOptions, BuildOrderResult};
pub use license::LicenseResult;

/// Identifies one package within the config: database id plus package name
pub type PackageKey = (DatabaseId, String);

/// The in-memory model of all configured databases
#[derive(Default)]
pub struct Config {
    pub databases: Vec<Database>,
    pub aur: Database,
    pub architectures: BTreeSet<String>,
    pub pacman_db_path: PathBuf,
    pub package_cache_dirs: Vec<PathBuf>,
    pub signature_level: SignatureLevel,
}

/// Serialisable status snapshot of the whole config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub db_stats: Vec<DatabaseStatistics>,
    pub architectures: BTreeSet<String>,
    pub pacman_database_path: PathBuf,
    pub package_cache_dirs: Vec<PathBuf>,
}

impl Config {
    pub fn new() -> Self {
        Self {
            aur: Database::new("aur", ""),
            ..Default::default()
        }
    }

    /// Resolve a database id; the aur database has a reserved id
    pub fn database_by_id(&self, id: DatabaseId) -> Option<&Database> {
        if id == AUR_DATABASE_ID {
            Some(&self.aur)
        } else {
            self.databases.get(id)
        }
    }

    pub fn database_by_id_mut(&mut self, id: DatabaseId) -> Option<&mut Database> {
        if id == AUR_DATABASE_ID {
            Some(&mut self.aur)
        } else {
            self.databases.get_mut(id)
        }
    }

    /// Name-and-arch lookup; the aur database matches regardless of arch
    pub fn find_database(&self, name: &str, arch: &str) -> Option<DatabaseId> {
        if name == "aur" {
            return Some(AUR_DATABASE_ID);
        }
        self.databases
            .iter()
            .position(|db| db.name == name && db.arch == arch)
    }

    pub fn find_or_create_database(&mut self, name: &str, arch: &str) -> DatabaseId {
        if let Some(id) = self.find_database(name, arch) {
            return id;
        }
        let mut db = Database::new(name, "");
        db.arch = arch.to_string();
        self.databases.push(db);
        self.databases.len() - 1
    }

    /// Parse `name[@arch]`; a missing arch defaults to x86_64
    pub fn parse_database_denotation(denotation: &str) -> (&str, &str) {
        match denotation.split_once('@') {
            Some((name, arch)) if !arch.is_empty() => (name, arch),
            Some((name, _)) => (name, "x86_64"),
            None => (denotation, "x86_64"),
        }
    }

    /// Parse `db[@arch]/name`; a missing db part leaves it empty
    pub fn parse_package_denotation(denotation: &str) -> (&str, &str, &str) {
        match denotation.split_once('/') {
            Some((db_part, package)) => {
                let (db, arch) = Self::parse_database_denotation(db_part);
                (db, arch, package)
            }
            None => ("", "x86_64", denotation),
        }
    }

    /// Format the canonical `db@arch/name` denotation
    pub fn format_package_denotation(db: &str, arch: &str, package: &str) -> String {
        if db.is_empty() {
            package.to_string()
        } else {
            format!("{}@{}/{}", db, arch, package)
        }
    }

    pub fn find_database_from_denotation(&self, denotation: &str) -> Option<DatabaseId> {
        let (name, arch) = Self::parse_database_denotation(denotation);
        self.find_database(name, arch)
    }

    fn database_ids(&self) -> impl Iterator<Item = DatabaseId> + '_ {
        (0..self.databases.len()).chain(std::iter::once(AUR_DATABASE_ID))
    }

    /// Find packages by `db[@arch]/name` denotation; an empty db part
    /// searches every database
    pub fn find_packages_by_denotation(&self, denotation: &str) -> Vec<PackageSearchResult> {
        let (db_name, arch, package_name) = Self::parse_package_denotation(denotation);
        let mut results = Vec::new();
        if db_name.is_empty() {
            for id in self.database_ids() {
                let db = self.database_by_id(id).expect("iterated ids are valid");
                if let Some(pkg) = db.packages.get(package_name) {
                    results.push(PackageSearchResult::new(id, Arc::clone(pkg)));
                }
            }
        } else if let Some(id) = self.find_database(db_name, arch) {
            let db = self.database_by_id(id).expect("id from find_database");
            if let Some(pkg) = db.packages.get(package_name) {
                results.push(PackageSearchResult::new(id, Arc::clone(pkg)));
            }
        }
        results
    }

    /// Resolve a dependency to at most one package per database, then to
    /// the first database in configuration order
    pub fn find_package(&self, dependency: &Dependency) -> Option<PackageSearchResult> {
        self.find_package_candidates(dependency).into_iter().next()
    }

    /// Resolve a dependency to at most one package per database, in
    /// configuration order; within one database the newest version wins,
    /// ties broken by name
    pub fn find_package_candidates(&self, dependency: &Dependency) -> Vec<PackageSearchResult> {
        let mut candidates = Vec::new();
        for id in self.database_ids() {
            let db = self.database_by_id(id).expect("iterated ids are valid");
            let best = db
                .packages
                .values()
                .filter(|pkg| pkg.provides_dependency(dependency))
                .max_by(|a, b| {
                    a.version
                        .cmp(&b.version)
                        .then_with(|| b.name.cmp(&a.name))
                });
            if let Some(pkg) = best {
                candidates.push(PackageSearchResult::new(id, Arc::clone(pkg)));
            }
        }
        candidates
    }

    /// All packages matching a dependency; `reverse` finds packages whose
    /// own dependencies match it instead
    pub fn find_packages(&self, dependency: &Dependency, reverse: bool) -> Vec<PackageSearchResult> {
        let mut results = Vec::new();
        for id in self.database_ids() {
            let db = self.database_by_id(id).expect("iterated ids are valid");
            if reverse {
                let mut names = db.required_deps.packages_matching(dependency);
                names.sort();
                for name in names {
                    if let Some(pkg) = db.packages.get(&name) {
                        results.push(PackageSearchResult::new(id, Arc::clone(pkg)));
                    }
                }
            } else {
                let mut matching: Vec<&Arc<Package>> = db
                    .packages
                    .values()
                    .filter(|pkg| pkg.provides_dependency(dependency))
                    .collect();
                matching.sort_by(|a, b| a.name.cmp(&b.name));
                for pkg in matching {
                    results.push(PackageSearchResult::new(id, Arc::clone(pkg)));
                }
            }
        }
        results
    }

    /// Packages providing (or, with `reverse`, requiring) a library
    pub fn find_packages_providing_library(
        &self,
        library: &crate::dependencies::LibraryId,
        reverse: bool,
    ) -> Vec<PackageSearchResult> {
        let mut results = Vec::new();
        for id in self.database_ids() {
            let db = self.database_by_id(id).expect("iterated ids are valid");
            let index = if reverse {
                &db.required_libs
            } else {
                &db.provided_libs
            };
            if let Some(packages) = index.get(library) {
                let mut packages: Vec<&Arc<Package>> = packages.iter().collect();
                packages.sort_by(|a, b| a.name.cmp(&b.name));
                for pkg in packages {
                    results.push(PackageSearchResult::new(id, Arc::clone(pkg)));
                }
            }
        }
        results
    }

    /// Packages whose name matches a regex
    pub fn find_packages_by_regex(&self, regex: &Regex) -> Vec<PackageSearchResult> {
        self.find_packages_by_pred(|_| true, |_, pkg| regex.is_match(&pkg.name))
    }

    /// Same-named packages across all databases
    pub fn find_packages_by_name(&self, name: &str) -> Vec<PackageSearchResult> {
        let mut results = Vec::new();
        for id in self.database_ids() {
            let db = self.database_by_id(id).expect("iterated ids are valid");
            if let Some(pkg) = db.packages.get(name) {
                results.push(PackageSearchResult::new(id, Arc::clone(pkg)));
            }
        }
        results
    }

    /// General predicate search over databases and packages
    pub fn find_packages_by_pred(
        &self,
        database_pred: impl Fn(&Database) -> bool,
        package_pred: impl Fn(&Database, &Package) -> bool,
    ) -> Vec<PackageSearchResult> {
        let mut results = Vec::new();
        for id in self.database_ids() {
            let db = self.database_by_id(id).expect("iterated ids are valid");
            if !database_pred(db) {
                continue;
            }
            let mut matching: Vec<&Arc<Package>> = db
                .packages
                .values()
                .filter(|pkg| package_pred(db, pkg))
                .collect();
            matching.sort_by(|a, b| a.name.cmp(&b.name));
            for pkg in matching {
                results.push(PackageSearchResult::new(id, Arc::clone(pkg)));
            }
        }
        results
    }

    /// Topologically order the databases `db` depends on (transitively),
    /// ending with `db` itself; an error names the offending cycle
    pub fn compute_database_dependency_order(
        &self,
        db: DatabaseId,
    ) -> std::result::Result<Vec<DatabaseId>, String> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        self.visit_database_dependencies(db, &mut order, &mut visited, &mut stack)?;
        Ok(order)
    }

    fn visit_database_dependencies(
        &self,
        id: DatabaseId,
        order: &mut Vec<DatabaseId>,
        visited: &mut HashSet<DatabaseId>,
        stack: &mut Vec<String>,
    ) -> std::result::Result<(), String> {
        let db = match self.database_by_id(id) {
            Some(db) => db,
            None => return Ok(()),
        };
        if stack.contains(&db.name) {
            return Err(format!(
                "cyclic dependency between databases: {} -> {}",
                stack.join(" -> "),
                db.name
            ));
        }
        if !visited.insert(id) {
            return Ok(());
        }
        stack.push(db.name.clone());
        for dependency_name in &db.dependencies {
            match self.find_database(dependency_name, &db.arch) {
                Some(dep_id) => {
                    self.visit_database_dependencies(dep_id, order, visited, stack)?
                }
                None => {
                    stack.pop();
                    return Err(format!(
                        "database \"{}\" depends on missing database \"{}\"",
                        db.name, dependency_name
                    ));
                }
            }
        }
        stack.pop();
        order.push(id);
        Ok(())
    }

    /// Inverse closure: every database whose dependency closure contains
    /// `db`
    pub fn compute_databases_requiring_database(&self, db: DatabaseId) -> Vec<DatabaseId> {
        let Some(target) = self.database_by_id(db) else {
            return Vec::new();
        };
        let mut requiring = Vec::new();
        for id in 0..self.databases.len() {
            if id == db {
                continue;
            }
            if let Ok(order) = self.compute_database_dependency_order(id) {
                if order.contains(&db) {
                    requiring.push(id);
                }
            }
        }
        debug!(
            "{} databases require \"{}\"",
            requiring.len(),
            target.name
        );
        requiring
    }

    /// The databases `db`'s packages may resolve dependencies from,
    /// excluding `db` itself
    pub fn databases_relevant_for(&self, db: &Database) -> Vec<&Database> {
        let mut relevant = Vec::new();
        let mut pending: Vec<&str> = db.dependencies.iter().map(String::as_str).collect();
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(name) = pending.pop() {
            if !seen.insert(name) {
                continue;
            }
            if let Some(id) = self.find_database(name, &db.arch) {
                let dep_db = self.database_by_id(id).expect("id from find_database");
                pending.extend(dep_db.dependencies.iter().map(String::as_str));
                relevant.push(dep_db);
            }
        }
        relevant
    }

    /// Expand the runtime closure of `dependencies` within `relevant_dbs`
    ///
    /// Resolved packages are added to `runtime_deps` and recursed into
    /// once; unresolved dependencies are recorded in `missing` attributed
    /// to `relevant_package`. Idempotent on already-accumulated packages.
    pub fn pull_dependent_packages(
        &self,
        dependencies: &[Dependency],
        relevant_package: Option<&Arc<Package>>,
        relevant_dbs: &HashSet<DatabaseId>,
        runtime_deps: &mut HashSet<PackageKey>,
        missing: &mut DependencySet,
    ) {
        for dependency in dependencies {
            let resolved = self
                .find_package_candidates(dependency)
                .into_iter()
                .find(|result| match &result.db {
                    crate::database::DatabaseHandle::Live(id) => relevant_dbs.contains(id),
                    crate::database::DatabaseHandle::Info(_) => false,
                });
            let Some(result) = resolved else {
                let attributed_to = relevant_package.map(|p| p.name.as_str()).unwrap_or("");
                missing.add(dependency, attributed_to);
                continue;
            };
            let crate::database::DatabaseHandle::Live(db_id) = result.db else {
                continue;
            };
            if runtime_deps.insert((db_id, result.pkg.name.clone())) {
                self.pull_dependent_packages(
                    &result.pkg.deps.clone(),
                    Some(&result.pkg),
                    relevant_dbs,
                    runtime_deps,
                    missing,
                );
            }
        }
    }

    /// Closure expansion starting from a package's own dependencies
    pub fn pull_dependent_packages_of(
        &self,
        package: &Arc<Package>,
        relevant_dbs: &HashSet<DatabaseId>,
        runtime_deps: &mut HashSet<PackageKey>,
        missing: &mut DependencySet,
    ) {
        self.pull_dependent_packages(
            &package.deps.clone(),
            Some(package),
            relevant_dbs,
            runtime_deps,
            missing,
        );
    }

    /// Iteration harness over every database and package
    ///
    /// `process_db` runs once per database before its packages; `process_pkg`
    /// runs for every package and receives a mutex for coarse mutation of
    /// shared state. Non-empty strings returned by either are recorded as
    /// errors and iteration continues.
    pub fn for_each_package<F, G>(&mut self, process_db: F, process_pkg: G) -> Vec<String>
    where
        F: Fn(&mut Database) -> Option<String>,
        G: Fn(&Database, &Arc<Package>, &Mutex<()>) -> Option<String> + Sync,
    {
        let mut errors = Vec::new();
        let db_mutex = Mutex::new(());
        for db in &mut self.databases {
            if let Some(error) = process_db(db) {
                errors.push(error);
                continue;
            }
            let mut names: Vec<&String> = db.packages.keys().collect();
            names.sort();
            for name in names {
                if let Some(error) = process_pkg(db, &db.packages[name], &db_mutex) {
                    errors.push(error);
                }
            }
        }
        errors
    }

    /// Mark every database for discarding; used when reloading the
    /// configuration
    pub fn mark_all_databases_to_be_discarded(&mut self) {
        for db in &mut self.databases {
            db.to_be_discarded = true;
        }
    }

    /// Drop databases still marked after the reload re-claimed the live
    /// ones
    pub fn discard_databases(&mut self) {
        self.databases.retain(|db| !db.to_be_discarded);
    }

    pub fn compute_status(&self) -> Status {
        Status {
            db_stats: self.databases.iter().map(DatabaseStatistics::new).collect(),
            architectures: self.architectures.clone(),
            pacman_database_path: self.pacman_db_path.clone(),
            package_cache_dirs: self.package_cache_dirs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependencies::LibraryId;
    use crate::packages::PackageOrigin;

    fn pkg(file_name: &str) -> Arc<Package> {
        Arc::new(Package::from_pkg_file_name(file_name).unwrap())
    }

    fn config_with_dbs(names: &[&str]) -> Config {
        let mut config = Config::new();
        for name in names {
            config
                .databases
                .push(Database::new(*name, format!("{}.db", name)));
        }
        config
    }

    #[test]
    fn test_parse_database_denotation() {
        assert_eq!(Config::parse_database_denotation("core"), ("core", "x86_64"));
        assert_eq!(
            Config::parse_database_denotation("staging@i686"),
            ("staging", "i686")
        );
        assert_eq!(Config::parse_database_denotation("core@"), ("core", "x86_64"));
    }

    #[test]
    fn test_parse_package_denotation_round_trip() {
        let cases = [
            ("core@x86_64/zlib", ("core", "x86_64", "zlib")),
            ("core/zlib", ("core", "x86_64", "zlib")),
            ("zlib", ("", "x86_64", "zlib")),
        ];
        for (denotation, expected) in cases {
            assert_eq!(Config::parse_package_denotation(denotation), expected);
        }
        let formatted = Config::format_package_denotation("core", "x86_64", "zlib");
        assert_eq!(
            Config::parse_package_denotation(&formatted),
            ("core", "x86_64", "zlib")
        );
    }

    #[test]
    fn test_find_database_matches_arch() {
        let mut config = config_with_dbs(&["core"]);
        config.databases[0].arch = "x86_64".to_string();
        assert_eq!(config.find_database("core", "x86_64"), Some(0));
        assert_eq!(config.find_database("core", "i686"), None);
        // aur matches regardless of arch
        assert_eq!(config.find_database("aur", "i686"), Some(AUR_DATABASE_ID));
    }

    #[test]
    fn test_find_or_create_database() {
        let mut config = Config::new();
        let id = config.find_or_create_database("staging", "x86_64");
        assert_eq!(config.databases[id].name, "staging");
        assert_eq!(config.find_or_create_database("staging", "x86_64"), id);
    }

    #[test]
    fn test_find_packages_by_denotation() {
        let mut config = config_with_dbs(&["core", "extra"]);
        config.databases[0].update_package(pkg("zlib-1.2.11-4-x86_64.pkg.tar.zst"));
        config.databases[1].update_package(pkg("zlib-1.2.12-1-x86_64.pkg.tar.zst"));

        let everywhere = config.find_packages_by_denotation("zlib");
        assert_eq!(everywhere.len(), 2);

        let only_extra = config.find_packages_by_denotation("extra@x86_64/zlib");
        assert_eq!(only_extra.len(), 1);
        assert_eq!(only_extra[0].pkg.version.pkgver, "1.2.12");

        assert!(config.find_packages_by_denotation("missing").is_empty());
    }

    #[test]
    fn test_find_package_prefers_first_database() {
        let mut config = config_with_dbs(&["core", "extra"]);
        config.databases[0].update_package(pkg("zlib-1.2.11-4-x86_64.pkg.tar.zst"));
        config.databases[1].update_package(pkg("zlib-1.2.12-1-x86_64.pkg.tar.zst"));

        let found = config.find_package(&Dependency::parse("zlib")).unwrap();
        assert_eq!(found.db, crate::database::DatabaseHandle::Live(0));
    }

    #[test]
    fn test_find_packages_reverse() {
        let mut config = config_with_dbs(&["core"]);
        let mut consumer = Package::from_pkg_file_name("foo-1.0-1-x86_64.pkg.tar.zst").unwrap();
        consumer.deps = vec![Dependency::parse("zlib>=1.2")];
        config.databases[0].update_package(Arc::new(consumer));
        config.databases[0].update_package(pkg("zlib-1.2.11-4-x86_64.pkg.tar.zst"));

        let dependents = config.find_packages(&Dependency::parse("zlib"), true);
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].pkg.name, "foo");
    }

    #[test]
    fn test_find_packages_providing_library() {
        let mut config = config_with_dbs(&["foo"]);
        let mut provider =
            Package::from_pkg_file_name("syncthingtray-0.6.2-1-x86_64.pkg.tar.xz").unwrap();
        provider.origin = PackageOrigin::PackageContents;
        provider
            .libprovides
            .insert(LibraryId::elf("x86_64", "libsyncthingconnector.so.0.6.2"));
        config.databases[0].update_package(Arc::new(provider));

        let providers = config.find_packages_providing_library(
            &LibraryId::elf("x86_64", "libsyncthingconnector.so.0.6.2"),
            false,
        );
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].pkg.name, "syncthingtray");

        let consumers = config.find_packages_providing_library(
            &LibraryId::elf("x86_64", "libsyncthingconnector.so.0.6.2"),
            true,
        );
        assert!(consumers.is_empty());
    }

    #[test]
    fn test_database_dependency_order() {
        let mut config = config_with_dbs(&["stable", "testing", "staging"]);
        config.databases[1].dependencies = vec!["stable".to_string()];
        config.databases[2].dependencies = vec!["testing".to_string()];

        let order = config.compute_database_dependency_order(2).unwrap();
        assert_eq!(order, vec![0, 1, 2]);

        let requiring = config.compute_databases_requiring_database(0);
        assert_eq!(requiring, vec![1, 2]);
    }

    #[test]
    fn test_database_dependency_cycle_detected() {
        let mut config = config_with_dbs(&["a", "b"]);
        config.databases[0].dependencies = vec!["b".to_string()];
        config.databases[1].dependencies = vec!["a".to_string()];

        let error = config.compute_database_dependency_order(0).unwrap_err();
        assert!(error.contains("cyclic"), "unexpected error: {}", error);
        assert!(error.contains('a') && error.contains('b'));
    }

    #[test]
    fn test_database_dependency_missing_db() {
        let mut config = config_with_dbs(&["a"]);
        config.databases[0].dependencies = vec!["nonexistent".to_string()];
        let error = config.compute_database_dependency_order(0).unwrap_err();
        assert!(error.contains("nonexistent"));
    }

    #[test]
    fn test_pull_dependent_packages() {
        let mut config = config_with_dbs(&["core"]);
        let mut app = Package::from_pkg_file_name("app-1.0-1-x86_64.pkg.tar.zst").unwrap();
        app.deps = vec![Dependency::parse("liba")];
        let mut liba = Package::from_pkg_file_name("liba-1.0-1-x86_64.pkg.tar.zst").unwrap();
        liba.deps = vec![Dependency::parse("libb"), Dependency::parse("missing-dep")];
        let libb = Package::from_pkg_file_name("libb-1.0-1-x86_64.pkg.tar.zst").unwrap();
        let app = Arc::new(app);
        config.databases[0].update_package(Arc::clone(&app));
        config.databases[0].update_package(Arc::new(liba));
        config.databases[0].update_package(Arc::new(libb));

        let relevant: HashSet<DatabaseId> = HashSet::from([0]);
        let mut runtime_deps = HashSet::new();
        let mut missing = DependencySet::new();
        config.pull_dependent_packages_of(&app, &relevant, &mut runtime_deps, &mut missing);

        assert!(runtime_deps.contains(&(0, "liba".to_string())));
        assert!(runtime_deps.contains(&(0, "libb".to_string())));
        assert!(missing.contains_name("missing-dep"));

        // idempotent on a second pull
        let size_before = runtime_deps.len();
        config.pull_dependent_packages_of(&app, &relevant, &mut runtime_deps, &mut missing);
        assert_eq!(runtime_deps.len(), size_before);
    }

    #[test]
    fn test_for_each_package_collects_errors() {
        let mut config = config_with_dbs(&["core", "extra"]);
        config.databases[0].update_package(pkg("zlib-1.2.11-4-x86_64.pkg.tar.zst"));
        config.databases[1].update_package(pkg("openssl-3.0.0-1-x86_64.pkg.tar.zst"));

        let errors = config.for_each_package(
            |db| (db.name == "extra").then(|| "extra is broken".to_string()),
            |db, pkg, _mutex| {
                assert_eq!(db.name, "core");
                (pkg.name == "zlib").then(|| "zlib failed".to_string())
            },
        );
        assert_eq!(
            errors,
            vec!["extra is broken".to_string(), "zlib failed".to_string()]
        );
    }

    #[test]
    fn test_discard_databases() {
        let mut config = config_with_dbs(&["old", "kept"]);
        config.mark_all_databases_to_be_discarded();
        config.databases[1].to_be_discarded = false;
        config.discard_databases();
        assert_eq!(config.databases.len(), 1);
        assert_eq!(config.databases[0].name, "kept");
    }

    #[test]
    fn test_compute_status() {
        let mut config = config_with_dbs(&["core"]);
        config.architectures.insert("x86_64".to_string());
        config.databases[0].update_package(pkg("zlib-1.2.11-4-x86_64.pkg.tar.zst"));

        let status = config.compute_status();
        assert_eq!(status.db_stats.len(), 1);
        assert_eq!(status.db_stats[0].package_count, 1);
        assert!(status.architectures.contains("x86_64"));
    }

    #[test]
    fn test_serialized_search_result_round_trip() {
        let mut config = config_with_dbs(&["core"]);
        config.databases[0].update_package(pkg("zlib-1.2.11-4-x86_64.pkg.tar.zst"));

        let live = config.find_package(&Dependency::parse("zlib")).unwrap();
        let serialized = serde_json::to_string(&live.to_serializable(&config)).unwrap();
        let restored: crate::database::SerializedSearchResult =
            serde_json::from_str(&serialized).unwrap();
        let restored = PackageSearchResult::from(restored);

        match &restored.db {
            crate::database::DatabaseHandle::Info(info) => {
                assert_eq!(info.name, "core");
                assert_eq!(info.arch, "x86_64");
            }
            other => panic!("expected info handle, got {:?}", other),
        }
        assert_eq!(restored.pkg.name, live.pkg.name);
    }
}
