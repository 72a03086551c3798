// src/config/build_order.rs

//! Build-order planner
//!
//! Produces an ordered sequence of packages such that every package's kept
//! dependencies precede it, using a recursive depth-first search with
//! on-stack cycle detection. The tie-break for resolving a dependency is
//! stable: destination-database preference, then newest version, then
//! lexical database order, so identical inputs yield identical output.

use crate::config::Config;
use crate::database::{DatabaseHandle, DatabaseId, PackageSearchResult};
use crate::dependencies::Dependency;
use crate::packages::Package;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::ops::BitOr;
use std::sync::Arc;
use tracing::debug;

/// Options of [`Config::compute_build_order`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOrderOptions(u8);

impl BuildOrderOptions {
    pub const NONE: BuildOrderOptions = BuildOrderOptions(0);
    /// Add packages that appear only as source-side dependencies to the
    /// resulting list
    pub const INCLUDE_SOURCE_ONLY_DEPENDENCIES: BuildOrderOptions = BuildOrderOptions(0x2);
    /// Add *all* dependencies to the resulting list (implies
    /// `INCLUDE_SOURCE_ONLY_DEPENDENCIES`)
    pub const INCLUDE_ALL_DEPENDENCIES: BuildOrderOptions = BuildOrderOptions(0x3);
    /// Use make and check dependencies when computing edges
    pub const CONSIDER_BUILD_DEPENDENCIES: BuildOrderOptions = BuildOrderOptions(0x4);

    pub fn contains(self, other: BuildOrderOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BuildOrderOptions {
    type Output = BuildOrderOptions;
    fn bitor(self, rhs: Self) -> Self {
        BuildOrderOptions(self.0 | rhs.0)
    }
}

/// One entry of a build-order computation; lives only for its duration
pub struct TopoSortItem {
    pub pkg: Arc<Package>,
    pub db: DatabaseId,
    /// Names of the packages that pulled this item into the order
    pub required_by: BTreeSet<String>,
}

/// Result of [`Config::compute_build_order`]
#[derive(Debug, Default, Clone)]
pub struct BuildOrderResult {
    pub order: Vec<PackageSearchResult>,
    pub cycle: Vec<PackageSearchResult>,
    /// Names of dependencies that could not be resolved
    pub ignored: Vec<String>,
    pub success: bool,
}

struct TopoSortState<'a> {
    options: BuildOrderOptions,
    destination_dbs: &'a HashSet<DatabaseId>,
    /// Packages the seeds resolved to; always kept in the order
    seed_keys: HashSet<(DatabaseId, String)>,
    items: Vec<TopoSortItem>,
    /// Packages fully processed
    visited: HashSet<(DatabaseId, String)>,
    /// Current DFS stack for cycle detection
    stack: Vec<PackageSearchResult>,
    cycle: Vec<PackageSearchResult>,
    ignored: Vec<String>,
}

impl Config {
    /// Compute the build order for a list of dependency denotations
    ///
    /// `destination_dbs` take precedence when a dependency resolves in
    /// more than one database (they hold the packages about to be built).
    pub fn compute_build_order(
        &self,
        denotations: &[String],
        options: BuildOrderOptions,
        destination_dbs: &HashSet<DatabaseId>,
    ) -> BuildOrderResult {
        let seeds: Vec<Dependency> = denotations.iter().map(|d| Dependency::parse(d)).collect();
        let mut seed_keys = HashSet::new();
        let mut all_seeds_resolved = true;
        for seed in &seeds {
            match self.resolve_for_build_order(seed, destination_dbs) {
                Some(result) => {
                    if let DatabaseHandle::Live(db_id) = result.db {
                        seed_keys.insert((db_id, result.pkg.name.clone()));
                    }
                }
                None => all_seeds_resolved = false,
            }
        }

        let mut state = TopoSortState {
            options,
            destination_dbs,
            seed_keys,
            items: Vec::new(),
            visited: HashSet::new(),
            stack: Vec::new(),
            cycle: Vec::new(),
            ignored: Vec::new(),
        };

        for seed in &seeds {
            if !self.add_deps_recursively(&mut state, seed, "", false) {
                break; // cycle; already recorded
            }
        }

        let success = state.cycle.is_empty() && all_seeds_resolved;
        debug!(
            "build order: {} items, {} ignored, success={}",
            state.items.len(),
            state.ignored.len(),
            success
        );
        BuildOrderResult {
            order: state
                .items
                .into_iter()
                .map(|item| PackageSearchResult::new(item.db, item.pkg))
                .collect(),
            cycle: state.cycle,
            ignored: state.ignored,
            success,
        }
    }

    /// DFS step; returns false when a cycle was hit and the walk must stop
    fn add_deps_recursively(
        &self,
        state: &mut TopoSortState<'_>,
        dependency: &Dependency,
        required_by: &str,
        only_dependency: bool,
    ) -> bool {
        let Some(result) = self.resolve_for_build_order(dependency, state.destination_dbs) else {
            if !state.ignored.iter().any(|name| name == &dependency.name) {
                state.ignored.push(dependency.name.clone());
            }
            return true;
        };
        let DatabaseHandle::Live(db_id) = &result.db else {
            return true;
        };
        let db_id = *db_id;
        let key = (db_id, result.pkg.name.clone());

        // a dependency only enters the order when the options keep it: a
        // seed always, every dependency with IncludeAllDependencies, and
        // source-only packages (no binary yet, about to be built) with
        // IncludeSourceOnlyDependencies
        let keep = !only_dependency
            || state.seed_keys.contains(&key)
            || state.options.contains(BuildOrderOptions::INCLUDE_ALL_DEPENDENCIES)
            || (state
                .options
                .contains(BuildOrderOptions::INCLUDE_SOURCE_ONLY_DEPENDENCIES)
                && result.pkg.package_info.is_none()
                && result.pkg.source_info.is_some());
        if !keep {
            return true;
        }

        if state.visited.contains(&key) {
            if let Some(item) = state
                .items
                .iter_mut()
                .find(|item| item.db == db_id && item.pkg.name == key.1)
            {
                if !required_by.is_empty() {
                    item.required_by.insert(required_by.to_string());
                }
            }
            return true;
        }
        if let Some(pos) = state
            .stack
            .iter()
            .position(|entry| entry.db == result.db && entry.pkg.name == result.pkg.name)
        {
            state.cycle = state.stack[pos..].to_vec();
            return false;
        }

        state.stack.push(result.clone());
        let with_build_deps = state
            .options
            .contains(BuildOrderOptions::CONSIDER_BUILD_DEPENDENCIES);
        let edges: Vec<Dependency> = result
            .pkg
            .dependencies(with_build_deps)
            .into_iter()
            .cloned()
            .collect();
        for edge in &edges {
            if !self.add_deps_recursively(state, edge, &result.pkg.name, true) {
                return false;
            }
        }
        state.stack.pop();

        state.visited.insert(key);
        let mut required_by_set = BTreeSet::new();
        if !required_by.is_empty() {
            required_by_set.insert(required_by.to_string());
        }
        state.items.push(TopoSortItem {
            pkg: Arc::clone(&result.pkg),
            db: db_id,
            required_by: required_by_set,
        });
        true
    }

    /// Resolve to at most one package per database, then prefer
    /// destination databases, newest version, lexical database order
    fn resolve_for_build_order(
        &self,
        dependency: &Dependency,
        destination_dbs: &HashSet<DatabaseId>,
    ) -> Option<PackageSearchResult> {
        self.find_package_candidates(dependency)
            .into_iter()
            .max_by(|a, b| {
                let a_db = match a.db {
                    DatabaseHandle::Live(id) => id,
                    DatabaseHandle::Info(_) => return std::cmp::Ordering::Less,
                };
                let b_db = match b.db {
                    DatabaseHandle::Live(id) => id,
                    DatabaseHandle::Info(_) => return std::cmp::Ordering::Greater,
                };
                destination_dbs
                    .contains(&a_db)
                    .cmp(&destination_dbs.contains(&b_db))
                    .then_with(|| a.pkg.version.cmp(&b.pkg.version))
                    .then_with(|| {
                        let a_name = self.database_by_id(a_db).map(|db| db.name.as_str());
                        let b_name = self.database_by_id(b_db).map(|db| db.name.as_str());
                        b_name.cmp(&a_name)
                    })
            })
    }
}

/// Split an order into batches: a package joins the current batch iff none
/// of its kept dependencies resolve to a member of that batch; batch
/// members are sorted by name
pub fn compute_batches(
    order: &[PackageSearchResult],
    options: BuildOrderOptions,
) -> Vec<Vec<String>> {
    let with_build_deps = options.contains(BuildOrderOptions::CONSIDER_BUILD_DEPENDENCIES);
    let mut batch_of: Vec<usize> = Vec::with_capacity(order.len());

    for (index, entry) in order.iter().enumerate() {
        let mut batch = 0;
        for dep in entry.pkg.dependencies(with_build_deps) {
            for (other_index, other) in order.iter().enumerate().take(index) {
                if other.pkg.provides_dependency(dep) {
                    batch = batch.max(batch_of[other_index] + 1);
                }
            }
        }
        batch_of.push(batch);
    }

    let batch_count = batch_of.iter().copied().max().map_or(0, |max| max + 1);
    let mut batches = vec![Vec::new(); batch_count];
    for (index, entry) in order.iter().enumerate() {
        batches[batch_of[index]].push(entry.pkg.name.clone());
    }
    for batch in &mut batches {
        batch.sort();
    }
    batches
}
