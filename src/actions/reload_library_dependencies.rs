// src/actions/reload_library_dependencies.rs

//! Reload-library-dependencies action
//!
//! Walks every relevant binary package archive, extracts `.PKGINFO`
//! metadata plus ELF/PE symbol info, and merges the results back into the
//! configuration graph. Selection happens under the config read lock,
//! downloading and parsing outside any lock, and the merge under a single
//! config write lock.

use crate::actions::meta::reload_flags;
use crate::actions::{
    resolve_database_denotations, ActionHandle, BuildActionMessages, BuildActionResult,
    BuildActionResultData, PackageCachingRequest, ServiceSetup,
};
use crate::database::DatabaseId;
use crate::dependencies::{DependencySet, LibraryId};
use crate::packages::archive::{last_modified, walk_archive};
use crate::packages::{Package, PackageInfo, PackageOrigin, SourceInfo};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;

/// One package selected for parsing
struct PackageToConsider {
    path: PathBuf,
    url: String,
    last_modified: Option<DateTime<Utc>>,
    /// Seed package carrying the fields used to match against the
    /// database entry after parsing
    info: Package,
}

/// All selected packages of one database
struct DatabaseToConsider {
    name: String,
    arch: String,
    packages: Vec<PackageToConsider>,
}

pub async fn run(setup: &Arc<ServiceSetup>, action: &Arc<ActionHandle>) {
    let (flags, destination_denotations) = {
        let data = action.lock();
        (data.flags, data.destination_dbs.clone())
    };
    let force = flags & reload_flags::FORCE_RELOAD != 0;
    let skip_dependencies = flags & reload_flags::SKIP_DEPENDENCIES != 0;

    let cache_dir = setup.building.read().await.package_cache_dir.clone();
    let mut messages = BuildActionMessages::default();

    // phase 1: find relevant databases and packages under the read lock
    action.append_output("Finding relevant databases/packages ...\n");
    let mut relevant_by_db: Vec<DatabaseToConsider> = Vec::new();
    let mut skipping_note = String::new();
    let mut remaining_packages = 0usize;
    {
        let config = setup.config.read().await;
        let destination_ids = match resolve_database_denotations(&config, &destination_denotations)
        {
            Ok(ids) => ids.into_iter().collect::<HashSet<DatabaseId>>(),
            Err(error) => {
                drop(config);
                action.report_error(setup, error).await;
                return;
            }
        };

        let mut relevant_dbs: BTreeSet<DatabaseId> = BTreeSet::new();
        let mut relevant_pkgs: HashSet<(DatabaseId, String)> = HashSet::new();
        let mut missing_deps = DependencySet::new();
        if destination_ids.is_empty() {
            relevant_dbs.extend(0..config.databases.len());
        } else {
            for &destination in &destination_ids {
                if !relevant_dbs.insert(destination) || skip_dependencies {
                    continue;
                }
                match config.compute_database_dependency_order(destination) {
                    Ok(order) => relevant_dbs.extend(order),
                    Err(error) => {
                        let name = config
                            .database_by_id(destination)
                            .map(|db| db.name.clone())
                            .unwrap_or_default();
                        messages
                            .errors
                            .push(format!("{}: unable to consider dependencies: {}", name, error));
                    }
                }
            }
            let relevant_set: HashSet<DatabaseId> = relevant_dbs.iter().copied().collect();
            for &destination in &destination_ids {
                let Some(db) = config.database_by_id(destination) else {
                    continue;
                };
                let mut names: Vec<&String> = db.packages.keys().collect();
                names.sort();
                for name in names {
                    config.pull_dependent_packages_of(
                        &db.packages[name],
                        &relevant_set,
                        &mut relevant_pkgs,
                        &mut missing_deps,
                    );
                }
            }
        }
        for (dependency_name, details) in missing_deps.iter() {
            let required_by: Vec<&str> = details
                .iter()
                .flat_map(|d| d.relevant_packages.iter().map(String::as_str))
                .collect();
            messages.warnings.push(format!(
                "dependency {} missing, required by {}",
                dependency_name,
                required_by.join(", ")
            ));
        }

        for &db_id in &relevant_dbs {
            let Some(db) = config.database_by_id(db_id) else {
                continue;
            };
            let is_destination = destination_ids.is_empty() || destination_ids.contains(&db_id);
            let mut considered = DatabaseToConsider {
                name: db.name.clone(),
                arch: db.arch.clone(),
                packages: Vec::new(),
            };
            let mut names: Vec<&String> = db.packages.keys().collect();
            names.sort();
            for package_name in names {
                if action.report_aborted_if_aborted(setup).await {
                    return;
                }
                let package = &db.packages[package_name];
                // the binary package's file name is required from here on
                let Some(package_info) = &package.package_info else {
                    messages
                        .errors
                        .push(format!("{}/{}: no package info", db.name, package_name));
                    continue;
                };
                if !is_destination
                    && !relevant_pkgs.contains(&(db_id, package_name.clone()))
                {
                    if !skipping_note.is_empty() {
                        skipping_note.push_str(", ");
                    }
                    skipping_note.push_str(&format!("{}/{}", db.name, package_name));
                    continue;
                }

                let file_name = &package_info.file_name;
                let arch = &package_info.arch;
                let mut path = PathBuf::new();
                let mut url = String::new();
                let cache_destination = cache_dir.join(file_name);
                if !db.local_pkg_dir.as_os_str().is_empty() {
                    path = db.local_pkg_dir.join(file_name);
                } else {
                    for candidate in [cache_dir.join(file_name), cache_dir.join(arch).join(file_name)] {
                        if candidate.exists() {
                            path = candidate;
                            break;
                        }
                    }
                    if path.as_os_str().is_empty() {
                        for extra_cache in &config.package_cache_dirs {
                            let candidate = extra_cache.join(file_name);
                            if candidate.exists() {
                                path = candidate;
                                break;
                            }
                        }
                    }
                }
                if path.as_os_str().is_empty() {
                    if let Some(mirror) = db.mirrors.first() {
                        if let Some(local) = mirror.strip_prefix("file:") {
                            if let Ok(canonical) =
                                std::fs::canonicalize(PathBuf::from(local).join(file_name))
                            {
                                path = canonical;
                            }
                        } else {
                            path = cache_destination;
                            url = format!(
                                "{}{}{}",
                                mirror,
                                if mirror.ends_with('/') { "" } else { "/" },
                                file_name
                            );
                        }
                    }
                }
                if path.as_os_str().is_empty() {
                    messages.errors.push(format!(
                        "{}/{}: binary package not found and no mirror configured",
                        db.name, package_name
                    ));
                    continue;
                }

                // skip when the contents were already parsed and the
                // archive on disk is not newer
                let mut modified = None;
                if url.is_empty() {
                    modified = last_modified(&path);
                    if !force
                        && package.origin == PackageOrigin::PackageContents
                        && package.timestamp.is_some()
                        && package.timestamp >= modified
                    {
                        messages.notes.push(format!(
                            "{}/{}: skipping because \"{}\" is not newer",
                            db.name,
                            package_name,
                            path.display()
                        ));
                        continue;
                    }
                }

                let mut seed = Package {
                    name: package.name.clone(),
                    version: package.version.clone(),
                    ..Default::default()
                };
                seed.package_info = Some(PackageInfo {
                    build_date: package_info.build_date,
                    ..Default::default()
                });
                seed.source_info = Some(SourceInfo::default());
                considered.packages.push(PackageToConsider {
                    path,
                    url,
                    last_modified: modified,
                    info: seed,
                });
                remaining_packages += 1;
            }
            relevant_by_db.push(considered);
        }
    }

    action.append_output(format!("Found {}\n", remaining_packages));
    if !skipping_note.is_empty() {
        skipping_note.push_str(": not required by any destination DB, skipping download");
        messages.notes.push(skipping_note);
    }

    if remaining_packages == 0 {
        conclude(setup, action, messages).await;
        return;
    }

    // phase 2: download missing packages outside any lock
    let mut caching_errors: HashMap<(String, String), String> = HashMap::new();
    let mut requests: Vec<PackageCachingRequest> = Vec::new();
    for db in &relevant_by_db {
        for package in &db.packages {
            if !package.url.is_empty() {
                requests.push(PackageCachingRequest {
                    database: db.name.clone(),
                    package: package.info.name.clone(),
                    url: package.url.clone(),
                    destination: package.path.clone(),
                    error: String::new(),
                });
            }
        }
    }
    if !requests.is_empty() {
        if action.report_aborted_if_aborted(setup).await {
            return;
        }
        action.append_output(format!(
            "Downloading {} binary packages from mirror ...\n",
            requests.len()
        ));
        match &setup.package_cacher {
            Some(cacher) => {
                let cacher = Arc::clone(cacher);
                requests = tokio::task::spawn_blocking(move || {
                    cacher.cache_packages(&mut requests);
                    requests
                })
                .await
                .unwrap_or_default();
            }
            None => {
                for request in &mut requests {
                    request.error = "no package cacher configured".to_string();
                }
            }
        }
        for request in requests {
            if !request.error.is_empty() {
                caching_errors.insert((request.database, request.package), request.error);
            }
        }
    }

    if action.report_aborted_if_aborted(setup).await {
        return;
    }

    // phase 3: parse the archives with hardware concurrency, no lock held
    action.append_output(format!("Parsing {} binary packages ...\n", remaining_packages));
    let aborted_flag = Arc::clone(action);
    let (parsed, parse_errors) = tokio::task::spawn_blocking(move || {
        parse_packages(relevant_by_db, caching_errors, &aborted_flag)
    })
    .await
    .unwrap_or_else(|e| (Vec::new(), vec![format!("parse workers panicked: {}", e)]));
    messages.errors.extend(parse_errors);

    if action.report_aborted_if_aborted(setup).await {
        return;
    }

    // phase 4: apply the parsed information under the write lock
    action.append_output("Adding parsed information to databases ...\n");
    let mut counter = 0usize;
    {
        let mut config = setup.config.write().await;
        for considered in &parsed {
            let Some(db_id) = config.find_database(&considered.name, &considered.arch) else {
                continue; // the database has been removed meanwhile
            };
            for package in &considered.packages {
                if package.info.origin != PackageOrigin::PackageContents {
                    continue; // parsing failed for this one
                }
                let db = config
                    .database_by_id_mut(db_id)
                    .expect("id from find_database");
                let Some(existing) = db.packages.get(&package.info.name) else {
                    continue; // the package has been removed meanwhile
                };
                let mut updated = existing.as_ref().clone();
                if !updated.add_deps_and_provides_from_other_package(&package.info) {
                    continue; // no longer matches the database entry
                }
                if updated.timestamp < package.last_modified {
                    updated.timestamp = package.last_modified;
                }
                let updated = Arc::new(updated);
                db.force_update_package(Arc::clone(&updated));
                if let Some(storage_env) = &setup.storage {
                    if let Ok(storage) = storage_env.database_storage(&considered.name) {
                        if let Err(e) = storage_env
                            .cache()
                            .store(&storage, updated.as_ref().clone(), true)
                        {
                            messages.warnings.push(format!(
                                "{}/{}: unable to persist: {}",
                                considered.name, updated.name, e
                            ));
                        }
                    }
                }
                counter += 1;
            }
        }
    }

    action.append_output(format!("Added dependency information for {} packages\n", counter));
    info!("reload added dependency information for {} packages", counter);
    conclude(setup, action, messages).await;
}

/// Worker pool popping packages off a shared queue; one failed archive
/// never aborts the whole run
fn parse_packages(
    relevant_by_db: Vec<DatabaseToConsider>,
    caching_errors: HashMap<(String, String), String>,
    action: &ActionHandle,
) -> (Vec<DatabaseToConsider>, Vec<String>) {
    struct QueueItem {
        db_index: usize,
        package: PackageToConsider,
    }

    let mut shells: Vec<DatabaseToConsider> = Vec::with_capacity(relevant_by_db.len());
    let mut queue: Vec<QueueItem> = Vec::new();
    for (db_index, mut db) in relevant_by_db.into_iter().enumerate() {
        for package in db.packages.drain(..) {
            queue.push(QueueItem { db_index, package });
        }
        shells.push(db);
    }
    queue.reverse();
    let queue = Mutex::new(queue);
    let results: Mutex<Vec<QueueItem>> = Mutex::new(Vec::new());
    let errors: Mutex<Vec<String>> = Mutex::new(Vec::new());

    let worker_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            scope.spawn(|| loop {
                if action.is_aborted() {
                    return;
                }
                let Some(mut item) = queue.lock().unwrap_or_else(|e| e.into_inner()).pop() else {
                    return;
                };
                let db_name = &shells[item.db_index].name;
                let package_name = item.package.info.name.clone();

                if !item.package.url.is_empty() {
                    if let Some(error) =
                        caching_errors.get(&(db_name.clone(), package_name.clone()))
                    {
                        errors
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(format!("{}/{}: {}", db_name, package_name, error));
                        continue;
                    }
                }

                let mut dll_refs: BTreeSet<LibraryId> = BTreeSet::new();
                let mut directories: Vec<String> = Vec::new();
                let info = &mut item.package.info;
                let walk_result = walk_archive(
                    &item.package.path,
                    &Package::is_pkg_info_file_or_binary,
                    |directory, file| {
                        if directory.is_empty() && file.name == ".PKGINFO" {
                            info.add_info_from_pkginfo_file(&String::from_utf8_lossy(
                                &file.content,
                            ));
                        } else {
                            info.add_deps_and_provides_from_contained_file(&file, &mut dll_refs);
                        }
                        Ok(())
                    },
                    |directory| {
                        if !directory.is_empty() {
                            directories.push(directory);
                        }
                    },
                );
                match walk_result {
                    Ok(()) => {
                        for directory in directories {
                            info.add_deps_and_provides_from_contained_directory(&directory);
                        }
                        info.process_dlls_referenced_by_import_libs(dll_refs);
                        info.origin = PackageOrigin::PackageContents;
                        results
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(item);
                    }
                    Err(e) => {
                        errors
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(format!("{}/{}: {}", db_name, package_name, e));
                    }
                }
            });
        }
    });

    for item in results.into_inner().unwrap_or_else(|e| e.into_inner()) {
        shells[item.db_index].packages.push(item.package);
    }
    let errors = errors.into_inner().unwrap_or_else(|e| e.into_inner());
    (shells, errors)
}

async fn conclude(
    setup: &Arc<ServiceSetup>,
    action: &Arc<ActionHandle>,
    messages: BuildActionMessages,
) {
    if action.report_aborted_if_aborted(setup).await {
        return;
    }
    let result = if messages.errors.is_empty() {
        BuildActionResult::Success
    } else {
        BuildActionResult::Failure
    };
    action
        .finish(setup, result, BuildActionResultData::Messages(messages))
        .await;
}
