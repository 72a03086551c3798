// src/actions/repo_management.rs

//! Repository mutation actions
//!
//! Move/remove packages drive the external `repo-add`/`repo-remove` tools
//! (non-zero exit = failure) and the filesystem; check-for-problems and
//! clean-repository inspect repositories and report or fix what they
//! find. Per-package failures are accumulated, a failing tool invocation
//! marks all still-processing packages failed.

use crate::actions::process::{BuildProcess, MultiSession, ProcessResult};
use crate::actions::meta::clean_flags;
use crate::actions::{
    default_action_directory, resolve_database_denotations, ActionHandle, BuildActionMessages,
    BuildActionResult, BuildActionResultData, BuildActionType, PackageMovementResult,
    RepositoryProblem, RepositoryProblemDesc, ServiceSetup,
};
use crate::database::{Database, DatabaseId, PackageLocation};
use crate::dependencies::DependencySet;
use crate::packages::file_name_components;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{info, warn};

/// Everything a package-movement action needs after its preparation phase
struct MovementPreparation {
    destination_repo_dir: PathBuf,
    destination_db_file: String,
    source_repo_dir: PathBuf,
    source_db_file: String,
    /// `(package name, location, still ok)`
    package_locations: Vec<(String, PackageLocation, bool)>,
    working_directory: PathBuf,
    result: PackageMovementResult,
}

/// Shared preparation: validate databases/packages, locate the package
/// files and create the working directory
async fn prepare_movement(
    setup: &Arc<ServiceSetup>,
    action: &Arc<ActionHandle>,
    needs_source: bool,
) -> Option<MovementPreparation> {
    let (destination_denotations, source_denotations, package_names) = {
        let data = action.lock();
        (
            data.destination_dbs.clone(),
            data.source_dbs.clone(),
            data.package_names.clone(),
        )
    };
    if destination_denotations.len() != 1 {
        action
            .report_error(setup, "not exactly one destination database specified")
            .await;
        return None;
    }
    if needs_source && source_denotations.len() != 1 {
        action
            .report_error(setup, "not exactly one source database specified")
            .await;
        return None;
    }
    if package_names.is_empty() {
        action.report_error(setup, "no packages specified").await;
        return None;
    }

    let mut preparation = MovementPreparation {
        destination_repo_dir: PathBuf::new(),
        destination_db_file: String::new(),
        source_repo_dir: PathBuf::new(),
        source_db_file: String::new(),
        package_locations: Vec::new(),
        working_directory: PathBuf::new(),
        result: PackageMovementResult::default(),
    };
    {
        let config = setup.config.read().await;
        let destination_id = match resolve_database_denotations(&config, &destination_denotations)
        {
            Ok(ids) => ids[0],
            Err(error) => {
                drop(config);
                action.report_error(setup, error).await;
                return None;
            }
        };
        let destination = config.database_by_id(destination_id).expect("resolved id");
        preparation.destination_repo_dir = destination.local_pkg_dir.clone();
        preparation.destination_db_file = file_name_of(&destination.path);

        let lookup_id = if needs_source {
            let source_id = match resolve_database_denotations(&config, &source_denotations) {
                Ok(ids) => ids[0],
                Err(error) => {
                    drop(config);
                    action.report_error(setup, error).await;
                    return None;
                }
            };
            let source = config.database_by_id(source_id).expect("resolved id");
            preparation.source_repo_dir = source.local_pkg_dir.clone();
            preparation.source_db_file = file_name_of(&source.path);
            source_id
        } else {
            destination_id
        };

        // locate every requested package within the relevant repo dir
        let db = config.database_by_id(lookup_id).expect("resolved id");
        for package_name in &package_names {
            let Some(package) = db.packages.get(package_name) else {
                preparation.result.failed_packages.push((
                    package_name.clone(),
                    "package not listed in database file".to_string(),
                ));
                continue;
            };
            let location = db.locate_package(&package.compute_file_name());
            if let Some(error) = &location.error {
                preparation.result.failed_packages.push((
                    package_name.clone(),
                    format!("unable to locate package within repo directory: {}", error),
                ));
                continue;
            }
            if !location.exists {
                preparation.result.failed_packages.push((
                    package_name.clone(),
                    "package not present within repo directory".to_string(),
                ));
                continue;
            }
            preparation
                .package_locations
                .push((package_name.clone(), location, true));
        }
    }

    if preparation.package_locations.is_empty() {
        preparation.result.error_message =
            "none of the specified packages could be located".to_string();
        report_movement_result(setup, action, preparation.result, BuildActionResult::Failure)
            .await;
        return None;
    }

    // init the working directory holding the tool log files
    let type_slug = match action.lock().action_type {
        BuildActionType::MovePackages => "repo-move",
        _ => "repo-remove",
    };
    let directory = {
        let building = setup.building.write().await;
        let mut data = action.lock();
        if data.directory.is_empty() {
            data.directory = default_action_directory(type_slug, &preparation.destination_db_file);
        }
        building.repo_management_dir().join(&data.directory)
    };
    if let Err(e) = tokio::fs::create_dir_all(&directory).await {
        preparation.result.error_message = format!("unable to make working directory: {}", e);
        report_movement_result(setup, action, preparation.result, BuildActionResult::Failure)
            .await;
        return None;
    }
    preparation.working_directory = directory;
    Some(preparation)
}

async fn report_movement_result(
    setup: &Arc<ServiceSetup>,
    action: &Arc<ActionHandle>,
    result: PackageMovementResult,
    outcome: BuildActionResult,
) {
    action
        .finish(setup, outcome, BuildActionResultData::MovementResult(result))
        .await;
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Move packages from one repository to another
///
/// Copies the files, then runs `repo-add` on the destination and
/// `repo-remove` on the source in parallel; the source copies are only
/// deleted after `repo-remove` succeeded. Storage locations shared via
/// the `any` directory are left in place.
pub async fn run_move_packages(setup: &Arc<ServiceSetup>, action: &Arc<ActionHandle>) {
    let Some(mut preparation) = prepare_movement(setup, action, true).await else {
        return;
    };

    // copy packages to the destination repo
    let mut file_names: Vec<String> = Vec::new();
    for (package_name, location, ok) in &mut preparation.package_locations {
        let file_name = file_name_of(&location.path_within_repo);
        let copy_result = if location.storage_location.as_os_str().is_empty() {
            std::fs::copy(
                &location.path_within_repo,
                preparation.destination_repo_dir.join(&file_name),
            )
            .map(|_| ())
            .map_err(|e| e.to_string())
        } else {
            copy_symlinked_package(location, &preparation.destination_repo_dir, &file_name)
        };
        if let Err(error) = copy_result {
            *ok = false;
            preparation.result.failed_packages.push((
                package_name.clone(),
                format!("unable to copy to destination repo: {}", error),
            ));
            continue;
        }
        file_names.push(file_name);
        preparation.result.processed_packages.push(package_name.clone());
    }

    if file_names.is_empty() {
        preparation.result.error_message =
            "none of the specified packages could be copied to the destination repo".to_string();
        report_movement_result(setup, action, preparation.result, BuildActionResult::Failure)
            .await;
        return;
    }

    // launch repo-add and repo-remove in parallel, joined by a barrier
    // that fires exactly once after both exited
    let (barrier_tx, barrier_rx) = tokio::sync::oneshot::channel::<()>();
    let mut barrier_tx = Some(barrier_tx);
    let session = MultiSession::new(
        2,
        Box::new(move || {
            if let Some(tx) = barrier_tx.take() {
                let _ = tx.send(());
            }
        }),
    );

    let add_slot: Arc<Mutex<Option<ProcessResult>>> = Arc::new(Mutex::new(None));
    let remove_slot: Arc<Mutex<Option<ProcessResult>>> = Arc::new(Mutex::new(None));

    let mut add_command = Command::new(setup.building.read().await.repo_add_path.clone());
    add_command
        .arg(&preparation.destination_db_file)
        .args(&file_names)
        .current_dir(&preparation.destination_repo_dir);
    let add_process = BuildProcess::new("repo-add", preparation.working_directory.join("repo-add.log"));
    action.append_output(format!(
        "Invoking repo-add within \"{}\" for \"{}\", see logfile for details\n",
        preparation.destination_repo_dir.display(),
        preparation.destination_db_file
    ));
    {
        let action = Arc::clone(action);
        let session = Arc::clone(&session);
        let add_slot = Arc::clone(&add_slot);
        tokio::spawn(async move {
            let result = add_process.run(&action, add_command).await;
            *add_slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
            session.complete_one();
        });
    }

    let mut remove_command = Command::new(setup.building.read().await.repo_remove_path.clone());
    remove_command
        .arg(&preparation.source_db_file)
        .args(&preparation.result.processed_packages)
        .current_dir(&preparation.source_repo_dir);
    let remove_process = BuildProcess::new(
        "repo-remove",
        preparation.working_directory.join("repo-remove.log"),
    );
    action.append_output(format!(
        "Invoking repo-remove within \"{}\" for \"{}\", see logfile for details\n",
        preparation.source_repo_dir.display(),
        preparation.source_db_file
    ));
    {
        let action = Arc::clone(action);
        let session = Arc::clone(&session);
        let remove_slot = Arc::clone(&remove_slot);
        tokio::spawn(async move {
            let result = remove_process.run(&action, remove_command).await;
            *remove_slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
            session.complete_one();
        });
    }

    let _ = barrier_rx.await;
    let add_result = add_slot
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
        .unwrap_or_default();
    let remove_result = remove_slot
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
        .unwrap_or_default();

    let mut result = preparation.result;
    let add_error = (!add_result.succeeded())
        .then(|| format!("unable to add packages: {}", add_result.failure_reason("repo-add")));
    let remove_error = (!remove_result.succeeded()).then(|| {
        format!(
            "unable to remove package: {}",
            remove_result.failure_reason("repo-remove")
        )
    });

    if remove_error.is_none() {
        // delete the source copies; storage locations may still be
        // referenced by other repositories and stay
        for (package_name, location, ok) in &mut preparation.package_locations {
            if !*ok {
                continue;
            }
            if let Err(e) = std::fs::remove_file(&location.path_within_repo) {
                *ok = false;
                result.failed_packages.push((
                    package_name.clone(),
                    format!("unable to remove from source repo: {}", e),
                ));
                result.processed_packages.retain(|name| name != package_name);
            }
        }
    }

    // conclude: a failing tool invocation marks all processed packages
    // failed with a shared reason
    let failure_reason = match (&add_error, &remove_error) {
        (Some(add), Some(remove)) => {
            result.error_message = format!("{}, {}", remove, add);
            "repo-add and repo-remove error"
        }
        (Some(add), None) => {
            result.error_message = add.clone();
            "repo-add error"
        }
        (None, Some(remove)) => {
            result.error_message = remove.clone();
            "repo-remove error"
        }
        (None, None) => {
            if result.error_message.is_empty() && !result.failed_packages.is_empty() {
                result.error_message =
                    format!("failed to move {} packages", result.failed_packages.len());
            }
            let outcome = if result.failed_packages.is_empty() {
                BuildActionResult::Success
            } else {
                BuildActionResult::Failure
            };
            report_movement_result(setup, action, result, outcome).await;
            return;
        }
    };
    for processed in result.processed_packages.drain(..) {
        result
            .failed_packages
            .push((processed, failure_reason.to_string()));
    }
    report_movement_result(setup, action, result, BuildActionResult::Failure).await;
}

/// Recreate a symlinked package in the destination repo: reject absolute
/// targets, copy the storage file and the link itself
fn copy_symlinked_package(
    location: &PackageLocation,
    destination_repo_dir: &Path,
    file_name: &str,
) -> std::result::Result<(), String> {
    let target = std::fs::read_link(&location.path_within_repo).map_err(|e| e.to_string())?;
    if target.is_absolute() {
        return Err(format!(
            "\"{}\" is a symlink with absolute target path (only relative target paths supported)",
            location.path_within_repo.display()
        ));
    }
    let new_storage_location = destination_repo_dir.join(&target);
    if let Some(parent) = new_storage_location.parent() {
        // ensure e.g. the "any" directory exists; further parents are
        // assumed to exist already
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    std::fs::copy(&location.storage_location, &new_storage_location)
        .map_err(|e| e.to_string())?;
    let new_link = destination_repo_dir.join(file_name);
    #[cfg(unix)]
    std::os::unix::fs::symlink(&target, &new_link).map_err(|e| e.to_string())?;
    #[cfg(not(unix))]
    std::fs::copy(&location.storage_location, &new_link)
        .map(|_| ())
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Remove packages from a repository, archiving the package files
pub async fn run_remove_packages(setup: &Arc<ServiceSetup>, action: &Arc<ActionHandle>) {
    let Some(mut preparation) = prepare_movement(setup, action, false).await else {
        return;
    };

    for (package_name, _, _) in &preparation.package_locations {
        preparation.result.processed_packages.push(package_name.clone());
    }

    let mut remove_command = Command::new(setup.building.read().await.repo_remove_path.clone());
    remove_command
        .arg(&preparation.destination_db_file)
        .args(&preparation.result.processed_packages)
        .current_dir(&preparation.destination_repo_dir);
    let remove_process = BuildProcess::new(
        "repo-remove",
        preparation.working_directory.join("repo-remove.log"),
    );
    action.append_output(format!(
        "Invoking repo-remove within \"{}\" for \"{}\", see logfile for details\n",
        preparation.destination_repo_dir.display(),
        preparation.destination_db_file
    ));
    let remove_result = remove_process.run(action, remove_command).await;

    let mut result = preparation.result;
    if !remove_result.succeeded() {
        result.error_message = format!(
            "unable to remove packages: {}",
            remove_result.failure_reason("repo-remove")
        );
        for processed in result.processed_packages.drain(..) {
            result
                .failed_packages
                .push((processed, "repo-remove error".to_string()));
        }
        report_movement_result(setup, action, result, BuildActionResult::Failure).await;
        return;
    }

    // move the removed package files and their storage locations into
    // sibling archive directories, created on demand
    action.append_output("Moving packages to archive directory\n");
    for (package_name, location, _) in &preparation.package_locations {
        if let Err(error) = archive_file(&location.path_within_repo)
            .and_then(|_| {
                if location.storage_location.as_os_str().is_empty() {
                    Ok(())
                } else {
                    archive_file(&location.storage_location)
                }
            })
        {
            result
                .failed_packages
                .push((package_name.clone(), format!("unable to archive: {}", error)));
            result.processed_packages.retain(|name| name != package_name);
        }
    }

    if result.failed_packages.is_empty() {
        report_movement_result(setup, action, result, BuildActionResult::Success).await;
        return;
    }
    result.error_message = format!("failed to remove {} packages", result.failed_packages.len());
    report_movement_result(setup, action, result, BuildActionResult::Failure).await;
}

/// Move a file into an `archive/` directory next to it
fn archive_file(path: &Path) -> std::result::Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("\"{}\" has no parent directory", path.display()))?;
    let archive_dir = parent.join("archive");
    std::fs::create_dir_all(&archive_dir).map_err(|e| e.to_string())?;
    let file_name = path
        .file_name()
        .ok_or_else(|| format!("\"{}\" has no file name", path.display()))?;
    std::fs::rename(path, archive_dir.join(file_name)).map_err(|e| e.to_string())?;
    Ok(())
}

/// Report missing files, missing package archives and unresolved
/// dependencies/libraries for each destination database
pub async fn run_check_for_problems(setup: &Arc<ServiceSetup>, action: &Arc<ActionHandle>) {
    let destination_denotations = action.lock().destination_dbs.clone();
    if destination_denotations.is_empty() {
        action
            .report_error(setup, "no destination database specified")
            .await;
        return;
    }

    let mut problems_by_db: HashMap<String, Vec<RepositoryProblem>> = HashMap::new();
    {
        let config = setup.config.read().await;
        let destination_ids = match resolve_database_denotations(&config, &destination_denotations)
        {
            Ok(ids) => ids,
            Err(error) => {
                drop(config);
                action.report_error(setup, error).await;
                return;
            }
        };
        for db_id in destination_ids {
            let db = config.database_by_id(db_id).expect("resolved id");
            let problems = problems_by_db.entry(db.name.clone()).or_default();

            if db.path.as_os_str().is_empty() || !db.path.is_file() {
                problems.push(RepositoryProblem {
                    desc: RepositoryProblemDesc::Message(format!(
                        "db file \"{}\" is not a regular file",
                        db.path.display()
                    )),
                    pkg: String::new(),
                });
            }
            let files_path = if db.files_path.as_os_str().is_empty() {
                db.files_path_from_regular_path()
            } else {
                db.files_path.clone()
            };
            if files_path.as_os_str().is_empty() || !files_path.is_file() {
                problems.push(RepositoryProblem {
                    desc: RepositoryProblemDesc::Message(format!(
                        "files db file \"{}\" is not a regular file",
                        files_path.display()
                    )),
                    pkg: String::new(),
                });
            }
            if !db.local_pkg_dir.as_os_str().is_empty() {
                if !db.local_pkg_dir.is_dir() {
                    problems.push(RepositoryProblem {
                        desc: RepositoryProblemDesc::Message(format!(
                            "configured local package directory \"{}\" is not a directory",
                            db.local_pkg_dir.display()
                        )),
                        pkg: String::new(),
                    });
                }
                let mut names: Vec<&String> = db.packages.keys().collect();
                names.sort();
                for package_name in names {
                    let package = &db.packages[package_name];
                    if package.package_info.is_none() {
                        problems.push(RepositoryProblem {
                            desc: RepositoryProblemDesc::Message(
                                "no package info present".to_string(),
                            ),
                            pkg: package_name.clone(),
                        });
                        continue;
                    }
                    let location = db.locate_package(&package.compute_file_name());
                    if !location.exists {
                        problems.push(RepositoryProblem {
                            desc: RepositoryProblemDesc::Message(format!(
                                "binary package \"{}\" not present",
                                package.compute_file_name()
                            )),
                            pkg: package_name.clone(),
                        });
                    }
                }
            }

            // unresolved dependencies and missing libraries
            let unresolved =
                db.detect_unresolved_packages(&config, &[], &DependencySet::new());
            for (package, unresolved_deps) in unresolved {
                problems.push(RepositoryProblem {
                    desc: RepositoryProblemDesc::Unresolved(unresolved_deps),
                    pkg: package.name.clone(),
                });
            }
        }
    }

    action
        .finish(
            setup,
            BuildActionResult::Success,
            BuildActionResultData::RepoProblems(problems_by_db),
        )
        .await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepoDirType {
    New,
    ArchSpecific,
    Any,
    Src,
}

/// One repository directory discovered by the clean action
struct RepoDir {
    canonical_path: PathBuf,
    /// Old packages no longer referenced, with a note what is referenced
    /// instead
    to_archive: Vec<(PathBuf, String)>,
    /// Non-package junk files
    to_delete: Vec<PathBuf>,
    relevant_dbs: Vec<DatabaseId>,
    /// Ad-hoc databases loaded for sibling dirs, indexed into `extra_dbs`
    relevant_extra_dbs: Vec<usize>,
    dir_type: RepoDirType,
}

impl RepoDir {
    fn new() -> Self {
        Self {
            canonical_path: PathBuf::new(),
            to_archive: Vec::new(),
            to_delete: Vec::new(),
            relevant_dbs: Vec::new(),
            relevant_extra_dbs: Vec::new(),
            dir_type: RepoDirType::New,
        }
    }
}

/// Flag unreferenced package files for archiving and junk files for
/// deletion across the destination repositories and their sibling dirs,
/// then execute unless dry-running
pub async fn run_clean_repository(setup: &Arc<ServiceSetup>, action: &Arc<ActionHandle>) {
    let (flags, destination_denotations) = {
        let data = action.lock();
        (data.flags, data.destination_dbs.clone())
    };
    let dry_run = flags & clean_flags::DRY_RUN != 0;
    action.append_output(if dry_run {
        "Preparing cleanup, dry run\n"
    } else {
        "Preparing cleanup\n"
    });
    if destination_denotations.is_empty() {
        action
            .report_error(setup, "no destination database specified")
            .await;
        return;
    }

    let mut messages = BuildActionMessages::default();
    let mut repo_dirs: HashMap<PathBuf, RepoDir> = HashMap::new();
    let mut extra_dbs: Vec<Database> = Vec::new();
    {
        let config = setup.config.read().await;
        let destination_ids = match resolve_database_denotations(&config, &destination_denotations)
        {
            Ok(ids) => ids,
            Err(error) => {
                drop(config);
                action.report_error(setup, error).await;
                return;
            }
        };

        // discover the arch-specific dirs, their any/src siblings and the
        // dirs of sibling repositories for other architectures
        let mut fatal_error = false;
        for &db_id in &destination_ids {
            let db = config.database_by_id(db_id).expect("resolved id");
            if db.local_pkg_dir.as_os_str().is_empty() {
                messages.errors.push(format!(
                    "Unable to clean \"{}\": no local package directory configured",
                    db.name
                ));
                continue;
            }
            let mut parent_path = PathBuf::new();
            let mut canonical_arch_path = PathBuf::new();
            match std::fs::canonicalize(&db.local_pkg_dir) {
                Ok(arch_specific_path) => {
                    parent_path = arch_specific_path.parent().map(Path::to_path_buf).unwrap_or_default();
                    canonical_arch_path = arch_specific_path.clone();
                    let dir = repo_dirs
                        .entry(arch_specific_path.clone())
                        .or_insert_with(RepoDir::new);
                    if dir.dir_type == RepoDirType::New {
                        dir.dir_type = RepoDirType::ArchSpecific;
                        dir.canonical_path = arch_specific_path;
                    }
                    dir.relevant_dbs.push(db_id);
                }
                Err(e) => {
                    messages.errors.push(format!(
                        "Unable to consider \"arch-specific\" dir of \"{}\": {}",
                        db.name, e
                    ));
                }
            }
            add_any_and_src_dirs(&mut repo_dirs, &db.local_pkg_dir, db_id, &db.name);
            if parent_path.as_os_str().is_empty() {
                fatal_error = true;
                continue;
            }
            // directories of the same repository for other architectures
            match std::fs::read_dir(&parent_path) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        let path = entry.path();
                        let name = entry.file_name();
                        if !path.is_dir()
                            || path == canonical_arch_path
                            || name == "any"
                            || name == "src"
                            || name == "archive"
                        {
                            continue;
                        }
                        repo_dirs.entry(path).or_insert_with(RepoDir::new);
                    }
                }
                Err(e) => {
                    messages.errors.push(format!(
                        "Unable to find repositories next to \"{}\": {}",
                        db.name, e
                    ));
                    fatal_error = true;
                }
            }
        }
        if fatal_error {
            handle_fatal_error(setup, action, messages).await;
            return;
        }

        // load ad-hoc databases for dirs discovered without a configured db
        for (dir_path, dir) in &mut repo_dirs {
            if dir.dir_type != RepoDirType::New {
                continue;
            }
            match load_ad_hoc_database(dir_path) {
                Ok(db) => {
                    dir.canonical_path = dir_path.clone();
                    dir.dir_type = RepoDirType::ArchSpecific;
                    dir.relevant_extra_dbs.push(extra_dbs.len());
                    extra_dbs.push(db);
                }
                Err(e) => {
                    messages.errors.push(format!(
                        "Unable to read database file in repo dir \"{}\": {}",
                        dir_path.display(),
                        e
                    ));
                    fatal_error = true;
                }
            }
        }
        if fatal_error {
            handle_fatal_error(setup, action, messages).await;
            return;
        }

        // the any/src dirs are also relevant for the ad-hoc databases
        for index in 0..extra_dbs.len() {
            let local_pkg_dir = extra_dbs[index].local_pkg_dir.clone();
            for sibling in ["any", "src"] {
                if let Ok(path) = std::fs::canonicalize(local_pkg_dir.join("..").join(sibling)) {
                    if let Some(dir) = repo_dirs.get_mut(&path) {
                        dir.relevant_extra_dbs.push(index);
                    }
                }
            }
        }

        // every repo dir must have at least one relevant database now
        for (dir_path, dir) in &repo_dirs {
            if dir.relevant_dbs.is_empty() && dir.relevant_extra_dbs.is_empty() {
                messages.errors.push(format!(
                    "Unable to associate a database with repo dir \"{}\"",
                    dir_path.display()
                ));
                fatal_error = true;
            }
        }
        if fatal_error {
            handle_fatal_error(setup, action, messages).await;
            return;
        }

        // flag unreferenced packages for archiving, junk for deletion
        for dir in repo_dirs.values_mut() {
            let entries = match std::fs::read_dir(&dir.canonical_path) {
                Ok(entries) => entries,
                Err(e) => {
                    messages.errors.push(format!(
                        "Unable to iterate through repo directory \"{}\": {}",
                        dir.canonical_path.display(),
                        e
                    ));
                    continue;
                }
            };
            let mut file_names: Vec<String> = entries
                .flatten()
                .filter(|entry| {
                    entry
                        .file_type()
                        .map(|t| t.is_file() || t.is_symlink())
                        .unwrap_or(false)
                })
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect();
            file_names.sort();

            for file_name in file_names {
                // skip the database files themselves
                if file_name.contains(".db") || file_name.contains(".files") {
                    continue;
                }
                let path = dir.canonical_path.join(&file_name);
                // non-package files are junk
                if !file_name.contains(".pkg") && !file_name.contains(".src") {
                    dir.to_delete.push(path);
                    continue;
                }
                let package_name = match file_name_components(&file_name) {
                    Ok((name, _, _)) => name.to_string(),
                    Err(e) => {
                        messages.warnings.push(format!(
                            "Unable to parse package name of \"{}\" ({}). Not touching it to be safe.",
                            file_name, e
                        ));
                        continue;
                    }
                };

                let mut still_referenced = false;
                let mut actually_referenced: Vec<String> = Vec::new();
                let relevant: Vec<&Database> = dir
                    .relevant_dbs
                    .iter()
                    .filter_map(|&id| config.database_by_id(id))
                    .chain(dir.relevant_extra_dbs.iter().map(|&index| &extra_dbs[index]))
                    .collect();
                for db in relevant {
                    let Some(package) = db.packages.get(&package_name) else {
                        continue;
                    };
                    let Some(package_info) = &package.package_info else {
                        messages.warnings.push(format!(
                            "Database entry for package \"{}\" misses the file name. Not touching \"{}\" to be safe.",
                            package.name, file_name
                        ));
                        still_referenced = true;
                        continue;
                    };
                    if package_info.file_name == file_name {
                        still_referenced = true;
                        break;
                    }
                    actually_referenced.push(package_info.file_name.clone());
                }
                if !still_referenced {
                    dir.to_archive.push((path, actually_referenced.join(", ")));
                }
            }
        }
    }

    // execute the filesystem operations; every error is recorded and the
    // action always completes
    let mut dir_paths: Vec<&PathBuf> = repo_dirs.keys().collect();
    dir_paths.sort();
    let dir_paths: Vec<PathBuf> = dir_paths.into_iter().cloned().collect();
    for dir_path in dir_paths {
        let dir = &repo_dirs[&dir_path];
        // skip source repos: split packages would yield false positives
        if dir.dir_type == RepoDirType::Src {
            continue;
        }
        let mut processed_items = 0usize;
        for to_delete in &dir.to_delete {
            if dry_run {
                processed_items += 1;
                messages.notes.push(format!("Deleted {}", to_delete.display()));
                continue;
            }
            match std::fs::remove_file(to_delete) {
                Ok(()) => {
                    processed_items += 1;
                    messages.notes.push(format!("Deleted {}", to_delete.display()));
                }
                Err(e) => messages.errors.push(format!("Unable to delete: {}", e)),
            }
        }
        if !dir.to_archive.is_empty() {
            let archive_dir = dir.canonical_path.join("archive");
            if !dry_run {
                if let Err(e) = std::fs::create_dir_all(&archive_dir) {
                    messages
                        .errors
                        .push(format!("Unable to create archive directory: {}", e));
                    continue;
                }
            }
            for (path, referenced) in &dir.to_archive {
                let note = format!(
                    "Archived {} (current version: {})",
                    path.display(),
                    if referenced.is_empty() { "removed" } else { referenced }
                );
                if dry_run {
                    processed_items += 1;
                    messages.notes.push(note);
                    continue;
                }
                let target = archive_dir.join(path.file_name().unwrap_or_default());
                match std::fs::rename(path, target) {
                    Ok(()) => {
                        processed_items += 1;
                        messages.notes.push(note);
                    }
                    Err(e) => messages.errors.push(format!("Unable to archive: {}", e)),
                }
            }
        }
        action.append_output(format!(
            "Archived/deleted {} files in \"{}\"\n",
            processed_items,
            dir_path.display()
        ));
    }

    let result = if messages.errors.is_empty() {
        BuildActionResult::Success
    } else {
        BuildActionResult::Failure
    };
    info!(
        "repository cleanup finished with {} notes, {} errors",
        messages.notes.len(),
        messages.errors.len()
    );
    action
        .finish(setup, result, BuildActionResultData::Messages(messages))
        .await;
}

fn add_any_and_src_dirs(
    repo_dirs: &mut HashMap<PathBuf, RepoDir>,
    local_pkg_dir: &Path,
    db_id: DatabaseId,
    db_name: &str,
) {
    for (sibling, dir_type) in [("any", RepoDirType::Any), ("src", RepoDirType::Src)] {
        match std::fs::canonicalize(local_pkg_dir.join("..").join(sibling)) {
            Ok(path) => {
                let dir = repo_dirs.entry(path.clone()).or_insert_with(RepoDir::new);
                if dir.dir_type == RepoDirType::New {
                    dir.dir_type = dir_type;
                    dir.canonical_path = path;
                }
                dir.relevant_dbs.push(db_id);
            }
            Err(e) => {
                // shared any/src dirs are optional
                warn!("unable to consider \"{}\" dir of \"{}\": {}", sibling, db_name, e);
            }
        }
    }
}

/// Load the single `*.db` file of an unconfigured repository directory as
/// an ad-hoc database
fn load_ad_hoc_database(dir_path: &Path) -> std::result::Result<Database, String> {
    let mut db_file_names: Vec<String> = Vec::new();
    for entry in std::fs::read_dir(dir_path).map_err(|e| e.to_string())?.flatten() {
        let path = entry.path();
        let is_file_or_link = entry
            .file_type()
            .map(|t| t.is_file() || t.is_symlink())
            .unwrap_or(false);
        if is_file_or_link && path.extension().map(|e| e == "db").unwrap_or(false) {
            db_file_names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    if db_file_names.is_empty() {
        return Err("no *.db file present".to_string());
    }
    if db_file_names.len() > 1 {
        db_file_names.sort();
        return Err(format!(
            "multiple/ambiguous *.db files present: {}",
            db_file_names.join(", ")
        ));
    }
    let mut db = Database::new(
        dir_path.to_string_lossy().into_owned(),
        dir_path.join(&db_file_names[0]),
    );
    db.local_pkg_dir = dir_path.to_path_buf();
    db.load_packages(false).map_err(|e| e.to_string())?;
    Ok(db)
}

async fn handle_fatal_error(
    setup: &Arc<ServiceSetup>,
    action: &Arc<ActionHandle>,
    messages: BuildActionMessages,
) {
    action.append_output("Cleanup aborted due to fatal errors\n");
    action
        .finish(
            setup,
            BuildActionResult::Failure,
            BuildActionResultData::Messages(messages),
        )
        .await;
}
