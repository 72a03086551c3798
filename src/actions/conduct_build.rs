// src/actions/conduct_build.rs

//! Conduct-build action
//!
//! Works through the batches recorded by a build preparation: downloads
//! sources via `makepkg`, optionally refreshes checksums, builds in a
//! chroot via `makechrootpkg`, verifies the produced artefacts, places
//! them into the repository tree and registers them with `repo-add`.
//! Auto-staging reroutes packages that would break dependents into the
//! staging repository and records a rebuild list. Progress is persisted
//! after every state change.

use crate::actions::meta::{conduct_flags, settings};
use crate::actions::prepare_build::{restore_build_preparation, BuildPreparation};
use crate::actions::process::{BufferSearch, BuildProcess};
use crate::actions::{
    ActionHandle, BuildActionResult, BuildActionResultData, ServiceSetup,
};
use crate::packages::file_name_components;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{info, warn};

/// Progress of one package within a conducted build
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageBuildProgress {
    pub finished: Option<DateTime<Utc>>,
    pub error: String,
    pub added_to_repo: bool,
    pub staging_needed: bool,
    pub updated_version: String,
}

/// Libraries of a rebuilt package that a dependent still relies on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebuildInfo {
    pub libprovides: Vec<String>,
}

/// The state of a conducted build, persisted as `build-progress.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildProgress {
    pub progress_by_package: HashMap<String, PackageBuildProgress>,
    /// Downstream database → package → libraries that require a rebuild
    pub rebuild_list: HashMap<String, HashMap<String, RebuildInfo>>,
}

impl BuildProgress {
    /// Fresh progress covering every package of a preparation
    pub fn initial(preparation: &BuildPreparation) -> Self {
        let mut progress = BuildProgress::default();
        for batch in &preparation.batches {
            for package in batch {
                progress
                    .progress_by_package
                    .insert(package.clone(), PackageBuildProgress::default());
            }
        }
        progress
    }
}

pub async fn run(setup: &Arc<ServiceSetup>, action: &Arc<ActionHandle>) {
    let (flags, directory, package_names, chroot_dir_setting, chroot_user_setting) = {
        let data = action.lock();
        (
            data.flags,
            data.directory.clone(),
            data.package_names.clone(),
            data.settings.get(settings::CHROOT_DIR).cloned(),
            data.settings.get(settings::CHROOT_USER).cloned(),
        )
    };
    if directory.is_empty() {
        action.report_error(setup, "no directory specified").await;
        return;
    }
    let build_as_far_as_possible = flags & conduct_flags::BUILD_AS_FAR_AS_POSSIBLE != 0;
    let save_chroot_of_failures = flags & conduct_flags::SAVE_CHROOT_OF_FAILURES != 0;
    let update_checksums = flags & conduct_flags::UPDATE_CHECKSUMS != 0;
    let auto_staging = flags & conduct_flags::AUTO_STAGING != 0;

    // restore preparation and progress persisted by prepare-build
    let action_dir = setup.building.read().await.build_data_dir().join(&directory);
    let preparation = match restore_build_preparation(&action_dir).await {
        Ok(preparation) => preparation,
        Err(error) => {
            action.report_error(setup, error).await;
            return;
        }
    };
    let mut progress = match tokio::fs::read(action_dir.join("build-progress.json")).await {
        Ok(data) => serde_json::from_slice::<BuildProgress>(&data)
            .unwrap_or_else(|_| BuildProgress::initial(&preparation)),
        Err(_) => BuildProgress::initial(&preparation),
    };

    // chroot configuration
    let building = setup.building.read().await;
    let chroot_dir = chroot_dir_setting
        .map(PathBuf::from)
        .unwrap_or_else(|| building.chroot_dir.clone());
    let chroot_user = chroot_user_setting.unwrap_or_else(|| building.chroot_user.clone());
    let makepkg_path = building.makepkg_path.clone();
    let makechrootpkg_path = building.makechrootpkg_path.clone();
    let updpkgsums_path = building.updpkgsums_path.clone();
    let repo_add_path = building.repo_add_path.clone();
    drop(building);
    if chroot_dir.as_os_str().is_empty() {
        action
            .report_error(setup, "The chroot directory is not configured.")
            .await;
        return;
    }

    // destination (and possibly staging) repository locations
    let (destination_repo_dir, staging_repo_dir) = {
        let config = setup.config.read().await;
        if auto_staging
            && config
                .find_database(&preparation.staging_db, &preparation.target_arch)
                .is_none()
        {
            drop(config);
            action
                .report_error(
                    setup,
                    format!(
                        "Auto-staging is enabled but the staging database \"{}@{}\" specified in build-preparation.json can not be found.",
                        preparation.staging_db, preparation.target_arch
                    ),
                )
                .await;
            return;
        }
        let destination_dir = config
            .find_database(&preparation.target_db, &preparation.target_arch)
            .and_then(|id| config.database_by_id(id))
            .map(|db| db.local_pkg_dir.clone())
            .unwrap_or_default();
        let staging_dir = config
            .find_database(&preparation.staging_db, &preparation.target_arch)
            .and_then(|id| config.database_by_id(id))
            .map(|db| db.local_pkg_dir.clone())
            .unwrap_or_default();
        (destination_dir, staging_dir)
    };
    if destination_repo_dir.as_os_str().is_empty() || !destination_repo_dir.is_dir() {
        action
            .report_error(
                setup,
                format!(
                    "Destination repository \"{}\" does not exist.",
                    destination_repo_dir.display()
                ),
            )
            .await;
        return;
    }

    let mut failed_packages: Vec<String> = Vec::new();
    'batches: for batch in &preparation.batches {
        if !failed_packages.is_empty() && !build_as_far_as_possible {
            break;
        }
        for package_name in batch {
            if action.report_aborted_if_aborted(setup).await {
                return;
            }
            if !package_names.is_empty() && !package_names.contains(package_name) {
                continue;
            }
            let package_progress = progress
                .progress_by_package
                .entry(package_name.clone())
                .or_default();
            if package_progress.added_to_repo {
                continue; // already built in a previous run
            }
            *package_progress = PackageBuildProgress::default();

            let error = build_one_package(
                setup,
                action,
                &preparation,
                &mut progress,
                &BuildContext {
                    action_dir: &action_dir,
                    package_name,
                    chroot_dir: &chroot_dir,
                    chroot_user: &chroot_user,
                    makepkg_path: &makepkg_path,
                    makechrootpkg_path: &makechrootpkg_path,
                    updpkgsums_path: &updpkgsums_path,
                    repo_add_path: &repo_add_path,
                    destination_repo_dir: &destination_repo_dir,
                    staging_repo_dir: &staging_repo_dir,
                    update_checksums,
                    auto_staging,
                },
            )
            .await;

            let package_progress = progress
                .progress_by_package
                .entry(package_name.clone())
                .or_default();
            package_progress.finished = Some(Utc::now());
            if let Err(message) = error {
                package_progress.error = message.clone();
                failed_packages.push(package_name.clone());
                action.append_output(format!("{}: {}\n", package_name, message));
                if save_chroot_of_failures {
                    save_chroot_working_copy(
                        &chroot_dir,
                        &preparation.target_arch,
                        &chroot_user,
                        package_name,
                    );
                }
            } else {
                package_progress.added_to_repo = true;
            }
            persist_progress(&action_dir, &progress).await;

            if !failed_packages.is_empty() && !build_as_far_as_possible {
                break 'batches;
            }
        }
    }

    if failed_packages.is_empty() {
        info!("conducted build for {} finished successfully", preparation.target_db);
        action
            .finish(
                setup,
                BuildActionResult::Success,
                BuildActionResultData::BuildProgress(progress),
            )
            .await;
        return;
    }
    action
        .finish(
            setup,
            BuildActionResult::Failure,
            BuildActionResultData::Error(format!(
                "failed to build packages: {}",
                failed_packages.join(", ")
            )),
        )
        .await;
}

struct BuildContext<'a> {
    action_dir: &'a Path,
    package_name: &'a str,
    chroot_dir: &'a Path,
    chroot_user: &'a str,
    makepkg_path: &'a Path,
    makechrootpkg_path: &'a Path,
    updpkgsums_path: &'a Path,
    repo_add_path: &'a Path,
    destination_repo_dir: &'a Path,
    staging_repo_dir: &'a Path,
    update_checksums: bool,
    auto_staging: bool,
}

/// Build a single package through all phases; returns the package-level
/// error on failure
async fn build_one_package(
    setup: &Arc<ServiceSetup>,
    action: &Arc<ActionHandle>,
    preparation: &BuildPreparation,
    progress: &mut BuildProgress,
    context: &BuildContext<'_>,
) -> std::result::Result<(), String> {
    let package_dir = context.action_dir.join(context.package_name);
    let src_dir = package_dir.join("src");
    let pkg_dir = package_dir.join("pkg");
    if let Err(e) = tokio::fs::create_dir_all(&pkg_dir).await {
        return Err(format!("unable to create package directory: {}", e));
    }

    let chroot_root = context
        .chroot_dir
        .join(format!("arch-{}", preparation.target_arch))
        .join("root");
    if !chroot_root.is_dir() {
        return Err(format!(
            "Chroot directory \"{}\" is no directory.",
            chroot_root.display()
        ));
    }

    // download the sources
    let mut download_command = Command::new(context.makepkg_path);
    download_command
        .args(["-f", "--nodeps", "--nobuild", "--source"])
        .current_dir(&src_dir)
        .env("PKGDEST", &pkg_dir)
        .env("SRCPKGDEST", &pkg_dir);
    let download_process = BuildProcess::new("download", pkg_dir.join("download.log"));
    let download_result = download_process.run(action, download_command).await;
    if !download_result.succeeded() {
        return Err(format!(
            "unable to download sources: {}",
            download_result.failure_reason("makepkg")
        ));
    }
    // makepkg announces a version update when pkgver() bumped it
    let updated_version: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    {
        let updated_version = Arc::clone(&updated_version);
        let mut search = BufferSearch::new(
            "Updated version: ",
            "\x1b\n",
            "Starting build",
            move |version| {
                *updated_version.lock().unwrap_or_else(|e| e.into_inner()) = version;
            },
        );
        search.feed(download_result.output.as_bytes());
    }
    let updated_version = updated_version
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    if !updated_version.is_empty() {
        progress
            .progress_by_package
            .entry(context.package_name.to_string())
            .or_default()
            .updated_version = updated_version;
    }

    // refresh checksums when requested
    if context.update_checksums {
        let mut command = Command::new(context.updpkgsums_path);
        command.current_dir(&src_dir);
        let process = BuildProcess::new("updpkgsums", pkg_dir.join("updpkgsums.log"));
        let result = process.run(action, command).await;
        if !result.succeeded() {
            return Err(format!(
                "unable to update checksums: {}",
                result.failure_reason("updpkgsums")
            ));
        }
    }

    // build within the chroot
    let mut build_command = Command::new(context.makechrootpkg_path);
    build_command
        .arg("-c")
        .arg("-u")
        .arg("-C")
        .arg("-r")
        .arg(context.chroot_dir.join(format!("arch-{}", preparation.target_arch)))
        .arg("-l")
        .arg(context.chroot_user)
        .arg("--")
        .current_dir(&src_dir)
        .env("PKGDEST", &pkg_dir);
    let build_process = BuildProcess::new("build", pkg_dir.join("build.log"));
    let build_result = build_process.run(action, build_command).await;
    if !build_result.succeeded() {
        return Err(format!(
            "unable to build: {}",
            build_result.failure_reason("makechrootpkg")
        ));
    }

    // verify that the expected artefacts exist
    let version = preparation
        .build_data
        .get(context.package_name)
        .map(|data| data.version.clone())
        .filter(|version| !version.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let source_tarball = format!("{}-{}.src.tar.gz", context.package_name, version);
    let mut produced_packages: Vec<String> = Vec::new();
    match std::fs::read_dir(&pkg_dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if file_name.contains(".pkg.tar") && !file_name.ends_with(".log") {
                    produced_packages.push(file_name);
                }
            }
        }
        Err(e) => return Err(format!("unable to inspect package directory: {}", e)),
    }
    produced_packages.sort();
    let mut missing: Vec<String> = Vec::new();
    if !pkg_dir.join(&source_tarball).is_file() {
        missing.push(source_tarball.clone());
    }
    if produced_packages.is_empty() {
        missing.push(format!(
            "{}-{}-{}.pkg.tar.zst",
            context.package_name, version, preparation.target_arch
        ));
    }
    if !missing.is_empty() {
        return Err(format!(
            "not all expected packages exist after the build: missing {}",
            missing.join(", ")
        ));
    }

    // auto-staging: packages whose previous version provided libraries
    // that dependents still need must go to the staging repository
    let mut staging_needed = false;
    if context.auto_staging {
        let config = setup.config.read().await;
        for produced in &produced_packages {
            let Ok((produced_name, _, _)) = file_name_components(produced) else {
                continue;
            };
            let Some(destination_id) =
                config.find_database(&preparation.target_db, &preparation.target_arch)
            else {
                continue;
            };
            let destination = config.database_by_id(destination_id).expect("resolved id");
            let Some(previous) = destination.packages.get(produced_name) else {
                continue;
            };
            for library in &previous.libprovides {
                for dependent in config.find_packages_providing_library(library, true) {
                    let dependent_db = match dependent.db {
                        crate::database::DatabaseHandle::Live(id) => config
                            .database_by_id(id)
                            .map(|db| db.name.clone())
                            .unwrap_or_default(),
                        crate::database::DatabaseHandle::Info(info) => info.name,
                    };
                    if dependent.pkg.name == produced_name {
                        continue;
                    }
                    staging_needed = true;
                    progress
                        .rebuild_list
                        .entry(dependent_db)
                        .or_default()
                        .entry(dependent.pkg.name.clone())
                        .or_default()
                        .libprovides
                        .push(library.as_str().to_string());
                }
            }
        }
        for rebuild_packages in progress.rebuild_list.values_mut() {
            for info in rebuild_packages.values_mut() {
                info.libprovides.sort();
                info.libprovides.dedup();
            }
        }
    }

    // place the artefacts in the repository tree and register them
    let (repo_dir, db_name) = if staging_needed {
        if context.staging_repo_dir.as_os_str().is_empty() {
            return Err("staging is needed but the staging repository has no package directory".to_string());
        }
        (context.staging_repo_dir, preparation.staging_db.as_str())
    } else {
        (context.destination_repo_dir, preparation.target_db.as_str())
    };
    progress
        .progress_by_package
        .entry(context.package_name.to_string())
        .or_default()
        .staging_needed = staging_needed;

    let src_repo_dir = repo_dir
        .parent()
        .map(|parent| parent.join("src"))
        .unwrap_or_else(|| repo_dir.join("src"));
    if let Err(e) = std::fs::create_dir_all(&src_repo_dir) {
        return Err(format!("unable to create source repository directory: {}", e));
    }
    if let Err(e) = std::fs::copy(pkg_dir.join(&source_tarball), src_repo_dir.join(&source_tarball))
    {
        return Err(format!("unable to copy source tarball: {}", e));
    }
    for produced in &produced_packages {
        if let Err(e) = std::fs::copy(pkg_dir.join(produced), repo_dir.join(produced)) {
            return Err(format!("unable to copy \"{}\": {}", produced, e));
        }
    }

    let mut repo_add_command = Command::new(context.repo_add_path);
    repo_add_command
        .arg(format!("{}.db.tar.zst", db_name))
        .args(&produced_packages)
        .current_dir(repo_dir);
    let repo_add_process = BuildProcess::new("repo-add", pkg_dir.join("repo-add.log"));
    let repo_add_result = repo_add_process.run(action, repo_add_command).await;
    if !repo_add_result.succeeded() {
        return Err(format!(
            "unable to add packages to repo: {}",
            repo_add_result.failure_reason("repo-add")
        ));
    }

    info!(
        "built {} and added {} artefacts to {}",
        context.package_name,
        produced_packages.len(),
        db_name
    );
    Ok(())
}

/// Keep the chroot working copy of a failed build for investigation
fn save_chroot_working_copy(chroot_dir: &Path, arch: &str, chroot_user: &str, package_name: &str) {
    let working_copy = chroot_dir.join(format!("arch-{}", arch)).join(chroot_user);
    if !working_copy.exists() {
        return;
    }
    let saved = chroot_dir
        .join(format!("arch-{}", arch))
        .join(format!("{}-failed-{}", chroot_user, package_name));
    if let Err(e) = std::fs::rename(&working_copy, &saved) {
        warn!("unable to save chroot working copy: {}", e);
    }
}

async fn persist_progress(action_dir: &Path, progress: &BuildProgress) {
    match serde_json::to_vec_pretty(progress) {
        Ok(data) => {
            if let Err(e) = tokio::fs::write(action_dir.join("build-progress.json"), data).await {
                warn!("unable to persist build progress: {}", e);
            }
        }
        Err(e) => warn!("unable to serialize build progress: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_progress_covers_all_batches() {
        let preparation = BuildPreparation {
            batches: vec![
                vec!["mingw-w64-gcc".to_string(), "zstd".to_string()],
                vec!["boost".to_string()],
            ],
            ..Default::default()
        };
        let progress = BuildProgress::initial(&preparation);
        assert_eq!(progress.progress_by_package.len(), 3);
        assert!(progress.progress_by_package.contains_key("boost"));
        assert!(!progress.progress_by_package["boost"].added_to_repo);
    }

    #[test]
    fn test_progress_serde_round_trip() {
        let mut progress = BuildProgress::default();
        progress.progress_by_package.insert(
            "boost".to_string(),
            PackageBuildProgress {
                finished: Some(Utc::now()),
                error: String::new(),
                added_to_repo: true,
                staging_needed: true,
                updated_version: "1.73.0-2".to_string(),
            },
        );
        progress
            .rebuild_list
            .entry("misc".to_string())
            .or_default()
            .insert(
                "source-highlight".to_string(),
                RebuildInfo {
                    libprovides: vec!["elf-x86_64::libboost_regex.so.1.72.0".to_string()],
                },
            );

        let encoded = serde_json::to_string(&progress).unwrap();
        let decoded: BuildProgress = serde_json::from_str(&encoded).unwrap();
        assert_eq!(progress, decoded);
    }
}
