// src/actions/prepare_build.rs

//! Prepare-build action
//!
//! Resolves the requested packages to a build order split into batches,
//! stages a PKGBUILD for every package under the action directory and
//! persists `build-preparation.json`/`build-progress.json` for the
//! conduct-build action to pick up.

use crate::actions::conduct_build::BuildProgress;
use crate::actions::meta::{prepare_flags, settings};
use crate::actions::{
    resolve_database_denotations, ActionHandle, BuildActionResult, BuildActionResultData,
    ServiceSetup,
};
use crate::config::{build_order::compute_batches, BuildOrderOptions};
use crate::database::DatabaseHandle;
use crate::version::PackageVersion;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Per-package data recorded by the preparation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageBuildData {
    /// Directory holding the staged `src/PKGBUILD`
    pub source_directory: PathBuf,
    /// Version after any pkgrel bump
    pub version: String,
    pub arch: String,
}

/// The outcome of a build preparation, persisted as
/// `build-preparation.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildPreparation {
    pub target_db: String,
    pub target_arch: String,
    pub staging_db: String,
    /// Database configuration for the build, in dependency order: name
    /// plus mirrors
    pub db_config: Vec<(String, Vec<String>)>,
    pub staging_db_config: Vec<(String, Vec<String>)>,
    pub batches: Vec<Vec<String>>,
    pub cyclic_leftovers: Vec<String>,
    pub build_data: HashMap<String, PackageBuildData>,
    pub warnings: Vec<String>,
    pub error: String,
    pub manually_ordered: bool,
}

pub async fn run(setup: &Arc<ServiceSetup>, action: &Arc<ActionHandle>) {
    let (flags, destination_denotations, package_names, pkgbuilds_setting, directory) = {
        let data = action.lock();
        (
            data.flags,
            data.destination_dbs.clone(),
            data.package_names.clone(),
            data.settings.get(settings::PKGBUILDS_DIRS).cloned(),
            data.directory.clone(),
        )
    };
    if destination_denotations.len() != 1 {
        action
            .report_error(setup, "not exactly one destination database specified")
            .await;
        return;
    }
    if package_names.is_empty() {
        action.report_error(setup, "no packages specified").await;
        return;
    }
    if directory.is_empty() {
        action.report_error(setup, "no directory specified").await;
        return;
    }

    let force_bump = flags & prepare_flags::FORCE_BUMP_PKGREL != 0;
    let clean_src_dir = flags & prepare_flags::CLEAN_SRC_DIR != 0;
    let keep_order = flags & prepare_flags::KEEP_ORDER != 0;
    let keep_pkgrel_and_epoch = flags & prepare_flags::KEEP_PKGREL_AND_EPOCH != 0;

    // PKGBUILD directories from the setting take precedence over the
    // globally configured ones
    let mut pkgbuilds_dirs: Vec<PathBuf> = pkgbuilds_setting
        .map(|value| value.split(':').map(PathBuf::from).collect())
        .unwrap_or_default();
    {
        let building = setup.building.read().await;
        pkgbuilds_dirs.extend(building.pkgbuilds_dirs.iter().cloned());
    }

    let mut preparation = BuildPreparation {
        manually_ordered: keep_order,
        ..Default::default()
    };
    let mut ordered_packages: Vec<String> = Vec::new();
    {
        let config = setup.config.read().await;
        let destination_id = match resolve_database_denotations(&config, &destination_denotations)
        {
            Ok(ids) => ids[0],
            Err(error) => {
                drop(config);
                action.report_error(setup, error).await;
                return;
            }
        };
        let destination = config.database_by_id(destination_id).expect("resolved id");
        preparation.target_db = destination.name.clone();
        preparation.target_arch = destination.arch.clone();
        preparation.staging_db = format!("{}-staging", destination.name);

        // database configuration in dependency order, staging first for
        // the staging variant
        match config.compute_database_dependency_order(destination_id) {
            Ok(order) => {
                for db_id in order.into_iter().rev() {
                    let db = config.database_by_id(db_id).expect("ordered id");
                    preparation
                        .db_config
                        .push((db.name.clone(), db.mirrors.clone()));
                }
            }
            Err(error) => {
                preparation
                    .warnings
                    .push(format!("unable to order databases: {}", error));
                preparation
                    .db_config
                    .push((destination.name.clone(), destination.mirrors.clone()));
            }
        }
        let staging_mirrors = config
            .find_database(&preparation.staging_db, &preparation.target_arch)
            .and_then(|id| config.database_by_id(id))
            .map(|db| db.mirrors.clone())
            .unwrap_or_default();
        preparation.staging_db_config =
            std::iter::once((preparation.staging_db.clone(), staging_mirrors))
                .chain(preparation.db_config.iter().cloned())
                .collect();

        // compute the build order unless the caller fixed it
        if keep_order {
            ordered_packages = package_names.clone();
        } else {
            let options = BuildOrderOptions::INCLUDE_SOURCE_ONLY_DEPENDENCIES
                | BuildOrderOptions::CONSIDER_BUILD_DEPENDENCIES;
            let order_result = config.compute_build_order(
                &package_names,
                options,
                &std::collections::HashSet::from([destination_id]),
            );
            for ignored in &order_result.ignored {
                preparation
                    .warnings
                    .push(format!("unable to resolve \"{}\"", ignored));
            }
            if !order_result.cycle.is_empty() {
                preparation.cyclic_leftovers = order_result
                    .cycle
                    .iter()
                    .map(|entry| entry.pkg.name.clone())
                    .collect();
                preparation.warnings.push(format!(
                    "cyclic dependencies left over: {}",
                    preparation.cyclic_leftovers.join(" -> ")
                ));
            }
            ordered_packages = order_result
                .order
                .iter()
                .map(|entry| entry.pkg.name.clone())
                .collect();
            preparation.batches = compute_batches(&order_result.order, options);
            for entry in &order_result.order {
                if let DatabaseHandle::Live(db_id) = entry.db {
                    let arch = config
                        .database_by_id(db_id)
                        .map(|db| db.arch.clone())
                        .unwrap_or_default();
                    preparation.build_data.insert(
                        entry.pkg.name.clone(),
                        PackageBuildData {
                            version: entry.pkg.version.to_string(),
                            arch,
                            ..Default::default()
                        },
                    );
                }
            }
        }
        if keep_order {
            preparation.batches = vec![ordered_packages.clone()];
            for name in &ordered_packages {
                preparation
                    .build_data
                    .insert(name.clone(), PackageBuildData::default());
            }
        }

        // remember the existing versions for the pkgrel bump decision
        for name in &ordered_packages {
            if let Some(existing) = destination.packages.get(name) {
                if let Some(build_data) = preparation.build_data.get_mut(name) {
                    if build_data.version.is_empty() {
                        build_data.version = existing.version.to_string();
                    }
                }
            }
        }
    }

    // stage a PKGBUILD for every package of the order
    let action_dir = setup.building.read().await.build_data_dir().join(&directory);
    let destination_versions: HashMap<String, PackageVersion> = {
        let config = setup.config.read().await;
        let mut versions = HashMap::new();
        if let Some(id) = config.find_database(&preparation.target_db, &preparation.target_arch) {
            let db = config.database_by_id(id).expect("resolved id");
            for name in &ordered_packages {
                if let Some(package) = db.packages.get(name) {
                    versions.insert(name.clone(), package.version.clone());
                }
            }
        }
        versions
    };
    for package_name in &ordered_packages {
        if action.report_aborted_if_aborted(setup).await {
            return;
        }
        let src_dir = action_dir.join(package_name).join("src");
        if clean_src_dir && src_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&src_dir).await {
                preparation
                    .warnings
                    .push(format!("{}: unable to clean src directory: {}", package_name, e));
            }
        }
        let Some(pkgbuild_path) = locate_pkgbuild(&pkgbuilds_dirs, package_name) else {
            preparation.error = format!("unable to find PKGBUILD for \"{}\"", package_name);
            break;
        };
        let content = match tokio::fs::read_to_string(&pkgbuild_path).await {
            Ok(content) => content,
            Err(e) => {
                preparation.error =
                    format!("unable to read PKGBUILD for \"{}\": {}", package_name, e);
                break;
            }
        };

        // bump the pkgrel when the destination already has this version
        let pkgbuild_version = pkgbuild_version(&content);
        let needs_bump = !keep_pkgrel_and_epoch
            && (force_bump
                || destination_versions
                    .get(package_name)
                    .map(|existing| {
                        pkgbuild_version
                            .as_ref()
                            .map(|candidate| candidate <= existing)
                            .unwrap_or(false)
                    })
                    .unwrap_or(false));
        let (content, staged_version) = if needs_bump {
            bump_pkgrel(&content)
        } else {
            (content.clone(), pkgbuild_version.map(|v| v.to_string()).unwrap_or_default())
        };

        if let Err(e) = tokio::fs::create_dir_all(&src_dir).await {
            preparation.error = format!("unable to create \"{}\": {}", src_dir.display(), e);
            break;
        }
        if let Err(e) = tokio::fs::write(src_dir.join("PKGBUILD"), content).await {
            preparation.error = format!("unable to stage PKGBUILD for \"{}\": {}", package_name, e);
            break;
        }
        let build_data = preparation.build_data.entry(package_name.clone()).or_default();
        build_data.source_directory = src_dir;
        if !staged_version.is_empty() {
            build_data.version = staged_version;
        }
        debug!("staged PKGBUILD for {}", package_name);
    }

    // persist the preparation and an initial progress file
    if preparation.error.is_empty() {
        if let Err(e) = tokio::fs::create_dir_all(&action_dir).await {
            preparation.error = format!("unable to create action directory: {}", e);
        }
    }
    if preparation.error.is_empty() {
        let progress = BuildProgress::initial(&preparation);
        let write_result = async {
            tokio::fs::write(
                action_dir.join("build-preparation.json"),
                serde_json::to_vec_pretty(&preparation).map_err(|e| e.to_string())?,
            )
            .await
            .map_err(|e| e.to_string())?;
            tokio::fs::write(
                action_dir.join("build-progress.json"),
                serde_json::to_vec_pretty(&progress).map_err(|e| e.to_string())?,
            )
            .await
            .map_err(|e| e.to_string())
        }
        .await;
        if let Err(e) = write_result {
            preparation.error = format!("unable to persist build preparation: {}", e);
        }
    }

    let result = if preparation.error.is_empty() {
        BuildActionResult::Success
    } else {
        BuildActionResult::Failure
    };
    info!(
        "prepared build of {} packages in {} batches for {}",
        ordered_packages.len(),
        preparation.batches.len(),
        preparation.target_db
    );
    action
        .finish(
            setup,
            result,
            BuildActionResultData::BuildPreparation(preparation),
        )
        .await;
}

/// Search the configured PKGBUILD directories for `<package>/PKGBUILD`
fn locate_pkgbuild(pkgbuilds_dirs: &[PathBuf], package_name: &str) -> Option<PathBuf> {
    pkgbuilds_dirs
        .iter()
        .map(|dir| dir.join(package_name).join("PKGBUILD"))
        .find(|candidate| candidate.is_file())
}

/// Extract a simple `key=value` variable assignment from a PKGBUILD
fn pkgbuild_variable(content: &str, key: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let line = line.trim();
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix('='))
            .map(|value| value.trim_matches(['"', '\'']).to_string())
    })
}

/// The full version a PKGBUILD would produce
fn pkgbuild_version(content: &str) -> Option<PackageVersion> {
    let pkgver = pkgbuild_variable(content, "pkgver")?;
    let pkgrel = pkgbuild_variable(content, "pkgrel").unwrap_or_else(|| "1".to_string());
    let epoch = pkgbuild_variable(content, "epoch")
        .and_then(|e| e.parse().ok())
        .unwrap_or(0);
    Some(PackageVersion::new(epoch, pkgver, pkgrel))
}

/// Increment the `pkgrel` assignment, returning the new content and the
/// resulting version string
fn bump_pkgrel(content: &str) -> (String, String) {
    let mut bumped_lines: Vec<String> = Vec::new();
    let mut new_pkgrel = String::new();
    for line in content.lines() {
        if let Some(value) = line.trim().strip_prefix("pkgrel=") {
            let current: u32 = value.trim_matches(['"', '\'']).parse().unwrap_or(0);
            new_pkgrel = (current + 1).to_string();
            bumped_lines.push(format!("pkgrel={}", new_pkgrel));
        } else {
            bumped_lines.push(line.to_string());
        }
    }
    if new_pkgrel.is_empty() {
        new_pkgrel = "2".to_string();
        bumped_lines.push("pkgrel=2".to_string());
    }
    let mut content = bumped_lines.join("\n");
    content.push('\n');
    let version = pkgbuild_version(&content)
        .map(|v| v.to_string())
        .unwrap_or_default();
    (content, version)
}

/// Convenience for tests and callers restoring a persisted preparation
pub async fn restore_build_preparation(action_dir: &Path) -> Result<BuildPreparation, String> {
    let path = action_dir.join("build-preparation.json");
    let data = tokio::fs::read(&path)
        .await
        .map_err(|e| format!("Unable to restore build-preparation.json: {}", e))?;
    serde_json::from_slice(&data)
        .map_err(|e| format!("Unable to restore build-preparation.json: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PKGBUILD: &str = "pkgname=boost\npkgver=1.73.0\npkgrel=1\npkgdesc=\"Free peer-reviewed portable C++ source libraries\"\n";

    #[test]
    fn test_pkgbuild_version() {
        let version = pkgbuild_version(SAMPLE_PKGBUILD).unwrap();
        assert_eq!(version, PackageVersion::parse("1.73.0-1").unwrap());
    }

    #[test]
    fn test_pkgbuild_version_with_epoch() {
        let content = "pkgname=zlib\nepoch=1\npkgver=1.2.11\npkgrel=4\n";
        let version = pkgbuild_version(content).unwrap();
        assert_eq!(version, PackageVersion::parse("1:1.2.11-4").unwrap());
    }

    #[test]
    fn test_bump_pkgrel() {
        let (bumped, version) = bump_pkgrel(SAMPLE_PKGBUILD);
        assert!(bumped.contains("pkgrel=2"));
        assert!(!bumped.contains("pkgrel=1"));
        assert_eq!(version, "1.73.0-2");
    }

    #[test]
    fn test_bump_pkgrel_missing_assignment() {
        let (bumped, version) = bump_pkgrel("pkgname=x\npkgver=1.0\n");
        assert!(bumped.contains("pkgrel=2"));
        assert_eq!(version, "1.0-2");
    }

    #[test]
    fn test_locate_pkgbuild() {
        let dir = tempfile::tempdir().unwrap();
        let boost_dir = dir.path().join("boost");
        std::fs::create_dir_all(&boost_dir).unwrap();
        std::fs::write(boost_dir.join("PKGBUILD"), SAMPLE_PKGBUILD).unwrap();

        let dirs = vec![dir.path().to_path_buf()];
        assert!(locate_pkgbuild(&dirs, "boost").is_some());
        assert!(locate_pkgbuild(&dirs, "zstd").is_none());
    }
}
