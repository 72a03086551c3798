// src/packages/mod.rs

//! Package data model
//!
//! A [`Package`] aggregates everything known about one package: the fields
//! from the repository database, the dependency/provide lists, and the
//! ABI-tagged library sets scraped from the binary package contents. The
//! `origin` field records which of those sources produced the entry.

pub mod archive;
pub mod binaries;
pub mod pkginfo;

use crate::dependencies::{Dependency, LibraryId};
use crate::error::{Error, Result};
use crate::version::PackageVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Where the information in a [`Package`] entry came from
///
/// Later origins carry strictly more information: a file name only yields
/// name/version/arch, a database file adds the full metadata, and the
/// package contents add the library sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PackageOrigin {
    #[default]
    PackageFileName,
    DatabaseFile,
    PackageContents,
}

/// Metadata specific to a binary package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub arch: String,
    pub build_date: Option<DateTime<Utc>>,
    pub packager: String,
    pub file_name: String,
    pub size: u64,
}

/// Metadata specific to a source package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub archs: BTreeSet<String>,
    pub make_deps: Vec<Dependency>,
    pub check_deps: Vec<Dependency>,
}

/// Metadata only known for installed packages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallInfo {
    pub installed_size: u64,
}

/// A single package with all information aggregated so far
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: PackageVersion,
    pub description: String,
    pub upstream_url: String,
    pub licenses: Vec<String>,
    pub groups: Vec<String>,
    pub deps: Vec<Dependency>,
    pub optdeps: Vec<Dependency>,
    pub conflicts: Vec<Dependency>,
    pub provides: Vec<Dependency>,
    pub replaces: Vec<Dependency>,
    /// Libraries this package ships; only populated when
    /// `origin == PackageContents`
    pub libprovides: BTreeSet<LibraryId>,
    /// Libraries this package links against; only populated when
    /// `origin == PackageContents`
    pub libdepends: BTreeSet<LibraryId>,
    pub package_info: Option<PackageInfo>,
    pub source_info: Option<SourceInfo>,
    pub install_info: Option<InstallInfo>,
    pub origin: PackageOrigin,
    /// Modification time of the binary archive the library sets were
    /// scraped from
    pub timestamp: Option<DateTime<Utc>>,
}

impl Package {
    /// Construct a package from a binary package file name like
    /// `boost-1.73.0-1-x86_64.pkg.tar.zst`
    pub fn from_pkg_file_name(file_name: &str) -> Result<Package> {
        let (name, version, arch) = file_name_components(file_name)?;
        Ok(Package {
            name: name.to_string(),
            version: PackageVersion::parse(version)?,
            package_info: Some(PackageInfo {
                arch: arch.to_string(),
                file_name: file_name.to_string(),
                ..Default::default()
            }),
            origin: PackageOrigin::PackageFileName,
            ..Default::default()
        })
    }

    /// The binary package file name: the recorded one if present, a
    /// `name-version-arch.pkg.tar.zst` guess otherwise
    pub fn compute_file_name(&self) -> String {
        if let Some(info) = &self.package_info {
            if !info.file_name.is_empty() {
                return info.file_name.clone();
            }
        }
        let arch = self
            .package_info
            .as_ref()
            .map(|i| i.arch.as_str())
            .unwrap_or("any");
        format!("{}-{}-{}.pkg.tar.zst", self.name, self.version, arch)
    }

    /// Whether this package satisfies `dependency` via its own name or one
    /// of its provides
    pub fn provides_dependency(&self, dependency: &Dependency) -> bool {
        if dependency.name == self.name && dependency.satisfied_by(Some(&self.version)) {
            return true;
        }
        self.provides.iter().any(|p| dependency.matches(p))
    }

    /// Runtime plus (optionally) build-side dependencies
    pub fn dependencies(&self, with_build_deps: bool) -> Vec<&Dependency> {
        let mut deps: Vec<&Dependency> = self.deps.iter().collect();
        if with_build_deps {
            if let Some(source_info) = &self.source_info {
                deps.extend(source_info.make_deps.iter());
                deps.extend(source_info.check_deps.iter());
            }
        }
        deps
    }

    /// Carry the contents-derived fields of `other` forward into this entry
    ///
    /// Succeeds only when `other` was actually parsed from package contents
    /// and still describes the same build (same version, same build date).
    /// Returns whether the merge happened.
    pub fn add_deps_and_provides_from_other_package(&mut self, other: &Package) -> bool {
        if other.origin != PackageOrigin::PackageContents
            || self.name != other.name
            || self.version != other.version
        {
            return false;
        }
        if let (Some(own_info), Some(other_info)) = (&self.package_info, &other.package_info) {
            // build dates only disagree when both sides know one
            if own_info.build_date.is_some()
                && other_info.build_date.is_some()
                && own_info.build_date != other_info.build_date
            {
                return false;
            }
        }
        self.libprovides = other.libprovides.clone();
        self.libdepends = other.libdepends.clone();
        if let Some(other_source) = &other.source_info {
            let source_info = self.source_info.get_or_insert_with(Default::default);
            if !other_source.make_deps.is_empty() {
                source_info.make_deps = other_source.make_deps.clone();
            }
            if !other_source.check_deps.is_empty() {
                source_info.check_deps = other_source.check_deps.clone();
            }
        }
        if other.timestamp.is_some() {
            self.timestamp = other.timestamp;
        }
        self.origin = PackageOrigin::PackageContents;
        true
    }

    /// Archive-walk filter: `.PKGINFO` at the archive root plus anything
    /// that could be an ELF/PE binary or an import library
    pub fn is_pkg_info_file_or_binary(directory: &str, name: &str, mode: u32) -> bool {
        if directory.is_empty() && name == ".PKGINFO" {
            return true;
        }
        name.contains(".so")
            || name.ends_with(".dll")
            || name.ends_with(".exe")
            || name.ends_with(".a")
            || mode & 0o111 != 0
    }
}

/// Split a package file name into its `(name, version, arch)` components
///
/// `version` covers `[epoch:]pkgver-pkgrel`; the extension may be any
/// `.pkg.tar.*` or `.src.tar.*` variant.
pub fn file_name_components(file_name: &str) -> Result<(&str, &str, &str)> {
    let stem = [".pkg.tar", ".src.tar"]
        .iter()
        .find_map(|marker| file_name.find(marker).map(|pos| &file_name[..pos]))
        .ok_or_else(|| {
            Error::Parse(format!(
                "\"{}\" does not look like a package file name",
                file_name
            ))
        })?;

    // components from the right: arch, pkgrel, pkgver; the rest is the name
    let arch_sep = stem
        .rfind('-')
        .ok_or_else(|| Error::Parse(format!("missing arch in \"{}\"", file_name)))?;
    let arch = &stem[arch_sep + 1..];
    let rest = &stem[..arch_sep];
    let pkgrel_sep = rest
        .rfind('-')
        .ok_or_else(|| Error::Parse(format!("missing pkgrel in \"{}\"", file_name)))?;
    let rest = &rest[..pkgrel_sep];
    let pkgver_sep = rest
        .rfind('-')
        .ok_or_else(|| Error::Parse(format!("missing pkgver in \"{}\"", file_name)))?;
    let name = &rest[..pkgver_sep];
    let version = &stem[pkgver_sep + 1..arch_sep];

    if name.is_empty() || version.is_empty() || arch.is_empty() {
        return Err(Error::Parse(format!(
            "empty component in package file name \"{}\"",
            file_name
        )));
    }
    Ok((name, version, arch))
}
