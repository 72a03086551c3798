// src/config/license.rs

//! License aggregation over package closures
//!
//! Collects the license identifiers of the requested packages and their
//! runtime dependency closure, sorting them into well-known common
//! licenses and custom ones.

use crate::config::Config;
use crate::database::DatabaseHandle;
use crate::dependencies::{Dependency, DependencySet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// A license file belonging to a package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseFile {
    pub filename: String,
    pub content: String,
}

/// One well-known license and the packages using it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonLicense {
    pub relevant_packages: BTreeSet<String>,
    pub files: Vec<LicenseFile>,
}

/// Result of [`Config::compute_license_info`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseResult {
    pub common_licenses: BTreeMap<String, CommonLicense>,
    pub custom_licenses: BTreeMap<String, Vec<LicenseFile>>,
    pub considered_packages: Vec<String>,
    pub ignored_packages: Vec<String>,
    pub notes: Vec<String>,
    pub license_summary: String,
    pub success: bool,
}

/// Prefixes of license identifiers with a canonical upstream text
const COMMON_LICENSE_PREFIXES: [&str; 10] = [
    "AGPL", "Apache", "BSD", "Boost", "GPL", "LGPL", "MIT", "MPL", "PSF", "Zlib",
];

fn is_common_license(license: &str) -> bool {
    COMMON_LICENSE_PREFIXES
        .iter()
        .any(|prefix| license.starts_with(prefix))
}

impl Config {
    /// Aggregate the licenses of the denoted packages and their runtime
    /// closure
    pub fn compute_license_info(&self, denotations: &[String]) -> LicenseResult {
        let mut result = LicenseResult {
            success: true,
            ..Default::default()
        };

        // expand the denotations to the full runtime closure
        let relevant_dbs: HashSet<_> = (0..self.databases.len()).collect();
        let mut closure = HashSet::new();
        let mut missing = DependencySet::new();
        let mut seeds = Vec::new();
        for denotation in denotations {
            let dependency = Dependency::parse(denotation);
            match self.find_package(&dependency) {
                Some(found) => {
                    if let DatabaseHandle::Live(db_id) = found.db {
                        closure.insert((db_id, found.pkg.name.clone()));
                        self.pull_dependent_packages_of(
                            &found.pkg,
                            &relevant_dbs,
                            &mut closure,
                            &mut missing,
                        );
                    }
                    seeds.push(found.pkg.name.clone());
                }
                None => {
                    result.ignored_packages.push(dependency.name.clone());
                    result.success = false;
                }
            }
        }
        for (name, _) in missing.iter() {
            result
                .notes
                .push(format!("dependency {} could not be resolved", name));
        }

        // aggregate licenses over the closure
        let mut ordered: Vec<&(usize, String)> = closure.iter().collect();
        ordered.sort();
        for (db_id, package_name) in ordered {
            let Some(package) = self
                .database_by_id(*db_id)
                .and_then(|db| db.packages.get(package_name))
            else {
                continue;
            };
            result.considered_packages.push(package.name.clone());
            if package.licenses.is_empty() {
                result
                    .notes
                    .push(format!("package {} has no license metadata", package.name));
                continue;
            }
            for license in &package.licenses {
                if is_common_license(license) {
                    result
                        .common_licenses
                        .entry(license.clone())
                        .or_default()
                        .relevant_packages
                        .insert(package.name.clone());
                } else {
                    result.custom_licenses.entry(license.clone()).or_default();
                }
            }
        }
        result.considered_packages.sort();
        result.considered_packages.dedup();

        let mut summary: Vec<String> = result.common_licenses.keys().cloned().collect();
        summary.extend(result.custom_licenses.keys().cloned());
        result.license_summary = summary.join(", ");
        result
    }
}
