// src/dependencies/mod.rs

//! Dependency and library denotations
//!
//! A dependency is a package name with an optional version constraint,
//! written `name<op>version` (e.g. `glibc>=2.34`). A library denotation is
//! an ABI-tagged soname string, written `<abi>::<soname>`
//! (e.g. `elf-x86_64::libfoo.so.1`).

use crate::version::PackageVersion;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Version constraint operators for dependencies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyOp {
    /// No constraint; any version is acceptable
    #[default]
    Any,
    Equal,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
}

impl fmt::Display for DependencyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DependencyOp::Any => "",
            DependencyOp::Equal => "=",
            DependencyOp::LessThan => "<",
            DependencyOp::LessEqual => "<=",
            DependencyOp::GreaterThan => ">",
            DependencyOp::GreaterEqual => ">=",
        };
        write!(f, "{}", s)
    }
}

/// Whether a dependency is matched by name and version or by name alone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyMode {
    #[default]
    Any,
    NameOnly,
}

/// A package dependency: name plus optional version constraint
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub op: DependencyOp,
    pub version: Option<PackageVersion>,
    pub description: Option<String>,
    pub mode: DependencyMode,
}

impl Dependency {
    pub fn from_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn exact(name: impl Into<String>, version: PackageVersion) -> Self {
        Self {
            name: name.into(),
            op: DependencyOp::Equal,
            version: Some(version),
            ..Default::default()
        }
    }

    /// Parse a dependency denotation like `glibc>=2.34` or `zlib`
    ///
    /// An optional description may follow after `: ` (the optdepend form
    /// `python: for scripts`).
    pub fn parse(denotation: &str) -> Self {
        let denotation = denotation.trim();

        // split off the optdepend description
        let (spec, description) = match denotation.split_once(": ") {
            Some((s, d)) => (s.trim(), Some(d.trim().to_string())),
            None => (denotation, None),
        };

        let (name, op, version) = match spec.find(['<', '>', '=']) {
            Some(pos) => {
                let name = &spec[..pos];
                let rest = &spec[pos..];
                let (op, ver_str) = if let Some(v) = rest.strip_prefix(">=") {
                    (DependencyOp::GreaterEqual, v)
                } else if let Some(v) = rest.strip_prefix("<=") {
                    (DependencyOp::LessEqual, v)
                } else if let Some(v) = rest.strip_prefix('>') {
                    (DependencyOp::GreaterThan, v)
                } else if let Some(v) = rest.strip_prefix('<') {
                    (DependencyOp::LessThan, v)
                } else {
                    (DependencyOp::Equal, rest.trim_start_matches('='))
                };
                match PackageVersion::parse(ver_str.trim()) {
                    Ok(version) => (name, op, Some(version)),
                    // a malformed constraint degrades to a name-only match
                    Err(_) => (name, DependencyOp::Any, None),
                }
            }
            None => (spec, DependencyOp::Any, None),
        };

        Self {
            name: name.trim().to_string(),
            op,
            version,
            description,
            mode: DependencyMode::Any,
        }
    }

    /// Whether a concrete version satisfies this dependency's constraint
    ///
    /// A versionless candidate (e.g. an unversioned provide) only satisfies
    /// unconstrained dependencies.
    pub fn satisfied_by(&self, version: Option<&PackageVersion>) -> bool {
        if self.mode == DependencyMode::NameOnly || self.op == DependencyOp::Any {
            return true;
        }
        let (constraint, candidate) = match (&self.version, version) {
            (Some(c), Some(v)) => (c, v),
            _ => return false,
        };
        let ord = candidate.compare(constraint);
        match self.op {
            DependencyOp::Any => true,
            DependencyOp::Equal => ord == std::cmp::Ordering::Equal,
            DependencyOp::LessThan => ord == std::cmp::Ordering::Less,
            DependencyOp::LessEqual => ord != std::cmp::Ordering::Greater,
            DependencyOp::GreaterThan => ord == std::cmp::Ordering::Greater,
            DependencyOp::GreaterEqual => ord != std::cmp::Ordering::Less,
        }
    }

    /// Whether two dependencies match: names equal and this constraint
    /// admits the other's version
    pub fn matches(&self, other: &Dependency) -> bool {
        self.name == other.name && self.satisfied_by(other.version.as_ref())
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let (op, Some(version)) = (self.op, &self.version) {
            if op != DependencyOp::Any {
                write!(f, "{}{}", op, version)?;
            }
        }
        Ok(())
    }
}

/// An ABI-tagged shared-library identifier, e.g. `elf-x86_64::libz.so.1`
///
/// Compared by byte equality; the part before `::` tags the binary format
/// and machine, the part after is the soname or DLL name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LibraryId(pub String);

impl LibraryId {
    pub fn new(format: &str, machine: &str, name: &str) -> Self {
        LibraryId(format!("{}-{}::{}", format, machine, name))
    }

    pub fn elf(machine: &str, soname: &str) -> Self {
        Self::new("elf", machine, soname)
    }

    pub fn pe(machine: &str, dll: &str) -> Self {
        Self::new("pe", machine, dll)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LibraryId {
    fn from(s: &str) -> Self {
        LibraryId(s.to_string())
    }
}

impl From<String> for LibraryId {
    fn from(s: String) -> Self {
        LibraryId(s)
    }
}

/// One concrete provided/required version of a dependency name within a
/// [`DependencySet`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDetail {
    pub version: Option<PackageVersion>,
    pub op: DependencyOp,
    pub mode: DependencyMode,
    /// Names of the packages this entry originates from
    pub relevant_packages: BTreeSet<String>,
}

/// An inverted index from dependency name to the concrete versions known
/// under that name and the packages they belong to
///
/// Used both for a database's provided/required dependencies and for
/// accumulating missing dependencies during closure computation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySet {
    entries: HashMap<String, Vec<DependencyDetail>>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `package` provides/requires `dependency`
    pub fn add(&mut self, dependency: &Dependency, package: &str) {
        let details = self.entries.entry(dependency.name.clone()).or_default();
        if let Some(detail) = details
            .iter_mut()
            .find(|d| d.version == dependency.version && d.op == dependency.op)
        {
            detail.relevant_packages.insert(package.to_string());
            return;
        }
        details.push(DependencyDetail {
            version: dependency.version.clone(),
            op: dependency.op,
            mode: dependency.mode,
            relevant_packages: BTreeSet::from([package.to_string()]),
        });
    }

    /// Remove all of `package`'s entries under `name`; drops the name when
    /// no package references it anymore
    pub fn remove(&mut self, name: &str, package: &str) {
        if let Some(details) = self.entries.get_mut(name) {
            for detail in details.iter_mut() {
                detail.relevant_packages.remove(package);
            }
            details.retain(|d| !d.relevant_packages.is_empty());
            if details.is_empty() {
                self.entries.remove(name);
            }
        }
    }

    /// Whether any recorded entry satisfies the given dependency
    pub fn provides(&self, dependency: &Dependency) -> bool {
        self.entries
            .get(&dependency.name)
            .map(|details| {
                details
                    .iter()
                    .any(|d| dependency.satisfied_by(d.version.as_ref()))
            })
            .unwrap_or(false)
    }

    /// Names of the packages whose entry under `dependency` matches it
    pub fn packages_matching(&self, dependency: &Dependency) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(details) = self.entries.get(&dependency.name) {
            for detail in details {
                if dependency.satisfied_by(detail.version.as_ref()) {
                    names.extend(detail.relevant_packages.iter().cloned());
                }
            }
        }
        names.sort();
        names.dedup();
        names
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<DependencyDetail>)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_name() {
        let dep = Dependency::parse("zlib");
        assert_eq!(dep.name, "zlib");
        assert_eq!(dep.op, DependencyOp::Any);
        assert_eq!(dep.version, None);
    }

    #[test]
    fn test_parse_constraint() {
        let dep = Dependency::parse("glibc>=2.34");
        assert_eq!(dep.name, "glibc");
        assert_eq!(dep.op, DependencyOp::GreaterEqual);
        assert_eq!(dep.version, Some(PackageVersion::parse("2.34").unwrap()));
    }

    #[test]
    fn test_parse_exact() {
        let dep = Dependency::parse("boost-libs=1.73.0-1");
        assert_eq!(dep.op, DependencyOp::Equal);
        assert_eq!(dep.version.unwrap().pkgrel, "1");
    }

    #[test]
    fn test_parse_optdepend_description() {
        let dep = Dependency::parse("python: for scripts");
        assert_eq!(dep.name, "python");
        assert_eq!(dep.description.as_deref(), Some("for scripts"));
    }

    #[test]
    fn test_satisfied_by() {
        let dep = Dependency::parse("icu>=67");
        assert!(dep.satisfied_by(Some(&PackageVersion::parse("67.1-1").unwrap())));
        assert!(!dep.satisfied_by(Some(&PackageVersion::parse("66.2-1").unwrap())));
        assert!(!dep.satisfied_by(None));
    }

    #[test]
    fn test_unconstrained_satisfied_by_anything() {
        let dep = Dependency::from_name("zlib");
        assert!(dep.satisfied_by(None));
        assert!(dep.satisfied_by(Some(&PackageVersion::parse("1.0").unwrap())));
    }

    #[test]
    fn test_matches() {
        let required = Dependency::parse("boost>=1.72");
        let provided = Dependency::exact("boost", PackageVersion::parse("1.73.0-1").unwrap());
        assert!(required.matches(&provided));

        let older = Dependency::exact("boost", PackageVersion::parse("1.71.0-1").unwrap());
        assert!(!required.matches(&older));
    }

    #[test]
    fn test_display_round_trip() {
        for denotation in ["zlib", "glibc>=2.34", "icu<68"] {
            assert_eq!(Dependency::parse(denotation).to_string(), denotation);
        }
    }

    #[test]
    fn test_library_id_format() {
        assert_eq!(
            LibraryId::elf("x86_64", "libz.so.1").as_str(),
            "elf-x86_64::libz.so.1"
        );
        assert_eq!(
            LibraryId::pe("i386", "libgcc_s_sjlj-1.dll").as_str(),
            "pe-i386::libgcc_s_sjlj-1.dll"
        );
    }

    #[test]
    fn test_dependency_set_add_remove() {
        let mut set = DependencySet::new();
        let provide = Dependency::exact("libfoo", PackageVersion::parse("1.0-1").unwrap());
        set.add(&provide, "foo");
        set.add(&provide, "foo-git");

        assert!(set.provides(&Dependency::parse("libfoo>=0.9")));
        assert_eq!(
            set.packages_matching(&Dependency::parse("libfoo")),
            vec!["foo".to_string(), "foo-git".to_string()]
        );

        set.remove("libfoo", "foo");
        assert!(set.provides(&Dependency::parse("libfoo")));
        set.remove("libfoo", "foo-git");
        assert!(!set.contains_name("libfoo"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_dependency_set_versioned_provide_required() {
        let mut set = DependencySet::new();
        let unversioned = Dependency::from_name("libbar");
        set.add(&unversioned, "bar");

        // an unversioned provide does not satisfy a versioned requirement
        assert!(!set.provides(&Dependency::parse("libbar>=2")));
        assert!(set.provides(&Dependency::parse("libbar")));
    }
}
