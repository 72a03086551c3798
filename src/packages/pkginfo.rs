// src/packages/pkginfo.rs

//! `.PKGINFO` parsing
//!
//! Every binary package archive carries a `.PKGINFO` file at its root with
//! `key = value` lines; repeated keys accumulate into list fields.

use crate::dependencies::Dependency;
use crate::packages::{Package, PackageInfo, SourceInfo};
use crate::version::PackageVersion;
use chrono::{DateTime, Utc};
use tracing::debug;

impl Package {
    /// Merge the fields of a `.PKGINFO` file into this package
    ///
    /// Pre-populated fields (name, version) are overwritten by the file's
    /// values; the caller compares against its expectations afterwards.
    pub fn add_info_from_pkginfo_file(&mut self, content: &str) {
        let package_info = self.package_info.get_or_insert_with(PackageInfo::default);

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "pkgname" => self.name = value.to_string(),
                "pkgver" => {
                    if let Ok(version) = PackageVersion::parse(value) {
                        self.version = version;
                    }
                }
                "pkgdesc" => self.description = value.to_string(),
                "url" => self.upstream_url = value.to_string(),
                "builddate" => package_info.build_date = parse_build_date(value),
                "packager" => package_info.packager = value.to_string(),
                "size" => {
                    if let Ok(size) = value.parse() {
                        self.install_info.get_or_insert_with(Default::default).installed_size = size;
                    }
                }
                "arch" => {
                    package_info.arch = value.to_string();
                    self.source_info
                        .get_or_insert_with(SourceInfo::default)
                        .archs
                        .insert(value.to_string());
                }
                "license" => self.licenses.push(value.to_string()),
                "group" => self.groups.push(value.to_string()),
                "depend" => self.deps.push(Dependency::parse(value)),
                "optdepend" => self.optdeps.push(Dependency::parse(value)),
                "makedepend" => self
                    .source_info
                    .get_or_insert_with(SourceInfo::default)
                    .make_deps
                    .push(Dependency::parse(value)),
                "checkdepend" => self
                    .source_info
                    .get_or_insert_with(SourceInfo::default)
                    .check_deps
                    .push(Dependency::parse(value)),
                "conflict" => self.conflicts.push(Dependency::parse(value)),
                "provides" => self.provides.push(Dependency::parse(value)),
                "replaces" => self.replaces.push(Dependency::parse(value)),
                _ => {}
            }
        }

        debug!(
            "parsed .PKGINFO for {} {} ({} deps, {} provides)",
            self.name,
            self.version,
            self.deps.len(),
            self.provides.len()
        );
    }
}

/// `builddate` is seconds since the epoch
fn parse_build_date(value: &str) -> Option<DateTime<Utc>> {
    value
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# Generated by makepkg
pkgname = syncthingtray
pkgver = 0.6.2-1
pkgdesc = Tray application for Syncthing
url = https://github.com/Martchus/syncthingtray
builddate = 1493040000
packager = Some Packager <packager@example.org>
size = 4620288
arch = x86_64
license = GPL
depend = qtutilities
depend = syncthing
optdepend = syncthing-inotify: automatic syncing
makedepend = cmake
checkdepend = cppunit
provides = syncthingtray-qt5=0.6.2
conflict = syncthingtray-git
"#;

    #[test]
    fn test_parse_all_fields() {
        let mut pkg = Package::default();
        pkg.add_info_from_pkginfo_file(SAMPLE);

        assert_eq!(pkg.name, "syncthingtray");
        assert_eq!(pkg.version, PackageVersion::parse("0.6.2-1").unwrap());
        assert_eq!(pkg.description, "Tray application for Syncthing");
        assert_eq!(pkg.upstream_url, "https://github.com/Martchus/syncthingtray");
        assert_eq!(pkg.licenses, vec!["GPL".to_string()]);
        assert_eq!(pkg.deps.len(), 2);
        assert_eq!(pkg.optdeps.len(), 1);
        assert_eq!(
            pkg.optdeps[0].description.as_deref(),
            Some("automatic syncing")
        );
        assert_eq!(pkg.provides.len(), 1);
        assert_eq!(pkg.conflicts.len(), 1);

        let info = pkg.package_info.unwrap();
        assert_eq!(info.arch, "x86_64");
        assert_eq!(info.packager, "Some Packager <packager@example.org>");
        assert_eq!(
            info.build_date,
            DateTime::<Utc>::from_timestamp(1493040000, 0)
        );

        let source_info = pkg.source_info.unwrap();
        assert_eq!(source_info.make_deps.len(), 1);
        assert_eq!(source_info.check_deps.len(), 1);
        assert!(source_info.archs.contains("x86_64"));

        assert_eq!(pkg.install_info.unwrap().installed_size, 4620288);
    }

    #[test]
    fn test_comments_and_unknown_keys_ignored() {
        let mut pkg = Package::default();
        pkg.add_info_from_pkginfo_file("# comment\nunknownkey = value\npkgname = foo\n");
        assert_eq!(pkg.name, "foo");
    }
}
