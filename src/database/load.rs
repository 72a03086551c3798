// src/database/load.rs

//! Loading packages from repository database tarballs
//!
//! A database file is a compressed tarball with one directory per package
//! holding `desc`, `depends` and `files` entries in `%FIELD%` block
//! format. Loading replaces the whole package map.

use crate::database::Database;
use crate::dependencies::Dependency;
use crate::error::{Error, Result};
use crate::packages::archive::{last_modified, walk_archive};
use crate::packages::{Package, PackageInfo, PackageOrigin, SourceInfo};
use crate::version::PackageVersion;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

impl Database {
    /// Load packages from the local `.db` tarball (or the `.files` variant
    /// when `with_files` is set and present), replacing the package map
    pub fn load_packages(&mut self, with_files: bool) -> Result<()> {
        let mut archive_path = self.path.clone();
        if with_files {
            let files_path = if self.files_path.as_os_str().is_empty() {
                self.files_path_from_regular_path()
            } else {
                self.files_path.clone()
            };
            if files_path.exists() {
                archive_path = files_path;
            }
        }
        if archive_path.as_os_str().is_empty() {
            return Err(Error::Config(format!(
                "database \"{}\" has no file path configured",
                self.name
            )));
        }
        let modified = last_modified(&archive_path);
        self.load_packages_from_archive(&archive_path, modified)
    }

    /// Load packages from an arbitrary database tarball
    pub fn load_packages_from_archive(
        &mut self,
        archive_path: &Path,
        modified: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut entries: HashMap<String, Package> = HashMap::new();

        walk_archive(
            archive_path,
            &Database::is_file_relevant,
            |directory, file| {
                let package = entries.entry(directory).or_default();
                let content = String::from_utf8_lossy(&file.content);
                apply_database_fields(package, &content);
                Ok(())
            },
            |_| {},
        )?;

        let mut packages = Vec::with_capacity(entries.len());
        for (directory, mut package) in entries {
            if package.name.is_empty() {
                warn!(
                    "{}: entry \"{}\" in \"{}\" has no %NAME%, skipping",
                    self.name,
                    directory,
                    archive_path.display()
                );
                continue;
            }
            package.origin = PackageOrigin::DatabaseFile;
            packages.push(Arc::new(package));
        }
        debug!(
            "{}: loaded {} packages from \"{}\"",
            self.name,
            packages.len(),
            archive_path.display()
        );
        self.replace_packages(packages, modified);
        Ok(())
    }
}

/// Apply one `desc`/`depends`/`files` file in `%FIELD%` block format
fn apply_database_fields(package: &mut Package, content: &str) {
    let mut field = "";
    for line in content.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            field = "";
            continue;
        }
        if line.starts_with('%') && line.ends_with('%') && line.len() > 2 {
            field = &line[1..line.len() - 1];
            continue;
        }
        apply_field_value(package, field, line);
    }
}

fn apply_field_value(package: &mut Package, field: &str, value: &str) {
    match field {
        "NAME" => package.name = value.to_string(),
        "VERSION" => {
            if let Ok(version) = PackageVersion::parse(value) {
                package.version = version;
            }
        }
        "DESC" => package.description = value.to_string(),
        "URL" => package.upstream_url = value.to_string(),
        "ARCH" => package.package_info_mut().arch = value.to_string(),
        "BUILDDATE" => {
            package.package_info_mut().build_date = value
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
        }
        "PACKAGER" => package.package_info_mut().packager = value.to_string(),
        "FILENAME" => package.package_info_mut().file_name = value.to_string(),
        "CSIZE" => package.package_info_mut().size = value.parse().unwrap_or(0),
        "ISIZE" => {
            package
                .install_info
                .get_or_insert_with(Default::default)
                .installed_size = value.parse().unwrap_or(0);
        }
        "LICENSE" => package.licenses.push(value.to_string()),
        "GROUPS" => package.groups.push(value.to_string()),
        "DEPENDS" => package.deps.push(Dependency::parse(value)),
        "OPTDEPENDS" => package.optdeps.push(Dependency::parse(value)),
        "MAKEDEPENDS" => package
            .source_info_mut()
            .make_deps
            .push(Dependency::parse(value)),
        "CHECKDEPENDS" => package
            .source_info_mut()
            .check_deps
            .push(Dependency::parse(value)),
        "PROVIDES" => package.provides.push(Dependency::parse(value)),
        "CONFLICTS" => package.conflicts.push(Dependency::parse(value)),
        "REPLACES" => package.replaces.push(Dependency::parse(value)),
        // the files tree listing does not map to any model field
        "FILES" | "" => {}
        _ => {}
    }
}

impl Package {
    fn package_info_mut(&mut self) -> &mut PackageInfo {
        self.package_info.get_or_insert_with(PackageInfo::default)
    }

    fn source_info_mut(&mut self) -> &mut SourceInfo {
        self.source_info.get_or_insert_with(SourceInfo::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ZLIB_DESC: &str = "%FILENAME%\nzlib-1:1.2.11-4-x86_64.pkg.tar.xz\n\n%NAME%\nzlib\n\n%VERSION%\n1:1.2.11-4\n\n%DESC%\nCompression library\n\n%CSIZE%\n111000\n\n%ISIZE%\n333000\n\n%URL%\nhttps://zlib.net/\n\n%LICENSE%\nZlib\n\n%ARCH%\nx86_64\n\n%BUILDDATE%\n1493040000\n\n%PACKAGER%\nSomeone <someone@example.org>\n";
    const ZLIB_DEPENDS: &str = "%DEPENDS%\nglibc\n\n%MAKEDEPENDS%\ncmake\n";

    fn build_db_tarball(entries: &[(&str, &str)]) -> tempfile::NamedTempFile {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        let data = builder.into_inner().unwrap();
        let mut file = tempfile::Builder::new().suffix(".db.tar").tempfile().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_packages_from_archive() {
        let tarball = build_db_tarball(&[
            ("zlib-1:1.2.11-4/desc", ZLIB_DESC),
            ("zlib-1:1.2.11-4/depends", ZLIB_DEPENDS),
            ("zlib-1:1.2.11-4/files", "%FILES%\nusr/lib/libz.so.1\n"),
        ]);

        let mut db = Database::new("core", tarball.path());
        db.load_packages(false).unwrap();

        assert_eq!(db.packages.len(), 1);
        let zlib = &db.packages["zlib"];
        assert_eq!(zlib.version, PackageVersion::parse("1:1.2.11-4").unwrap());
        assert_eq!(zlib.origin, PackageOrigin::DatabaseFile);
        assert_eq!(zlib.description, "Compression library");
        assert_eq!(zlib.deps.len(), 1);
        assert_eq!(zlib.deps[0].name, "glibc");
        assert_eq!(zlib.source_info.as_ref().unwrap().make_deps.len(), 1);

        let info = zlib.package_info.as_ref().unwrap();
        assert_eq!(info.file_name, "zlib-1:1.2.11-4-x86_64.pkg.tar.xz");
        assert_eq!(info.size, 111000);
        assert_eq!(zlib.install_info.as_ref().unwrap().installed_size, 333000);

        // indices were rebuilt along the way
        assert!(db.provided_deps.provides(&Dependency::parse("zlib>=1.2")));
        assert!(db.required_deps.contains_name("glibc"));
        assert!(db.last_update.is_some());
    }

    #[test]
    fn test_load_skips_nameless_entries() {
        let tarball = build_db_tarball(&[("broken-1.0-1/desc", "%VERSION%\n1.0-1\n")]);
        let mut db = Database::new("core", tarball.path());
        db.load_packages(false).unwrap();
        assert!(db.packages.is_empty());
    }

    #[test]
    fn test_load_replaces_previous_contents() {
        let first = build_db_tarball(&[("zlib-1:1.2.11-4/desc", ZLIB_DESC)]);
        let second = build_db_tarball(&[(
            "bzip2-1.0.8-4/desc",
            "%NAME%\nbzip2\n\n%VERSION%\n1.0.8-4\n",
        )]);

        let mut db = Database::new("core", first.path());
        db.load_packages(false).unwrap();
        assert!(db.packages.contains_key("zlib"));

        db.path = second.path().to_path_buf();
        db.load_packages(false).unwrap();
        assert!(!db.packages.contains_key("zlib"));
        assert!(db.packages.contains_key("bzip2"));
        assert!(!db.provided_deps.provides(&Dependency::parse("zlib")));
    }

    #[test]
    fn test_load_missing_path_is_config_error() {
        let mut db = Database::new("core", "");
        assert!(matches!(db.load_packages(false), Err(Error::Config(_))));
    }
}
