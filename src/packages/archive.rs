// src/packages/archive.rs

//! Archive walking for binary packages and database files
//!
//! Handles the tar+compression variants used by pacman repositories
//! (.tar.zst, .tar.xz, .tar.gz and plain .tar), dispatching decompression
//! by file-name suffix.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tar::Archive;
use tracing::debug;
use xz2::read::XzDecoder;

/// One regular file read from an archive
pub struct ArchiveFile {
    /// File name without the directory part
    pub name: String,
    pub content: Vec<u8>,
    pub mode: u32,
}

enum CompressionFormat {
    Zstd,
    Xz,
    Gzip,
    None,
}

fn detect_compression(path: &Path) -> CompressionFormat {
    let name = path.to_string_lossy();
    if name.ends_with(".zst") {
        CompressionFormat::Zstd
    } else if name.ends_with(".xz") {
        CompressionFormat::Xz
    } else if name.ends_with(".gz") || name.ends_with(".tgz") {
        CompressionFormat::Gzip
    } else {
        CompressionFormat::None
    }
}

/// Open an archive with the right decoder for its suffix
pub fn open_archive(path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let file = File::open(path)
        .map_err(|e| Error::Filesystem(format!("unable to open \"{}\": {}", path.display(), e)))?;

    let reader: Box<dyn Read> = match detect_compression(path) {
        CompressionFormat::Zstd => Box::new(zstd::Decoder::new(file).map_err(|e| {
            Error::Parse(format!("unable to create zstd decoder for \"{}\": {}", path.display(), e))
        })?),
        CompressionFormat::Xz => Box::new(XzDecoder::new(file)),
        CompressionFormat::Gzip => Box::new(GzDecoder::new(file)),
        CompressionFormat::None => Box::new(file),
    };

    Ok(Archive::new(reader))
}

/// Walk an archive, invoking `on_file` for every regular file accepted by
/// `filter` and `on_dir` for every directory
///
/// `filter` receives `(directory, file_name, mode)` and decides whether the
/// entry's content is read at all; rejected entries are skipped cheaply.
pub fn walk_archive(
    path: &Path,
    filter: &dyn Fn(&str, &str, u32) -> bool,
    mut on_file: impl FnMut(String, ArchiveFile) -> Result<()>,
    mut on_dir: impl FnMut(String),
) -> Result<()> {
    debug!("walking archive {}", path.display());
    let mut archive = open_archive(path)?;

    for entry in archive
        .entries()
        .map_err(|e| Error::Parse(format!("unable to read \"{}\": {}", path.display(), e)))?
    {
        let mut entry =
            entry.map_err(|e| Error::Parse(format!("corrupt entry in \"{}\": {}", path.display(), e)))?;
        let entry_path = entry
            .path()
            .map_err(|e| Error::Parse(format!("bad entry path in \"{}\": {}", path.display(), e)))?
            .to_string_lossy()
            .trim_end_matches('/')
            .to_string();

        if entry.header().entry_type().is_dir() {
            on_dir(entry_path);
            continue;
        }
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let (directory, name) = match entry_path.rfind('/') {
            Some(pos) => (&entry_path[..pos], &entry_path[pos + 1..]),
            None => ("", entry_path.as_str()),
        };
        let mode = entry.header().mode().unwrap_or(0);
        if !filter(directory, name, mode) {
            continue;
        }

        let mut content = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut content).map_err(|e| {
            Error::Parse(format!(
                "unable to read \"{}\" from \"{}\": {}",
                entry_path,
                path.display(),
                e
            ))
        })?;

        on_file(
            directory.to_string(),
            ArchiveFile {
                name: name.to_string(),
                content,
                mode,
            },
        )?;
    }

    Ok(())
}

/// Modification time of a file as UTC timestamp
pub fn last_modified(path: &Path) -> Option<chrono::DateTime<chrono::Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(chrono::DateTime::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_plain_tar(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        let data = builder.into_inner().unwrap();
        let mut file = tempfile::Builder::new().suffix(".tar").tempfile().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_walk_archive_filters_and_reads() {
        let tar = build_plain_tar(&[
            (".PKGINFO", b"pkgname = demo\n"),
            ("usr/bin/demo", b"\x7fELF"),
            ("usr/share/doc/README", b"docs"),
        ]);

        let mut seen = Vec::new();
        walk_archive(
            tar.path(),
            &|_, name, _| name == ".PKGINFO" || name == "demo",
            |directory, file| {
                seen.push((directory, file.name, file.content));
                Ok(())
            },
            |_| {},
        )
        .unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "");
        assert_eq!(seen[0].1, ".PKGINFO");
        assert_eq!(seen[0].2, b"pkgname = demo\n");
        assert_eq!(seen[1].0, "usr/bin");
    }

    #[test]
    fn test_walk_archive_reports_directories() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, "usr/lib/", &[][..]).unwrap();
        let data = builder.into_inner().unwrap();
        let mut file = tempfile::Builder::new().suffix(".tar").tempfile().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let mut dirs = Vec::new();
        walk_archive(file.path(), &|_, _, _| false, |_, _| Ok(()), |d| dirs.push(d)).unwrap();
        assert_eq!(dirs, vec!["usr/lib".to_string()]);
    }

    #[test]
    fn test_open_archive_missing_file() {
        assert!(open_archive(Path::new("/nonexistent/file.tar.zst")).is_err());
    }
}
