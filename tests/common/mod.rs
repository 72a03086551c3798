// tests/common/mod.rs

//! Shared test utilities: synthetic package archives, minimal ELF shared
//! objects and PE import libraries, fake packaging tools, and service
//! setup builders.

#![allow(dead_code)]

use repoforge::{BuildingConfig, Config, Database, Package, ServiceSetup};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Write a plain tar archive with the given `(path, content, mode)`
/// entries; directories end with `/` and carry no content
pub fn write_tar(path: &Path, entries: &[(&str, &[u8], u32)]) {
    let mut builder = tar::Builder::new(Vec::new());
    for (entry_path, content, mode) in entries {
        let mut header = tar::Header::new_gnu();
        if entry_path.ends_with('/') {
            header.set_entry_type(tar::EntryType::Directory);
        }
        header.set_size(content.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder
            .append_data(&mut header, *entry_path, *content)
            .unwrap();
    }
    std::fs::write(path, builder.into_inner().unwrap()).unwrap();
}

/// Build a binary package archive (`.pkg.tar`, uncompressed) with a
/// `.PKGINFO` plus payload entries
pub fn write_pkg_archive(
    dir: &Path,
    file_name: &str,
    pkginfo: &str,
    payload: &[(&str, &[u8], u32)],
) -> PathBuf {
    let mut entries: Vec<(&str, &[u8], u32)> = vec![(".PKGINFO", pkginfo.as_bytes(), 0o644)];
    entries.extend_from_slice(payload);
    let path = dir.join(file_name);
    write_tar(&path, &entries);
    path
}

/// Minimal 64-bit little-endian ELF shared object with the given
/// DT_SONAME and DT_NEEDED entries, parseable by goblin
pub fn minimal_elf_so(soname: Option<&str>, needed: &[&str]) -> Vec<u8> {
    const DT_NEEDED: u64 = 1;
    const DT_STRTAB: u64 = 5;
    const DT_STRSZ: u64 = 10;
    const DT_SONAME: u64 = 14;

    let mut dynstr = vec![0u8];
    let mut needed_offsets = Vec::new();
    for name in needed {
        needed_offsets.push(dynstr.len() as u64);
        dynstr.extend_from_slice(name.as_bytes());
        dynstr.push(0);
    }
    let soname_offset = soname.map(|name| {
        let offset = dynstr.len() as u64;
        dynstr.extend_from_slice(name.as_bytes());
        dynstr.push(0);
        offset
    });

    let dynstr_offset: u64 = 64 + 2 * 56;
    let dynamic_offset = (dynstr_offset + dynstr.len() as u64 + 7) & !7;
    let mut dynamic: Vec<(u64, u64)> = needed_offsets
        .iter()
        .map(|&offset| (DT_NEEDED, offset))
        .collect();
    if let Some(offset) = soname_offset {
        dynamic.push((DT_SONAME, offset));
    }
    dynamic.push((DT_STRTAB, dynstr_offset));
    dynamic.push((DT_STRSZ, dynstr.len() as u64));
    dynamic.push((0, 0));
    let dynamic_size = dynamic.len() as u64 * 16;
    let file_len = dynamic_offset + dynamic_size;

    let mut out = Vec::with_capacity(file_len as usize);
    // ELF header
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    out.extend_from_slice(&3u16.to_le_bytes()); // ET_DYN
    out.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    out.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
    out.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
    out.extend_from_slice(&2u16.to_le_bytes()); // e_phnum
    out.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    let push_phdr = |p_type: u32, offset: u64, size: u64, align: u64, out: &mut Vec<u8>| {
        out.extend_from_slice(&p_type.to_le_bytes());
        out.extend_from_slice(&4u32.to_le_bytes()); // PF_R
        out.extend_from_slice(&offset.to_le_bytes()); // p_offset
        out.extend_from_slice(&offset.to_le_bytes()); // p_vaddr
        out.extend_from_slice(&offset.to_le_bytes()); // p_paddr
        out.extend_from_slice(&size.to_le_bytes()); // p_filesz
        out.extend_from_slice(&size.to_le_bytes()); // p_memsz
        out.extend_from_slice(&align.to_le_bytes());
    };
    push_phdr(1, 0, file_len, 0x1000, &mut out); // PT_LOAD covering the file
    push_phdr(2, dynamic_offset, dynamic_size, 8, &mut out); // PT_DYNAMIC

    out.extend_from_slice(&dynstr);
    while (out.len() as u64) < dynamic_offset {
        out.push(0);
    }
    for (tag, value) in dynamic {
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// A short-import-library member referencing `dll` (machine 0x014c =
/// i386, 0x8664 = x86_64)
pub fn import_member(machine: u16, symbol: &str, dll: &str) -> Vec<u8> {
    let mut data = vec![0u8; 20];
    data[2] = 0xff;
    data[3] = 0xff;
    data[6..8].copy_from_slice(&machine.to_le_bytes());
    data.extend_from_slice(symbol.as_bytes());
    data.push(0);
    data.extend_from_slice(dll.as_bytes());
    data.push(0);
    data
}

/// An `ar` archive (`.a` import library) with the given members
pub fn import_library(members: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut out = b"!<arch>\n".to_vec();
    for (name, data) in members {
        let header = format!(
            "{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}`\n",
            format!("{}/", name),
            0,
            0,
            0,
            "100644",
            data.len()
        );
        assert_eq!(header.len(), 60);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
    }
    out
}

/// Write an executable fake tool script that prints its name and
/// arguments and exits with the given code
pub fn write_fake_tool(dir: &Path, name: &str, exit_code: i32) -> PathBuf {
    let path = dir.join(name);
    let script = format!(
        "#!/bin/sh\necho \"fake {}: $@\"\nexit {}\n",
        name, exit_code
    );
    std::fs::write(&path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// A database whose package entries are constructed from file names
pub fn database_with_packages(name: &str, pkg_dir: &Path, file_names: &[&str]) -> Database {
    let mut db = Database::new(name, format!("{}.db", name));
    db.local_pkg_dir = pkg_dir.to_path_buf();
    for file_name in file_names {
        db.update_package(Arc::new(Package::from_pkg_file_name(file_name).unwrap()));
    }
    db
}

/// Service setup rooted in a scratch directory
pub fn service_setup(root: &Path, config: Config) -> Arc<ServiceSetup> {
    let building = BuildingConfig {
        working_directory: root.join("building"),
        package_cache_dir: root.join("cache"),
        ..Default::default()
    };
    ServiceSetup::new(config, building)
}
