// src/packages/binaries.rs

//! Library dependency extraction from package contents
//!
//! ELF files contribute their DT_SONAME as a provide and their DT_NEEDED
//! entries as requirements; PE files contribute their export name and
//! imported DLLs. Import libraries (`.a`/`.dll.a`) reference DLLs that are
//! folded into the requirement set afterwards. Library ids are tagged
//! `<format>-<machine>::<name>`.

use crate::dependencies::{Dependency, DependencyMode, LibraryId};
use crate::packages::archive::ArchiveFile;
use crate::packages::Package;
use goblin::Object;
use std::collections::BTreeSet;
use tracing::debug;

/// Result of parsing one binary: what it provides and requires
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SymbolInfo {
    pub provides: BTreeSet<LibraryId>,
    pub requires: BTreeSet<LibraryId>,
    /// DLLs referenced by import-library members, already ABI-tagged
    pub dll_refs: BTreeSet<LibraryId>,
}

/// Parse the symbol-level provides/requires of a binary file
///
/// Non-binary content (scripts with the executable bit, text files) yields
/// an empty result rather than an error.
pub fn parse_symbols(file_name: &str, bytes: &[u8]) -> SymbolInfo {
    let mut info = SymbolInfo::default();
    match Object::parse(bytes) {
        Ok(Object::Elf(elf)) => {
            let machine = elf_machine(elf.header.e_machine);
            // shared objects provide their soname, falling back to the
            // file name when DT_SONAME is absent
            if file_name.contains(".so") {
                let soname = elf.soname.unwrap_or(file_name);
                info.provides.insert(LibraryId::elf(machine, soname));
            }
            for needed in &elf.libraries {
                info.requires.insert(LibraryId::elf(machine, needed));
            }
        }
        Ok(Object::PE(pe)) => {
            let machine = pe_machine(pe.header.coff_header.machine);
            if pe.is_lib {
                let export_name = pe.name.unwrap_or(file_name);
                info.provides
                    .insert(LibraryId::pe(machine, &export_name.to_lowercase()));
            }
            let mut dlls: BTreeSet<String> = BTreeSet::new();
            for import in &pe.imports {
                dlls.insert(import.dll.to_lowercase());
            }
            for dll in dlls {
                info.requires.insert(LibraryId::pe(machine, &dll));
            }
        }
        Ok(Object::Archive(archive)) => {
            for member in archive.members() {
                if let Ok(data) = archive.extract(member, bytes) {
                    if let Some((machine, dll)) = parse_import_member(data) {
                        info.dll_refs.insert(LibraryId::pe(machine, &dll));
                    }
                }
            }
        }
        _ => {}
    }
    info
}

/// Parse a short-import-library member (IMPORT_OBJECT_HEADER): sig
/// 0x0000/0xffff, machine at offset 6, then symbol and DLL name as
/// consecutive NUL-terminated strings at offset 20
fn parse_import_member(data: &[u8]) -> Option<(&'static str, String)> {
    if data.len() < 22 || data[0] != 0 || data[1] != 0 || data[2] != 0xff || data[3] != 0xff {
        return None;
    }
    let machine = pe_machine(u16::from_le_bytes([data[6], data[7]]));
    let strings = &data[20..];
    let symbol_end = strings.iter().position(|&b| b == 0)?;
    let rest = &strings[symbol_end + 1..];
    let dll_end = rest.iter().position(|&b| b == 0)?;
    let dll = String::from_utf8_lossy(&rest[..dll_end]).to_lowercase();
    if dll.ends_with(".dll") {
        Some((machine, dll))
    } else {
        None
    }
}

fn elf_machine(e_machine: u16) -> &'static str {
    match e_machine {
        goblin::elf::header::EM_386 => "i386",
        goblin::elf::header::EM_X86_64 => "x86_64",
        goblin::elf::header::EM_ARM => "arm",
        goblin::elf::header::EM_AARCH64 => "aarch64",
        goblin::elf::header::EM_RISCV => "riscv64",
        _ => "unknown",
    }
}

fn pe_machine(machine: u16) -> &'static str {
    match machine {
        0x014c => "i386",
        0x8664 => "x86_64",
        0x01c0 | 0x01c4 => "arm",
        0xaa64 => "aarch64",
        _ => "unknown",
    }
}

impl Package {
    /// Fold the symbol info of one contained file into this package
    pub fn add_deps_and_provides_from_contained_file(
        &mut self,
        file: &ArchiveFile,
        dll_refs: &mut BTreeSet<LibraryId>,
    ) {
        let info = parse_symbols(&file.name, &file.content);
        if !info.provides.is_empty() || !info.requires.is_empty() {
            debug!(
                "{}: {} provides {} libs, requires {}",
                self.name,
                file.name,
                info.provides.len(),
                info.requires.len()
            );
        }
        self.libprovides.extend(info.provides);
        self.libdepends.extend(info.requires);
        dll_refs.extend(info.dll_refs);
    }

    /// Derive interpreter dependencies from well-known directory layouts
    ///
    /// Packages installing into `usr/lib/pythonX.Y/site-packages` or a
    /// perl module tree need the interpreter at runtime even when the
    /// database entry does not say so.
    pub fn add_deps_and_provides_from_contained_directory(&mut self, path: &str) {
        let interpreter = if path.contains("site-packages") {
            "python"
        } else if path.contains("/perl5/") || path.ends_with("/perl5") {
            "perl"
        } else {
            return;
        };
        if self.name != interpreter && !self.deps.iter().any(|d| d.name == interpreter) {
            self.deps.push(Dependency {
                name: interpreter.to_string(),
                mode: DependencyMode::NameOnly,
                ..Default::default()
            });
        }
    }

    /// Resolve DLLs referenced by import libraries: anything the package
    /// does not provide itself becomes a requirement
    pub fn process_dlls_referenced_by_import_libs(&mut self, dll_refs: BTreeSet<LibraryId>) {
        for dll in dll_refs {
            if !self.libprovides.contains(&dll) {
                self.libdepends.insert(dll);
            }
        }
    }
}
