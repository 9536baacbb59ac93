//! Stripping a patched binary down to a single-segment blob.
//!
//! The final binary needs nothing but its code: the output is the
//! original ELF header, one program header, and the raw bytes of the
//! section containing the entry point, back to back. The section header
//! table disappears entirely and two header fields are left deliberately
//! wrong (`e_shentsize = 0xFFFF`, `EI_DATA` flipped to big-endian); the
//! kernel loader ignores both, analysis tools often do not.

use std::io::Write as _;
use std::path::Path;

use crate::elf::image::ElfImage;
use crate::elf::program::Elf64ProgramHeader;
use crate::elf::{Elf64Header, ElfData};
use crate::error::Result;

const TARGET: &str = "action.strip-binary";

/// Write the minimal single-segment rendition of `image` to `out_path`.
pub fn strip_binary(image: &ElfImage, out_path: &Path) -> Result<()> {
    log::info!(
        target: TARGET,
        "stripping binary '{}'",
        image.path().display()
    );

    let entry = image.entry_va();
    let section = image.section_containing(entry)?;
    let entry_offset = entry - section.start();
    let segment = image.segment_containing(entry)?;

    let mut header = image.header().clone();
    let mut load = segment.clone();

    // One program header, placed immediately after the ELF header.
    header.e_phnum = 1;
    header.e_phoff = Elf64Header::SIZE as u64;

    // Nuke the section headers.
    header.e_shentsize = 0xffff; // absurd on purpose
    header.e_shnum = 0;
    header.e_shoff = 0;
    header.e_shstrndx = 0;

    // There is no big-endian x86-64; this only exists to upset tooling.
    header.set_data_encoding(ElfData::Msb);

    let payload_start = header.e_phoff + Elf64ProgramHeader::SIZE as u64;
    header.e_entry = load.p_vaddr + payload_start + entry_offset;

    load.p_offset = 0;
    load.p_filesz = payload_start + section.header.sh_size;
    load.p_memsz = load.p_filesz;

    let mut output = Vec::with_capacity(load.p_filesz as usize);
    output.extend_from_slice(&header.to_bytes());
    output.extend_from_slice(&load.to_bytes());
    output.extend_from_slice(image.section_bytes(&section));

    let directory = out_path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(directory)?;
    file.write_all(&output)?;
    file.persist(out_path).map_err(|err| err.error)?;

    log::info!(
        target: TARGET,
        "stripped binary written to '{}' ({} bytes, entry {:#018x})",
        out_path.display(),
        output.len(),
        header.e_entry
    );
    Ok(())
}
