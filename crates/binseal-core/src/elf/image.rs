//! The mutable ELF workspace the patchers operate on.
//!
//! An [`ElfImage`] owns the raw file bytes, the parsed header tables and
//! the patch manifest sidecar. All patch reads and writes go through it so
//! that data-dependency collisions are caught at the single choke point,
//! and so that speculative patch attempts can snapshot and restore both
//! the manifest and the image bytes.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use rand::Rng;

use super::header::Elf64Header;
use super::program::{Elf64ProgramHeader, ProgramType};
use super::section::Elf64SectionHeader;
use super::{ElfError, ElfResult};
use crate::error::{PatchError, Result};
use crate::manifest::PatchManifest;

/// A section header together with its resolved name.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub header: Elf64SectionHeader,
}

impl Section {
    /// Virtual address the section starts at.
    pub fn start(&self) -> u64 {
        self.header.sh_addr
    }

    /// Virtual address one past the section's last byte.
    pub fn end(&self) -> u64 {
        self.header.sh_addr + self.header.sh_size
    }

    /// Whether `va` falls inside `[start, end)`.
    pub fn contains(&self, va: u64) -> bool {
        self.header.is_allocated() && va >= self.start() && va < self.end()
    }
}

/// Snapshot of everything a tentative patch may disturb.
///
/// The gadget search speculatively writes opcodes and registers
/// dependencies; when an attempt does not fit the reservation, restoring
/// this puts both the manifest and the image bytes back.
pub struct PatchSnapshot {
    manifest: PatchManifest,
    bytes: Vec<u8>,
}

/// A loaded ELF file plus its patch manifest.
pub struct ElfImage {
    path: PathBuf,
    bytes: Vec<u8>,
    header: Elf64Header,
    sections: Vec<Section>,
    programs: Vec<Elf64ProgramHeader>,
    manifest: PatchManifest,
}

impl ElfImage {
    /// Load an ELF file and its manifest sidecar (a fresh manifest if no
    /// sidecar exists).
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let manifest = PatchManifest::load_for(path)?;
        Self::from_bytes(path.to_path_buf(), bytes, manifest)
    }

    /// Parse an in-memory image. Exposed so tests can build fixtures
    /// without touching disk.
    pub fn from_bytes(path: PathBuf, bytes: Vec<u8>, manifest: PatchManifest) -> Result<Self> {
        let header = Elf64Header::parse(&bytes)?;

        let programs = parse_programs(&bytes, &header)?;
        if !programs
            .iter()
            .any(|program| program.p_type == ProgramType::Load)
        {
            return Err(ElfError::MissingLoadSegment.into());
        }

        let sections = parse_sections(&bytes, &header)?;

        Ok(Self {
            path,
            bytes,
            header,
            sections,
            programs,
            manifest,
        })
    }

    /// Path the image was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The parsed file header.
    pub fn header(&self) -> &Elf64Header {
        &self.header
    }

    /// Entry point virtual address.
    pub fn entry_va(&self) -> u64 {
        self.header.e_entry
    }

    /// All parsed program headers, in table order.
    pub fn programs(&self) -> &[Elf64ProgramHeader] {
        &self.programs
    }

    /// All parsed sections, in table order.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// The current patch manifest.
    pub fn manifest(&self) -> &PatchManifest {
        &self.manifest
    }

    /// Look a section up by exact name.
    pub fn section_by_name(&self, name: &str) -> Option<Section> {
        self.sections
            .iter()
            .find(|section| section.name == name)
            .cloned()
    }

    /// The unique allocated section containing `va`.
    ///
    /// Neither failure should occur on a healthy binary, but we are
    /// modifying it at a pretty low level, so check anyway.
    pub fn section_containing(&self, va: u64) -> Result<Section> {
        let mut matches = self.sections.iter().filter(|section| section.contains(va));

        let Some(first) = matches.next() else {
            return Err(PatchError::AddressInNoSection { va });
        };
        let extra = matches.count();
        if extra > 0 {
            return Err(PatchError::AddressInMultipleSections {
                va,
                count: extra + 1,
            });
        }
        Ok(first.clone())
    }

    /// The loadable segment whose file-backed range maps `va`.
    pub fn segment_containing(&self, va: u64) -> Result<Elf64ProgramHeader> {
        self.programs
            .iter()
            .find(|program| program.p_type == ProgramType::Load && program.maps(va))
            .cloned()
            .ok_or(PatchError::UnmappedAddress { va })
    }

    /// Translate `[va, va+len)` to a file offset range inside one segment.
    fn va_to_offset(&self, va: u64, len: usize) -> Result<usize> {
        let segment = self
            .programs
            .iter()
            .find(|program| program.p_type == ProgramType::Load && program.maps(va))
            .ok_or(PatchError::UnmappedAddress { va })?;

        if va + len as u64 > segment.p_vaddr + segment.p_filesz {
            return Err(PatchError::UnmappedAddress { va: va + len as u64 });
        }
        Ok((segment.p_offset + (va - segment.p_vaddr)) as usize)
    }

    /// Read `len` bytes of loadable image at `va`.
    pub fn read(&self, va: u64, len: usize) -> Result<&[u8]> {
        let offset = self.va_to_offset(va, len)?;
        Ok(&self.bytes[offset..offset + len])
    }

    /// A section's raw bytes.
    pub fn section_bytes(&self, section: &Section) -> &[u8] {
        if !section.header.has_file_bytes() {
            return &[];
        }
        let start = section.header.sh_offset as usize;
        let end = start + section.header.sh_size as usize;
        &self.bytes[start..end]
    }

    /// Write bytes to the loadable image at `va`.
    ///
    /// Fails if any target byte is covered by a registered data
    /// dependency. Junk offsets inside the range are consumed: the byte is
    /// written and promoted to a dependency, so a second write will fail.
    pub fn write(&mut self, va: u64, bytes: &[u8]) -> Result<()> {
        let len = bytes.len();

        if self.manifest.has_dependency(va, len) {
            let collisions: Vec<String> = self
                .manifest
                .collisions(va, len)
                .map(|dep| format!("- {dep}"))
                .collect();
            return Err(PatchError::WriteClobbersDependency {
                va,
                len,
                collisions: collisions.join("\n"),
            });
        }

        let offset = self.va_to_offset(va, len)?;
        self.bytes[offset..offset + len].copy_from_slice(bytes);

        let end = va + len as u64;
        let consumed: Vec<u64> = self
            .manifest
            .junk_offsets
            .iter()
            .copied()
            .filter(|&junk| junk >= va && junk < end)
            .collect();
        for junk in consumed {
            self.manifest.record_dependency(junk, 1, "value written over junk byte");
        }
        Ok(())
    }

    /// Record that `[va, va+len)` is read by emitted code and must not be
    /// rewritten. Junk offsets inside the range stop being junk.
    pub fn record_data_dependency(&mut self, va: u64, len: u32, message: &str) {
        self.manifest.record_dependency(va, len, message);
    }

    /// Note a byte the patcher emitted as a throwaway literal. It can be
    /// overwritten exactly once, at which point it becomes a dependency.
    pub fn register_junk(&mut self, va: u64) {
        debug_assert!(!self.manifest.has_dependency(va, 1));
        self.manifest.junk_offsets.push(va);
    }

    /// Whether any junk bytes are available for reuse.
    pub fn junk_available(&self) -> bool {
        !self.manifest.junk_offsets.is_empty()
    }

    /// Assign `value` to a random junk byte and return its address, or
    /// `None` when the junk pool is empty.
    pub fn consume_junk(&mut self, value: u8, message: &str) -> Result<Option<u64>> {
        if self.manifest.junk_offsets.is_empty() {
            return Ok(None);
        }
        let index = rand::rng().random_range(0..self.manifest.junk_offsets.len());
        let va = self.manifest.junk_offsets.swap_remove(index);
        self.write(va, &[value])?;
        self.manifest.record_dependency(va, 1, message);
        Ok(Some(va))
    }

    /// Snapshot the manifest and image bytes before a speculative patch.
    pub fn snapshot(&self) -> PatchSnapshot {
        PatchSnapshot {
            manifest: self.manifest.snapshot(),
            bytes: self.bytes.clone(),
        }
    }

    /// Roll a speculative patch back.
    pub fn restore(&mut self, snapshot: PatchSnapshot) {
        self.manifest.restore(snapshot.manifest);
        self.bytes = snapshot.bytes;
    }

    /// Write the image and its manifest sidecar to `path`.
    ///
    /// Both files go through a sibling temporary file and a rename, so an
    /// interrupted save never leaves a torn output.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(directory)?;
        file.write_all(&self.bytes)?;
        file.persist(path).map_err(|err| err.error)?;

        self.manifest.save(path)?;
        Ok(())
    }
}

fn parse_programs(bytes: &[u8], header: &Elf64Header) -> ElfResult<Vec<Elf64ProgramHeader>> {
    let mut programs = Vec::with_capacity(header.e_phnum as usize);
    let stride = header.e_phentsize as usize;
    for index in 0..header.e_phnum as usize {
        let offset = header.e_phoff as usize + index * stride;
        if offset + Elf64ProgramHeader::SIZE > bytes.len() {
            return Err(ElfError::InvalidOffset {
                kind: "program header",
                offset: offset as u64,
            });
        }
        programs.push(Elf64ProgramHeader::parse(&bytes[offset..])?);
    }
    Ok(programs)
}

fn parse_sections(bytes: &[u8], header: &Elf64Header) -> ElfResult<Vec<Section>> {
    let mut raw_headers = Vec::with_capacity(header.e_shnum as usize);
    let stride = header.e_shentsize as usize;
    for index in 0..header.e_shnum as usize {
        let offset = header.e_shoff as usize + index * stride;
        if offset + Elf64SectionHeader::SIZE > bytes.len() {
            return Err(ElfError::InvalidOffset {
                kind: "section header",
                offset: offset as u64,
            });
        }
        raw_headers.push(Elf64SectionHeader::parse(&bytes[offset..])?);
    }

    // Resolve names through the section-name string table.
    let (strtab_offset, strtab_size) = raw_headers
        .get(header.e_shstrndx as usize)
        .map(|strtab| (strtab.sh_offset as usize, strtab.sh_size as usize))
        .unwrap_or((0, 0));
    let strtab = &bytes[strtab_offset..strtab_offset + strtab_size];

    Ok(raw_headers
        .into_iter()
        .map(|raw| Section {
            name: cstr_at(strtab, raw.sh_name as usize),
            header: raw,
        })
        .collect())
}

/// NUL-terminated ASCII string at `offset`, empty when out of range.
fn cstr_at(data: &[u8], offset: usize) -> String {
    if offset >= data.len() {
        return String::new();
    }
    data[offset..]
        .iter()
        .take_while(|&&byte| byte != 0)
        .map(|&byte| byte as char)
        .collect()
}
