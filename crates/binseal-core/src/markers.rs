//! Parsing of the patcher's marker sections.
//!
//! The protected binary's C source plants two families of specially named
//! sections for the patcher to find:
//!
//! - `.protected-string-entry.<id>`: a 12-byte header (reservation label
//!   address + reservation size) followed by the NUL-terminated ASCII
//!   string the reservation must produce at runtime.
//! - `.hash-patch.<file>:<line>`: a 280-byte record describing one
//!   component of the integrity system; the `action` field selects the
//!   variant and the 256-byte `meta` payload is decoded accordingly.
//!
//! Marker sections are not loaded at runtime; their payloads are read
//! straight from the file image.

use crate::elf::image::ElfImage;
use crate::error::{PatchError, Result};

/// Name prefix of protected-string marker sections.
pub const PROTECTED_STRING_PREFIX: &str = ".protected-string-entry";

/// Name prefix of hash-patch marker sections.
pub const HASH_PATCH_PREFIX: &str = ".hash-patch.";

/// Placeholder for the current layer's integrity hash (volatile).
pub const INTEGRITY_HASH: u64 = 0xaddf_00dc_0ffe_ebed;

/// Placeholder for a chain's root seed.
///
/// Only root layers carry this; successive layers inherit their seed from
/// the previous layer's output and never have it written into the binary.
pub const INTEGRITY_SEED: u64 = 0x1eaf_5adc_a75f_00d5;

/// Placeholder for a mask that XORs with the current hash to a known value
/// (volatile).
pub const XOR_MASK_KNOWN: u64 = 0x5afe_70be_c0d3_ab1e;

/// Placeholder for the load-start VA of the hashed section.
pub const GEN_VM_START: u64 = 0xca11_ab1e_0ddb_a115;

/// Placeholder for the byte size of the generator's skip table.
pub const GEN_ALLOC_SIZE: u64 = 0x5adc_01dc_0ffe_ebad;

/// Size of the `meta` payload in a hash-patch record.
pub const META_SIZE: usize = 256;

/// Total size of a hash-patch record.
const RECORD_SIZE: usize = 8 + 8 + 8 + META_SIZE;

/// The x86 NOP opcode used by the C source to reserve patch space.
pub const NOP: u8 = 0x90;

/// Maximum bytes of compiler preamble between a reservation label and the
/// actual NOP run (GCC stores/loads registers between the label and the
/// empty asm block).
const MAX_ASM_PREAMBLE: usize = 0x10;

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
        data[offset + 4],
        data[offset + 5],
        data[offset + 6],
        data[offset + 7],
    ])
}

/// ASCII string up to the first NUL.
fn meta_cstring(data: &[u8]) -> String {
    data.iter()
        .take_while(|&&byte| byte != 0)
        .map(|&byte| byte as char)
        .collect()
}

/// One `.protected-string-entry.*` section, decoded.
#[derive(Debug, Clone)]
pub struct ProtectedString {
    /// Name of the marker section this was read from.
    pub section_name: String,
    /// The label address recorded by the C source. The real reservation
    /// starts within [`MAX_ASM_PREAMBLE`] bytes of this.
    pub label_va: u64,
    /// Size of the reserved NOP run.
    pub reservation_size: u32,
    /// The string the reservation must produce (without the trailing NUL).
    pub expected: Vec<u8>,
    /// Located start of the NOP run, or `None` when no run of the required
    /// size exists in the search window.
    pub reservation_va: Option<u64>,
}

impl ProtectedString {
    /// Whether the reservation was actually located.
    pub fn located(&self) -> bool {
        self.reservation_va.is_some()
    }
}

/// Decode every protected-string marker in the image.
pub fn protected_strings(image: &ElfImage) -> Result<Vec<ProtectedString>> {
    let mut entries = Vec::new();

    for section in image.sections() {
        if !section.name.starts_with(PROTECTED_STRING_PREFIX) {
            continue;
        }
        let data = image.section_bytes(section);
        if data.len() < 12 {
            return Err(PatchError::MalformedMarkerSection {
                section: section.name.clone(),
                reason: format!("{} byte payload, need at least 12", data.len()),
            });
        }

        let label_va = read_u64(data, 0);
        let reservation_size = read_u32(data, 8);
        let expected: Vec<u8> = data[12..]
            .iter()
            .copied()
            .take_while(|&byte| byte != 0)
            .collect();

        let reservation_va = locate_reservation(image, label_va, reservation_size)?;

        entries.push(ProtectedString {
            section_name: section.name.clone(),
            label_va,
            reservation_size,
            expected,
            reservation_va,
        });
    }

    Ok(entries)
}

/// Find the NOP reservation behind a protected-string label.
///
/// The label precedes an empty inline-asm block, so the reservation starts
/// at most [`MAX_ASM_PREAMBLE`] bytes later: scan forward for the first
/// offset with `reservation_size` consecutive NOPs.
fn locate_reservation(image: &ElfImage, label_va: u64, size: u32) -> Result<Option<u64>> {
    let section = image.section_containing(label_va)?;
    let size = size as usize;

    let window_end = (label_va + (MAX_ASM_PREAMBLE + size) as u64).min(section.end());
    let window = image.read(label_va, (window_end - label_va) as usize)?;

    for offset in 0..MAX_ASM_PREAMBLE.min(window.len()) {
        let run = &window[offset..];
        if run.len() >= size && run[..size].iter().all(|&byte| byte == NOP) {
            return Ok(Some(label_va + offset as u64));
        }
    }
    Ok(None)
}

/// The variant payload of a hash-patch record.
#[derive(Debug, Clone)]
pub enum HashPatchKind {
    /// One recalculation point in an incremental integrity chain.
    Incremental { chain: String, order: i64 },
    /// The Murmur generator itself; needs its skip table and allocation
    /// size patched in.
    Generator { reserved_volatile_qwords: u64 },
    /// Wants a mask that XORs with the current hash to a known value.
    XorToKnown {
        required_value: u64,
        order: i64,
        chain: String,
    },
    /// Wants the hash of a known buffer, seeded with the current hash.
    InsertMurmur {
        expected: Vec<u8>,
        order: i64,
        chain: String,
    },
}

/// One `.hash-patch.*` section, decoded.
#[derive(Debug, Clone)]
pub struct HashPatchRecord {
    /// Name of the marker section this was read from.
    pub section_name: String,
    /// Start of the code region this record scopes.
    pub start_va: u64,
    /// End (exclusive) of the scoped region.
    pub end_va: u64,
    pub kind: HashPatchKind,
}

/// Special (negative) hash action identifiers.
const ACTION_GENERATOR: i64 = -1;
const ACTION_XOR_TO_KNOWN: i64 = -2;
const ACTION_INSERT_MURMUR: i64 = -3;

/// Decode every hash-patch marker in the image.
pub fn hash_patch_records(image: &ElfImage) -> Result<Vec<HashPatchRecord>> {
    let mut records = Vec::new();

    for section in image.sections() {
        if !section.name.starts_with(HASH_PATCH_PREFIX) {
            continue;
        }
        let data = image.section_bytes(section);
        if data.len() < RECORD_SIZE {
            return Err(PatchError::MalformedMarkerSection {
                section: section.name.clone(),
                reason: format!("{} byte payload, need {RECORD_SIZE}", data.len()),
            });
        }

        let start_va = read_u64(data, 0);
        let end_va = read_u64(data, 8);
        let action = read_u64(data, 16) as i64;
        let meta = &data[24..24 + META_SIZE];

        if start_va >= end_va {
            return Err(PatchError::MalformedMarkerSection {
                section: section.name.clone(),
                reason: format!("empty scope {start_va:#x}..{end_va:#x}"),
            });
        }

        let kind = decode_kind(action, meta).map_err(|reason| match reason {
            KindError::UnknownAction => PatchError::UnsupportedHashAction { action },
            KindError::EmptyChain => PatchError::MalformedMarkerSection {
                section: section.name.clone(),
                reason: "descriptor names an empty chain".to_owned(),
            },
        })?;

        records.push(HashPatchRecord {
            section_name: section.name.clone(),
            start_va,
            end_va,
            kind,
        });
    }

    Ok(records)
}

enum KindError {
    UnknownAction,
    EmptyChain,
}

fn decode_kind(action: i64, meta: &[u8]) -> std::result::Result<HashPatchKind, KindError> {
    const QWORD: usize = 8;
    const DWORD: usize = 4;

    let named = |chain: String, kind: HashPatchKind| {
        if chain.is_empty() {
            Err(KindError::EmptyChain)
        } else {
            Ok(kind)
        }
    };

    match action {
        order if order >= 0 => {
            let chain = meta_cstring(meta);
            named(chain.clone(), HashPatchKind::Incremental { chain, order })
        }
        ACTION_GENERATOR => Ok(HashPatchKind::Generator {
            reserved_volatile_qwords: read_u64(meta, 0),
        }),
        ACTION_XOR_TO_KNOWN => {
            let chain = meta_cstring(&meta[2 * QWORD..]);
            named(
                chain.clone(),
                HashPatchKind::XorToKnown {
                    required_value: read_u64(meta, 0),
                    order: read_u64(meta, QWORD) as i64,
                    chain,
                },
            )
        }
        ACTION_INSERT_MURMUR => {
            let capacity = META_SIZE - QWORD - DWORD;
            let length = (read_u32(meta, 0) as usize).min(capacity);
            let payload = &meta[DWORD + QWORD..];
            let chain = meta_cstring(&payload[length..]);
            named(
                chain.clone(),
                HashPatchKind::InsertMurmur {
                    expected: payload[..length].to_vec(),
                    order: read_u64(meta, DWORD) as i64,
                    chain,
                },
            )
        }
        _ => Err(KindError::UnknownAction),
    }
}

/// All VAs at which the little-endian encoding of `value` occurs in
/// `bytes` (which start at `base_va`).
pub fn placeholder_sites_in(bytes: &[u8], base_va: u64, value: u64) -> Vec<u64> {
    let needle = value.to_le_bytes();
    if bytes.len() < needle.len() {
        return Vec::new();
    }
    (0..=bytes.len() - needle.len())
        .filter(|&offset| bytes[offset..offset + needle.len()] == needle)
        .map(|offset| base_va + offset as u64)
        .collect()
}

/// Maximal NOP runs of at least `min_len` bytes, as `(va, run_len)` pairs.
pub fn nop_runs_in(bytes: &[u8], base_va: u64, min_len: usize) -> Vec<(u64, usize)> {
    let mut runs = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        if bytes[offset] == NOP {
            let start = offset;
            while offset < bytes.len() && bytes[offset] == NOP {
                offset += 1;
            }
            if offset - start >= min_len {
                runs.push((base_va + start as u64, offset - start));
            }
        } else {
            offset += 1;
        }
    }
    runs
}

impl HashPatchRecord {
    /// Chain name, for the variants that belong to one.
    pub fn chain(&self) -> Option<&str> {
        match &self.kind {
            HashPatchKind::Incremental { chain, .. }
            | HashPatchKind::XorToKnown { chain, .. }
            | HashPatchKind::InsertMurmur { chain, .. } => Some(chain.as_str()),
            HashPatchKind::Generator { .. } => None,
        }
    }

    /// Layer ordering within the chain, for the variants that have one.
    pub fn order(&self) -> Option<i64> {
        match &self.kind {
            HashPatchKind::Incremental { order, .. }
            | HashPatchKind::XorToKnown { order, .. }
            | HashPatchKind::InsertMurmur { order, .. } => Some(*order),
            HashPatchKind::Generator { .. } => None,
        }
    }

    /// The raw bytes this record scopes.
    pub fn scoped_bytes<'a>(&self, image: &'a ElfImage) -> Result<&'a [u8]> {
        image.read(self.start_va, (self.end_va - self.start_va) as usize)
    }

    /// All occurrences of `placeholder` inside this record's scope.
    pub fn placeholder_sites(&self, image: &ElfImage, placeholder: u64) -> Result<Vec<u64>> {
        let bytes = self.scoped_bytes(image)?;
        Ok(placeholder_sites_in(bytes, self.start_va, placeholder))
    }

    /// Sites the current layer hash is injected at.
    pub fn integrity_hash_sites(&self, image: &ElfImage) -> Result<Vec<u64>> {
        self.placeholder_sites(image, INTEGRITY_HASH)
    }

    /// Sites the chain's root seed is injected at.
    pub fn integrity_seed_sites(&self, image: &ElfImage) -> Result<Vec<u64>> {
        self.placeholder_sites(image, INTEGRITY_SEED)
    }

    /// QWORD addresses the runtime hash must skip.
    ///
    /// Hash sites are always volatile (hard to include the hash in the
    /// thing being hashed); an XOR-to-known mask depends on the hash, so
    /// it is volatile too.
    pub fn volatile_offsets(&self, image: &ElfImage) -> Result<Vec<u64>> {
        let mut sites = self.integrity_hash_sites(image)?;
        if matches!(self.kind, HashPatchKind::XorToKnown { .. }) {
            sites.extend(self.placeholder_sites(image, XOR_MASK_KNOWN)?);
        }
        Ok(sites)
    }

    /// `(va, len)` ranges this record will rewrite even though they stay
    /// part of the hash.
    ///
    /// These do not destabilise the hash (they are patched before it is
    /// computed), but other actions reflectively pulling bytes out of the
    /// binary must not pick from them.
    pub fn unstable_offsets(&self, image: &ElfImage) -> Result<Vec<(u64, u64)>> {
        let mut ranges: Vec<(u64, u64)> = self
            .volatile_offsets(image)?
            .into_iter()
            .map(|va| (va, 8))
            .collect();

        for site in self.integrity_seed_sites(image)? {
            ranges.push((site, 8));
        }

        if matches!(self.kind, HashPatchKind::Generator { .. }) {
            for placeholder in [GEN_ALLOC_SIZE, GEN_VM_START] {
                for site in self.placeholder_sites(image, placeholder)? {
                    ranges.push((site, 8));
                }
            }
            // The skip-table reservation: only trustworthy when the run is
            // still present and unambiguous (a patched generator has none).
            let bytes = self.scoped_bytes(image)?;
            let runs = nop_runs_in(bytes, self.start_va, crate::integrity::generator_patch_size(0));
            if let &[(va, len)] = runs.as_slice() {
                ranges.push((va, len as u64));
            }
        }

        Ok(ranges)
    }
}
