//! Patching of the runtime Murmur generator.
//!
//! The compiled-in generator walks the code section at load time, skipping
//! every volatile QWORD. It cannot know those offsets at compile time, so
//! the C source reserves a NOP run and this module fills it with code that
//! builds the skip table:
//!
//! - one `mov DWORD PTR [rbx + 4*i], distance` per volatile QWORD, where
//!   each distance is measured from the end of the previous skip,
//! - one extra entry carrying the distance to the end of the section,
//! - a `0xFFFFFFFF` stop marker,
//! - a final `lea rbx, [rip+...]` handing the section's load start back.
//!
//! The `GEN_ALLOC_SIZE` placeholder receives the byte size of the table
//! and `GEN_VM_START` the section's start address. All of these changes
//! are part of the hashed bytes and happen before any hash is computed.

use crate::elf::image::ElfImage;
use crate::error::{PatchError, Result};
use crate::markers::{self, GEN_ALLOC_SIZE, GEN_VM_START, HashPatchKind, HashPatchRecord};
use crate::x64::{Block, Insn};

const TARGET: &str = "action.hash-patch";

/// Skip-table entries beyond the volatile QWORDs themselves: the
/// end-of-section entry and the stop marker.
const EXTRA_TABLE_ENTRIES: usize = 2;

/// Hard ceiling on volatile QWORDs.
///
/// The table is built with `mov DWORD PTR [rbx+imm8]` stores; the signed
/// 8-bit offset reaches 32 four-byte slots, two of which are reserved.
/// Raising this means changing the generator's addressing, not just the
/// patcher.
pub const MAX_VOLATILE_QWORDS: usize = 30;

/// Bytes of NOP reservation the generator patch needs for `n` volatile
/// QWORDs: a 7-byte table store per entry (including the two extra
/// entries) plus the 7-byte trailing `lea`.
pub fn generator_patch_size(n: usize) -> usize {
    (n + EXTRA_TABLE_ENTRIES) * 7 + 7
}

/// Configure and patch every generator descriptor.
pub fn patch_generators(
    image: &mut ElfImage,
    records: &[HashPatchRecord],
    volatile_qwords: &[u64],
) -> Result<()> {
    let needed = volatile_qwords.len();
    if needed > MAX_VOLATILE_QWORDS {
        return Err(PatchError::TooManyVolatileQwords { found: needed });
    }

    for record in records {
        let HashPatchKind::Generator {
            reserved_volatile_qwords,
        } = record.kind
        else {
            continue;
        };
        let reserved = reserved_volatile_qwords as usize;

        if reserved < needed {
            return Err(PatchError::GeneratorSlotsTooFew {
                section: record.section_name.clone(),
                reserved,
                needed,
            });
        } else if reserved > needed {
            log::warn!(
                target: TARGET,
                "generator {} reserved space for {reserved} volatile QWORDs but only needs \
                 {needed}; shrink the reservation to reclaim the slack",
                record.section_name
            );
        } else {
            log::debug!(
                target: TARGET,
                "generator {} reserved space for {reserved} volatile QWORDs - exact fit",
                record.section_name
            );
        }

        patch_allocation_size(image, record, needed)?;
        patch_vm_start(image, record)?;
        patch_skip_table(image, record, volatile_qwords)?;
    }
    Ok(())
}

/// Replace `GEN_ALLOC_SIZE` occurrences with the table's byte size.
fn patch_allocation_size(
    image: &mut ElfImage,
    record: &HashPatchRecord,
    volatile_count: usize,
) -> Result<()> {
    let alloc_size = ((volatile_count + EXTRA_TABLE_ENTRIES) * 8) as u64;
    for site in record.placeholder_sites(image, GEN_ALLOC_SIZE)? {
        log::debug!(
            target: TARGET,
            "patching skip table allocation size {alloc_size} at {site:#018x}"
        );
        image.write(site, &alloc_size.to_le_bytes())?;
    }
    Ok(())
}

/// Replace `GEN_VM_START` occurrences with the section's load start.
fn patch_vm_start(image: &mut ElfImage, record: &HashPatchRecord) -> Result<()> {
    let section = image.section_containing(record.start_va)?;
    for site in record.placeholder_sites(image, GEN_VM_START)? {
        log::debug!(
            target: TARGET,
            "patching section start {:#018x} at {site:#018x}",
            section.start()
        );
        image.write(site, &section.start().to_le_bytes())?;
    }
    Ok(())
}

/// Fill the generator's NOP reservation with the skip-table builder.
fn patch_skip_table(
    image: &mut ElfImage,
    record: &HashPatchRecord,
    volatile_qwords: &[u64],
) -> Result<()> {
    let section = image.section_containing(record.start_va)?;
    let required = generator_patch_size(volatile_qwords.len());

    let runs = markers::nop_runs_in(record.scoped_bytes(image)?, record.start_va, required);
    let &[(patch_va, run_length)] = runs.as_slice() else {
        return Err(PatchError::DuplicateReservationMatch {
            section: record.section_name.clone(),
            size: required,
            matches: runs.len(),
        });
    };
    log::debug!(
        target: TARGET,
        "found generator reservation for {} at {patch_va:#018x} ({run_length}/{required} bytes)",
        record.section_name
    );

    let block = build_skip_table(volatile_qwords, section.start(), section.end());
    let opcodes = block.encode(patch_va);
    assert!(
        opcodes.len() <= run_length,
        "skip table patch exceeded the reserved space"
    );

    image.write(patch_va, &opcodes)?;
    Ok(())
}

/// Instructions that build the skip table and return the section start.
///
/// `RBX` points at the table buffer on entry. Each entry is the unsigned
/// 32-bit distance from the running cursor, which advances past the
/// skipped QWORD after every entry.
fn build_skip_table(volatile_qwords: &[u64], section_start: u64, section_end: u64) -> Block {
    let mut block = Block::new();
    let mut cursor = section_start;

    for (index, &qword) in volatile_qwords.iter().enumerate() {
        block.push(Insn::MovDwordPtrRbxOffImm32 {
            offset: (index * 4) as i8,
            value: (qword - cursor) as u32,
        });
        cursor = qword + 8;
    }

    let count = volatile_qwords.len();
    block.push(Insn::MovDwordPtrRbxOffImm32 {
        offset: (count * 4) as i8,
        value: (section_end - cursor) as u32,
    });
    block.push(Insn::MovDwordPtrRbxOffImm32 {
        offset: ((count + 1) * 4) as i8,
        value: 0xffff_ffff,
    });
    block.push(Insn::LeaRbxRip {
        target: section_start,
    });
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_size() {
        assert_eq!(generator_patch_size(0), 21);
        assert_eq!(generator_patch_size(2), 35);
        assert_eq!(generator_patch_size(30), 231);
    }

    #[test]
    fn test_skip_table_distances() {
        let base = 0x40_0000;
        let end = 0x40_1000;
        let qwords = [0x40_0100, 0x40_0200];
        let block = build_skip_table(&qwords, base, end);

        let insns = block.insns();
        assert_eq!(insns.len(), 5);
        assert_eq!(
            insns[0],
            Insn::MovDwordPtrRbxOffImm32 {
                offset: 0,
                value: 0x100
            }
        );
        // second distance measured from past the first skip
        assert_eq!(
            insns[1],
            Insn::MovDwordPtrRbxOffImm32 {
                offset: 4,
                value: 0x200 - 0x108
            }
        );
        // end-of-section entry, then the stop marker
        assert_eq!(
            insns[2],
            Insn::MovDwordPtrRbxOffImm32 {
                offset: 8,
                value: 0x1000 - 0x208
            }
        );
        assert_eq!(
            insns[3],
            Insn::MovDwordPtrRbxOffImm32 {
                offset: 12,
                value: 0xffff_ffff
            }
        );
        assert_eq!(insns[4], Insn::LeaRbxRip { target: base });
    }

    #[test]
    fn test_skip_table_fits_reservation() {
        let qwords: Vec<u64> = (0..30).map(|i| 0x40_0000 + i * 8).collect();
        let block = build_skip_table(&qwords, 0x40_0000, 0x40_8000);
        assert_eq!(block.encoded_length(), generator_patch_size(30));
    }
}
