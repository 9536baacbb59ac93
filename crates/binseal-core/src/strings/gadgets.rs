//! Gadgets: small instruction sequences that collectively build a
//! protected string in memory.
//!
//! Assignment gadgets each claim one or more characters of the target
//! string and emit code that writes them into the buffer pointed to by
//! `RBX`. Junk gadgets claim no characters at all; they exist to consume
//! leftover reservation space with something less recognisable than NOPs.
//!
//! Contract at reservation entry: `RBX` points at the first byte of the
//! target buffer, every other general purpose register is clobberable and
//! `EFLAGS` need not be preserved. A gadget that moves `RBX` must track the
//! move through [`PatchState::retarget`]. Recompiling a gadget with the
//! same starting state must produce the same number of bytes, even though
//! the bytes themselves may differ.

use std::fmt;

use rand::Rng;
use rand::seq::IndexedRandom;

use crate::elf::image::{ElfImage, Section};
use crate::error::{PatchError, Result};
use crate::volatile::VolatileRegions;
use crate::x64::{Block, Insn};

/// Byte values XOR gadgets refuse to work with.
///
/// `0x00` degenerates the XOR into a direct assignment and `0x90` is the
/// NOP used to reserve patch space, so its occurrences may change later.
const PROHIBITED_VALUES: [u8; 2] = [0x00, 0x90];

/// Source-sequence retries before an XOR gadget gives up.
const MAX_SOURCE_ATTEMPTS: u32 = 15;

/// Encoded size of a misaligned-jump junk gadget.
pub const MISALIGNED_JUMP_SIZE: usize = 3;

/// Encoded size a roundabout adds on top of the gadget it wraps.
pub const ROUNDABOUT_OVERHEAD: usize = 9;

/// A character of the target string: its value and position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringCharacter {
    pub index: usize,
    pub value: u8,
}

impl StringCharacter {
    /// Break a byte string down into an ordered character list.
    pub fn manifest(bytes: &[u8]) -> Vec<Self> {
        bytes
            .iter()
            .enumerate()
            .map(|(index, &value)| Self { index, value })
            .collect()
    }
}

/// Mutable state threaded through a chain compilation.
pub struct PatchState {
    /// The section the reservation (and all sourced bytes) live in.
    pub section: Section,
    /// The string index `RBX` currently points at.
    pub rbx_index: usize,
}

impl PatchState {
    pub fn new(section: Section) -> Self {
        Self {
            section,
            rbx_index: 0,
        }
    }

    /// Instructions moving `RBX` from the current character to `to_index`.
    pub fn retarget(&mut self, to_index: usize) -> Block {
        let from_index = self.rbx_index;
        self.rbx_index = to_index;

        let distance = to_index.abs_diff(from_index);
        debug_assert!(distance <= 0x7f, "imm8 shift distance overflow");

        let mut block = Block::new();
        if to_index > from_index {
            block.push(if distance == 1 {
                Insn::IncRbx
            } else {
                Insn::AddRbxImm8(distance as u8)
            });
        } else if to_index < from_index {
            block.push(if distance == 1 {
                Insn::DecRbx
            } else {
                Insn::SubRbxImm8(distance as u8)
            });
        }
        block
    }
}

/// Width of an XOR assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XorWidth {
    Dword,
    Qword,
}

impl XorWidth {
    pub fn size(self) -> usize {
        match self {
            Self::Dword => 4,
            Self::Qword => 8,
        }
    }
}

/// The assignment gadget types a synthesis round can offer characters to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentKind {
    DirectByte,
    Xor32,
    Xor64,
}

/// All assignment gadget types, in no particular order.
pub const ASSIGNMENT_KINDS: [AssignmentKind; 3] = [
    AssignmentKind::DirectByte,
    AssignmentKind::Xor32,
    AssignmentKind::Xor64,
];

/// The junk gadget types offered leftover reservation space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JunkKind {
    MisalignedJump,
    Roundabout,
}

/// All junk gadget types, in no particular order.
pub const JUNK_KINDS: [JunkKind; 2] = [JunkKind::MisalignedJump, JunkKind::Roundabout];

/// A gadget in a synthesis chain.
#[derive(Debug, Clone)]
pub enum Gadget {
    /// Write one character directly: `mov BYTE PTR [rbx], imm8`.
    DirectByte(StringCharacter),
    /// Build 4 or 8 consecutive characters at once by XORing a byte
    /// sequence already present in the section with counterparts gathered
    /// one byte at a time through `DL`.
    Xor {
        width: XorWidth,
        characters: Vec<StringCharacter>,
    },
    /// `jmp +1` over one random byte; confuses linear-sweep disassembly.
    MisalignedJump,
    /// Execute the wrapped gadget in place by jumping over it, back into
    /// it, then out past it, with a stray byte after every jump.
    Roundabout(Box<Gadget>),
}

impl fmt::Display for Gadget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectByte(ch) => {
                write!(f, "direct byte assignment (0x{:02x} to index #{})", ch.value, ch.index)
            }
            Self::Xor { width, characters } => write!(
                f,
                "{}-byte XOR operation at index #{}",
                width.size(),
                characters[0].index
            ),
            Self::MisalignedJump => write!(f, "jump/junk gadget"),
            Self::Roundabout(inner) => write!(f, "round-about junk gadget containing {inner}"),
        }
    }
}

/// Offer the remaining unclaimed characters to a gadget type.
///
/// A type that accepts removes the characters it claims from `remaining`
/// and returns the gadget that will build them; a type that cannot (or
/// will not) claim anything returns `None`. `DirectByte` always claims.
pub fn offer(kind: AssignmentKind, remaining: &mut Vec<StringCharacter>) -> Option<Gadget> {
    match kind {
        AssignmentKind::DirectByte => {
            let index = rand::rng().random_range(0..remaining.len());
            Some(Gadget::DirectByte(remaining.remove(index)))
        }
        AssignmentKind::Xor32 => offer_xor(XorWidth::Dword, remaining),
        AssignmentKind::Xor64 => offer_xor(XorWidth::Qword, remaining),
    }
}

fn offer_xor(width: XorWidth, remaining: &mut Vec<StringCharacter>) -> Option<Gadget> {
    let size = width.size();
    if remaining.len() < size {
        return None;
    }

    // The list stays index-ordered, so a window is consecutive exactly
    // when its end points sit `size - 1` apart.
    let starts: Vec<usize> = (0..=remaining.len() - size)
        .filter(|&start| remaining[start + size - 1].index - remaining[start].index == size - 1)
        .collect();

    let &start = starts.choose(&mut rand::rng())?;
    let characters: Vec<StringCharacter> = remaining.drain(start..start + size).collect();
    Some(Gadget::Xor { width, characters })
}

/// Try to apply a junk gadget to the chain within `space` bytes.
///
/// Returns the number of bytes consumed, 0 when the gadget declined.
pub fn apply_junk(kind: JunkKind, space: usize, chain: &mut Vec<Gadget>) -> usize {
    let mut rng = rand::rng();
    match kind {
        JunkKind::MisalignedJump if space >= MISALIGNED_JUMP_SIZE => {
            let at = rng.random_range(0..=chain.len());
            chain.insert(at, Gadget::MisalignedJump);
            MISALIGNED_JUMP_SIZE
        }
        JunkKind::Roundabout if space >= ROUNDABOUT_OVERHEAD && !chain.is_empty() => {
            let at = rng.random_range(0..chain.len());
            let wrapped = std::mem::replace(&mut chain[at], Gadget::MisalignedJump);
            chain[at] = Gadget::Roundabout(Box::new(wrapped));
            ROUNDABOUT_OVERHEAD
        }
        _ => 0,
    }
}

impl Gadget {
    /// Compile this gadget into instructions.
    ///
    /// XOR gadgets read the image to pick operand bytes and register data
    /// dependencies (or consume junk bytes) as they go.
    pub fn compile(
        &self,
        image: &mut ElfImage,
        state: &mut PatchState,
        volatile: &VolatileRegions,
    ) -> Result<Block> {
        match self {
            Self::DirectByte(character) => {
                let mut block = state.retarget(character.index);
                block.push(Insn::MovBytePtrRbxImm8(character.value));
                Ok(block)
            }
            Self::Xor { width, characters } => {
                compile_xor(image, state, volatile, *width, characters)
            }
            Self::MisalignedJump => {
                let mut block = Block::new();
                block.push(Insn::JmpRel8(1));
                block.push(Insn::RawByte(rand::rng().random()));
                Ok(block)
            }
            Self::Roundabout(inner) => {
                let inner_block = inner.compile(image, state, volatile)?;
                Ok(wrap_roundabout(inner_block))
            }
        }
    }
}

/// Lay the roundabout jumps around an already-compiled gadget.
fn wrap_roundabout(inner: Block) -> Block {
    let mut rng = rand::rng();
    let inner_len = inner.encoded_length();

    // jmp + junk pairs are 3 bytes each; distances are measured from the
    // byte after each jmp.
    let jump_out: usize = 4;
    debug_assert!(inner_len + 5 <= i8::MAX as usize, "roundabout rel8 overflow");
    let jump_over = (inner_len + jump_out) as i8;
    let jump_back = -((inner_len + 5) as i8);

    let mut block = Block::new();
    block.push(Insn::JmpRel8(jump_over));
    block.push(Insn::RawByte(rng.random()));
    block.extend(inner);
    block.push(Insn::JmpRel8(jump_out as i8));
    block.push(Insn::RawByte(rng.random()));
    block.push(Insn::JmpRel8(jump_back));
    block.push(Insn::RawByte(rng.random()));
    block
}

fn compile_xor(
    image: &mut ElfImage,
    state: &mut PatchState,
    volatile: &VolatileRegions,
    width: XorWidth,
    characters: &[StringCharacter],
) -> Result<Block> {
    let section_name = state.section.name.clone();
    let (source_va, required_xors) =
        pick_xor_source(image, &state.section, width, characters, volatile)?;
    image.record_data_dependency(
        source_va,
        width.size() as u32,
        &format!("XOR base used to obfuscate string for {section_name}"),
    );

    let mut block = state.retarget(characters[0].index);
    block.push(match width {
        XorWidth::Dword => Insn::MovEaxDwordPtrRip { target: source_va },
        XorWidth::Qword => Insn::MovRaxQwordPtrRip { target: source_va },
    });
    block.push(Insn::MovClImm8(8)); // bits shifted per SHL, one byte at a time

    let mut rng = rand::rng();
    for &xor_target in required_xors.iter().rev() {
        // little-endian: the last counterpart lands in the top byte
        block.push(Insn::ShlRdxCl);

        let candidates = find_byte_in_section(image, &state.section, xor_target, volatile);
        if let Some(&char_va) = candidates.choose(&mut rng) {
            image.record_data_dependency(
                char_va,
                1,
                &format!("XOR key used to obfuscate string for {section_name}"),
            );
            block.push(Insn::XorDlBytePtrRip { target: char_va });
        } else if let Some(char_va) = image.consume_junk(
            xor_target,
            &format!("XOR key (taken from junk) used to obfuscate string for {section_name}"),
        )? {
            block.push(Insn::XorDlBytePtrRip { target: char_va });
        } else {
            // pad to the same 6 bytes as the rip-relative form so the
            // gadget size stays reproducible
            block.push(Insn::XorDlImm8(xor_target));
            block.push(Insn::JmpRel8(1));
            block.push(Insn::RawByte(rng.random()));
        }
    }

    block.push(Insn::XorRaxRdx);
    block.push(match width {
        XorWidth::Dword => Insn::MovDwordPtrRbxEax,
        XorWidth::Qword => Insn::MovQwordPtrRbxRax,
    });
    Ok(block)
}

/// Choose a source byte sequence for an XOR assignment.
///
/// The sequence must sit inside the current section (the binary may be
/// position independent, so only same-section RIP offsets are dependable),
/// contain no prohibited values, not fall into a volatile region, and XOR
/// with the claimed characters without producing prohibited counterparts.
fn pick_xor_source(
    image: &ElfImage,
    section: &Section,
    width: XorWidth,
    characters: &[StringCharacter],
    volatile: &VolatileRegions,
) -> Result<(u64, Vec<u8>)> {
    let size = width.size();
    let data = image.section_bytes(section);

    let mut candidates: Vec<usize> = (0..data.len().saturating_sub(size - 1))
        .filter(|&offset| {
            data[offset..offset + size]
                .iter()
                .all(|byte| !PROHIBITED_VALUES.contains(byte))
        })
        .collect();

    log::debug!(
        target: "action.protect-strings",
        "discovered {} candidates for {}-byte XOR base sequence in {}",
        candidates.len(),
        size,
        section.name
    );

    let mut rng = rand::rng();
    for _ in 0..MAX_SOURCE_ATTEMPTS {
        if candidates.is_empty() {
            break;
        }
        let pick = rng.random_range(0..candidates.len());
        let offset = candidates.swap_remove(pick);
        let source_va = section.start() + offset as u64;

        if volatile.contains(source_va, size as u64) {
            log::debug!(
                target: "action.protect-strings",
                "rejected XOR base at {source_va:#010x}: falls into a volatile range"
            );
            continue;
        }

        let required: Vec<u8> = (0..size)
            .map(|position| characters[position].value ^ data[offset + position])
            .collect();

        if required.iter().any(|byte| PROHIBITED_VALUES.contains(byte)) {
            log::debug!(
                target: "action.protect-strings",
                "rejected XOR base at {source_va:#010x}: needs a forbidden counterpart"
            );
            continue;
        }

        return Ok((source_va, required));
    }

    Err(PatchError::XorSourceExhausted {
        section: section.name.clone(),
        attempts: MAX_SOURCE_ATTEMPTS,
    })
}

/// All positions of `value` in the section outside volatile regions.
fn find_byte_in_section(
    image: &ElfImage,
    section: &Section,
    value: u8,
    volatile: &VolatileRegions,
) -> Vec<u64> {
    image
        .section_bytes(section)
        .iter()
        .enumerate()
        .filter(|&(_, &byte)| byte == value)
        .map(|(offset, _)| section.start() + offset as u64)
        .filter(|&va| !volatile.contains(va, 1))
        .collect()
}
