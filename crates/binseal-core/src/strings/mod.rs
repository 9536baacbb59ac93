//! Protected-string patching.
//!
//! Each `.protected-string-entry.*` marker points at a NOP reservation the
//! C source left in the code section. This module fills every located
//! reservation with a randomised gadget chain that rebuilds the target
//! string (plus its NUL terminator) into the buffer `RBX` points at, then
//! pads leftover space with junk gadgets.
//!
//! The chain length varies between syntheses, so each attempt runs as a
//! tentative patch: if the encoded chain overflows the reservation the
//! manifest and image are rolled back and the dice are thrown again.

pub mod gadgets;

use rand::seq::SliceRandom;

use crate::elf::image::ElfImage;
use crate::error::{PatchError, Result};
use crate::markers::{self, ProtectedString};
use crate::volatile::{self, VolatileRegions};
use crate::x64::Block;

use gadgets::{
    ASSIGNMENT_KINDS, Gadget, JUNK_KINDS, PatchState, StringCharacter, apply_junk, offer,
};

const TARGET: &str = "action.protect-strings";

/// Maximum synthesis attempts per reservation.
///
/// The usual failure mode is size: the opcode count is variable, and a
/// chain that does not fit is discarded rather than trimmed.
pub const MAX_PATCH_TRIES: u32 = 10;

/// Patch every located protected-string reservation in the image.
///
/// Unlocatable reservations are warnings, not errors: the remaining
/// entries are still processed.
pub fn patch_protected_strings(image: &mut ElfImage) -> Result<()> {
    let entries = markers::protected_strings(image)?;
    let volatile = volatile::volatile_regions(image)?;
    let total = entries.len();

    for (index, entry) in entries.iter().enumerate() {
        match entry.reservation_va {
            Some(reservation_va) => {
                log::info!(
                    target: TARGET,
                    "patching protected string #{}/{} - {} (~{:#018x})",
                    index + 1,
                    total,
                    entry.section_name,
                    reservation_va
                );
                patch_reservation(image, entry, reservation_va, &volatile)?;
            }
            None => {
                log::warn!(
                    target: TARGET,
                    "unable to find reservation for protected string #{}/{} - {} (~{:#018x})",
                    index + 1,
                    total,
                    entry.section_name,
                    entry.label_va
                );
            }
        }
    }
    Ok(())
}

/// Synthesise and write the gadget chain for one reservation.
fn patch_reservation(
    image: &mut ElfImage,
    entry: &ProtectedString,
    reservation_va: u64,
    volatile: &VolatileRegions,
) -> Result<()> {
    let section = image.section_containing(reservation_va)?;
    let reservation_size = entry.reservation_size as usize;

    let mut target = entry.expected.clone();
    target.push(0);

    let mut accepted: Option<(Vec<Gadget>, usize)> = None;
    for attempt in 1..=MAX_PATCH_TRIES {
        log::debug!(
            target: TARGET,
            "attempting to generate gadget list (attempt #{attempt}/{MAX_PATCH_TRIES})"
        );

        let snapshot = image.snapshot();
        let chain = select_assignment_gadgets(&target);
        let mut state = PatchState::new(section.clone());
        let block = compile_chain(&chain, image, &mut state, volatile)?;
        let encoded_length = block.encoded_length();

        log::debug!(
            target: TARGET,
            "generated solution size guidance: {encoded_length}/{reservation_size} bytes, {:.0}% capacity",
            encoded_length as f64 / reservation_size as f64 * 100.0
        );

        if encoded_length <= reservation_size {
            accepted = Some((chain, encoded_length));
            break;
        }

        log::debug!(target: TARGET, "gadget chain too large; discarding");
        image.restore(snapshot);
    }

    let Some((mut chain, encoded_length)) = accepted else {
        return Err(PatchError::ReservationTooSmall {
            section: entry.section_name.clone(),
            size: entry.reservation_size,
            attempts: MAX_PATCH_TRIES,
        });
    };

    // Fill the slack with junk gadgets; whatever they decline stays NOP.
    let slack = reservation_size - encoded_length;
    let unclaimed = inject_junk_gadgets(slack, &mut chain);
    if unclaimed > 0 {
        log::debug!(
            target: TARGET,
            "{unclaimed} bytes unallocatable to junk and remain as NOP"
        );
    }

    let mut state = PatchState::new(section);
    let block = compile_chain(&chain, image, &mut state, volatile)?;
    let opcodes = block.encode(reservation_va);
    assert!(
        opcodes.len() <= reservation_size,
        "invalid patch size: {} bytes generated > {} bytes available",
        opcodes.len(),
        reservation_size
    );

    image.write(reservation_va, &opcodes)?;
    for junk_va in block.raw_byte_vas(reservation_va) {
        image.register_junk(junk_va);
    }

    log::info!(
        target: TARGET,
        "finished protected string {} - {} bytes ASM, {} chars, ~{:.2} bytes/char",
        entry.section_name,
        opcodes.len(),
        entry.expected.len(),
        opcodes.len() as f64 / entry.expected.len().max(1) as f64
    );
    Ok(())
}

/// Pick assignment gadgets until every character of `target` is claimed.
///
/// Gadget types are offered the remaining characters in a fresh random
/// order each round; the first taker prepends its gadget to the chain.
fn select_assignment_gadgets(target: &[u8]) -> Vec<Gadget> {
    let mut remaining = StringCharacter::manifest(target);
    let mut chain = Vec::new();
    let mut kinds = ASSIGNMENT_KINDS;
    let mut rng = rand::rng();

    while !remaining.is_empty() {
        kinds.shuffle(&mut rng);
        let gadget = kinds
            .iter()
            .find_map(|&kind| offer(kind, &mut remaining))
            .unwrap_or_else(|| unreachable!("direct byte assignment always claims"));
        log::debug!(target: TARGET, "selected {gadget} gadget");
        chain.insert(0, gadget);
    }
    chain
}

/// Compile a chain front to back, threading the RBX tracking state.
fn compile_chain(
    chain: &[Gadget],
    image: &mut ElfImage,
    state: &mut PatchState,
    volatile: &VolatileRegions,
) -> Result<Block> {
    let mut block = Block::new();
    for gadget in chain {
        block.extend(gadget.compile(image, state, volatile)?);
    }
    Ok(block)
}

/// Greedily hand `available_space` bytes to junk gadgets.
///
/// Returns the number of bytes no junk gadget was willing to take.
fn inject_junk_gadgets(mut available_space: usize, chain: &mut Vec<Gadget>) -> usize {
    let mut kinds = JUNK_KINDS;
    let mut rng = rand::rng();

    while available_space > 0 {
        kinds.shuffle(&mut rng);
        let consumed = kinds.iter().find_map(|&kind| {
            let used = apply_junk(kind, available_space, chain);
            (used > 0).then_some(used)
        });
        match consumed {
            Some(used) => available_space -= used,
            None => break,
        }
    }
    available_space
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::gadgets::{MISALIGNED_JUMP_SIZE, ROUNDABOUT_OVERHEAD};

    #[test]
    fn test_selection_claims_every_character() {
        for _ in 0..32 {
            let chain = select_assignment_gadgets(b"protected!\0");
            let mut claimed: Vec<usize> = chain
                .iter()
                .flat_map(|gadget| match gadget {
                    Gadget::DirectByte(ch) => vec![ch.index],
                    Gadget::Xor { characters, .. } => {
                        characters.iter().map(|ch| ch.index).collect()
                    }
                    _ => vec![],
                })
                .collect();
            claimed.sort_unstable();
            assert_eq!(claimed, (0..11).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_junk_injection_respects_budget() {
        for budget in 0..64 {
            let mut chain = vec![Gadget::DirectByte(StringCharacter { index: 0, value: 1 })];
            let before = chain.len();
            let leftover = inject_junk_gadgets(budget, &mut chain);
            assert!(leftover <= budget);
            // every consumed byte is accounted for by an inserted or
            // wrapping junk gadget
            let inserted = chain.len() - before;
            let wrapped = count_roundabouts(&chain);
            assert_eq!(
                budget - leftover,
                inserted * MISALIGNED_JUMP_SIZE + wrapped * ROUNDABOUT_OVERHEAD
            );
            assert!(leftover < MISALIGNED_JUMP_SIZE);
        }
    }

    fn count_roundabouts(chain: &[Gadget]) -> usize {
        chain
            .iter()
            .map(|gadget| {
                let mut depth = 0;
                let mut cursor = gadget;
                while let Gadget::Roundabout(inner) = cursor {
                    depth += 1;
                    cursor = &**inner;
                }
                depth
            })
            .sum()
    }
}
