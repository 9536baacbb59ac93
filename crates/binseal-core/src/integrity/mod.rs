//! Incremental integrity patching.
//!
//! `.hash-patch.*` descriptors describe components of the binary's
//! self-checking machinery. Incremental checks form named *chains*: the
//! first (root) layer hashes the code section with a random seed injected
//! at build time, and every later layer seeds from the previous layer's
//! output, so a check tampered with anywhere throws every later value off
//! balance. XOR-to-known and insert-hash components piggyback on a layer's
//! output without disclosing it.
//!
//! Patching runs in two phases over stable state:
//!
//! - **Phase B (non-volatile)** changes bytes that are part of the hash:
//!   the generator's skip table, allocation size and section start, and
//!   each chain's root seed.
//! - **Phase C (volatile)** computes the per-layer hashes over the now
//!   stable bytes and fills in every hash site, XOR mask and pre-image
//!   hash. These sites are exactly the QWORDs the hash skips.
//!
//! Any error aborts the whole action before a save, leaving the on-disk
//! file untouched.

pub mod generator;

pub use generator::{MAX_VOLATILE_QWORDS, generator_patch_size, patch_generators};

use std::collections::BTreeMap;

use rand::Rng;

use crate::algo::MurmurOaat64;
use crate::elf::image::ElfImage;
use crate::error::{PatchError, Result};
use crate::markers::{self, HashPatchKind, HashPatchRecord, XOR_MASK_KNOWN};

const TARGET: &str = "action.hash-patch";

/// One layer of an integrity chain: every descriptor sharing an `order`
/// value. All entry points in a layer observe the same seed and produce
/// the same output hash.
pub struct ChainLayer {
    /// Hash seed; drawn at random for layer 0, inherited above.
    pub seed: u64,
    /// Murmur output over the code section, skipping volatile QWORDs.
    pub out: u64,
    pub entry_points: Vec<HashPatchRecord>,
    pub xor_to_known: Vec<HashPatchRecord>,
    pub insert_hash: Vec<HashPatchRecord>,
}

impl ChainLayer {
    fn new() -> Self {
        Self {
            seed: 0,
            out: 0,
            entry_points: Vec::new(),
            xor_to_known: Vec::new(),
            insert_hash: Vec::new(),
        }
    }
}

/// A named sequence of layered integrity checks.
pub struct IntegrityChain {
    pub name: String,
    pub layers: Vec<ChainLayer>,
}

/// Run the full hash-patch pass over the image.
pub fn hash_patch(image: &mut ElfImage) -> Result<()> {
    let records = markers::hash_patch_records(image)?;
    log::info!(
        target: TARGET,
        "found {} hash-patch descriptors",
        records.len()
    );

    // Phase B: everything that is itself part of the hashed bytes.
    log::info!(target: TARGET, "patching non-volatile aspects of the integrity system");
    let volatile_qwords = collect_volatile_qwords(image, &records)?;
    patch_generators(image, &records, &volatile_qwords)?;
    let mut chains = build_chains(image, &records)?;
    seed_chains(image, &mut chains)?;

    // Phase C: values that depend on the hash of the stable bytes. The
    // placeholder sites are re-scanned; phase B must not have destroyed
    // any of them.
    log::info!(target: TARGET, "patching volatile aspects of the integrity system");
    let volatile_qwords = collect_volatile_qwords(image, &records)?;
    compute_layer_hashes(image, &mut chains, &volatile_qwords)?;
    patch_volatile_sites(image, &chains)?;

    Ok(())
}

/// The sorted, deduplicated union of every descriptor's volatile QWORDs.
pub fn collect_volatile_qwords(
    image: &ElfImage,
    records: &[HashPatchRecord],
) -> Result<Vec<u64>> {
    let mut qwords = Vec::new();
    for record in records {
        qwords.extend(record.volatile_offsets(image)?);
    }
    qwords.sort_unstable();
    qwords.dedup();
    Ok(qwords)
}

/// Group chain descriptors into ordered layers and validate the layering.
fn build_chains(image: &ElfImage, records: &[HashPatchRecord]) -> Result<Vec<IntegrityChain>> {
    let mut groups: BTreeMap<&str, Vec<&HashPatchRecord>> = BTreeMap::new();
    for record in records {
        if let Some(chain) = record.chain() {
            groups.entry(chain).or_default().push(record);
        }
    }
    log::debug!(
        target: TARGET,
        "found {} incremental integrity chains",
        groups.len()
    );

    let mut chains = Vec::new();
    for (name, mut members) in groups {
        // Stable sort: orders need not be consecutive or unique; equal
        // orders share a layer.
        members.sort_by_key(|record| record.order().unwrap_or(0));

        let mut layers: Vec<ChainLayer> = Vec::new();
        let mut current_order = None;
        for record in members {
            if current_order != record.order() {
                current_order = record.order();
                layers.push(ChainLayer::new());
            }
            let layer = layers.last_mut().unwrap_or_else(|| unreachable!());
            match record.kind {
                HashPatchKind::Incremental { .. } => layer.entry_points.push(record.clone()),
                HashPatchKind::XorToKnown { .. } => layer.xor_to_known.push(record.clone()),
                HashPatchKind::InsertMurmur { .. } => layer.insert_hash.push(record.clone()),
                HashPatchKind::Generator { .. } => unreachable!("generators carry no chain"),
            }
        }

        let chain = IntegrityChain {
            name: name.to_owned(),
            layers,
        };
        validate_chain(image, &chain)?;
        log::info!(
            target: TARGET,
            "configured incremental integrity chain '{}' across {} layers",
            chain.name,
            chain.layers.len()
        );
        chains.push(chain);
    }
    Ok(chains)
}

/// Enforce the chain layering rules.
///
/// Every layer must contain at least one recalculation entry point (an
/// XOR-to-known or insert-hash on a lone order has no hash to observe).
/// Root-layer entry points must carry a seed placeholder; later layers
/// inherit their seed from below and must not.
fn validate_chain(image: &ElfImage, chain: &IntegrityChain) -> Result<()> {
    for (index, layer) in chain.layers.iter().enumerate() {
        if layer.entry_points.is_empty() {
            return Err(PatchError::InvalidIntegrityChain {
                chain: chain.name.clone(),
                reason: format!(
                    "layer #{index} contains no recalculation entry points - is an \
                     XOR-to-known or insert-hash descriptor alone on its order?"
                ),
            });
        }

        for entry in &layer.entry_points {
            let seed_sites = entry.integrity_seed_sites(image)?;
            if index == 0 && seed_sites.is_empty() {
                return Err(PatchError::PlaceholderNotFound {
                    pattern: "INTEGRITY_SEED",
                    section: entry.section_name.clone(),
                });
            }
            if index > 0 && !seed_sites.is_empty() {
                return Err(PatchError::InvalidIntegrityChain {
                    chain: chain.name.clone(),
                    reason: format!(
                        "successive layer described in {} injects a seed; this value \
                         should be sourced from the previous layer",
                        entry.section_name
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Draw a fresh root seed per chain and write it over every layer-0 seed
/// placeholder.
fn seed_chains(image: &mut ElfImage, chains: &mut [IntegrityChain]) -> Result<()> {
    let mut rng = rand::rng();
    for chain in chains {
        let seed: u64 = rng.random();
        log::debug!(
            target: TARGET,
            "generated random seed to initialise chain '{}': {seed:#018x}",
            chain.name
        );

        let root = &mut chain.layers[0];
        root.seed = seed;
        for entry in &root.entry_points {
            for site in entry.integrity_seed_sites(image)? {
                log::debug!(
                    target: TARGET,
                    "patching chain '{}' root seed at {site:#018x} ({})",
                    chain.name,
                    entry.section_name
                );
                image.write(site, &seed.to_le_bytes())?;
            }
        }
    }
    Ok(())
}

/// Compute every layer's output hash, seeding each layer from the one
/// below it.
fn compute_layer_hashes(
    image: &ElfImage,
    chains: &mut [IntegrityChain],
    volatile_qwords: &[u64],
) -> Result<()> {
    for chain in chains {
        let mut seed = chain.layers[0].seed;
        for layer in &mut chain.layers {
            layer.seed = seed;
            let scope_va = layer.entry_points[0].start_va;
            layer.out = murmur_over_section(image, scope_va, layer.seed, volatile_qwords)?;
            seed = layer.out;
        }
    }
    Ok(())
}

/// Murmur the section containing `scope_va`, skipping every volatile
/// QWORD.
///
/// The result is the hash of the concatenated stable ranges, exactly what
/// the patched runtime generator walks. Volatile QWORDs must be 8-aligned
/// relative to the section base and lie fully inside the section.
pub fn murmur_over_section(
    image: &ElfImage,
    scope_va: u64,
    seed: u64,
    volatile_qwords: &[u64],
) -> Result<u64> {
    let section = image.section_containing(scope_va)?;
    let base = section.start();
    let end = section.end();

    let mut murmur = MurmurOaat64::new(seed);
    let mut cursor = base;
    for &qword in volatile_qwords {
        if qword < base || qword + 8 > end {
            return Err(PatchError::AddressInNoSection { va: qword });
        }
        if (qword - base) % 8 != 0 {
            return Err(PatchError::MisalignedVolatileQword { va: qword });
        }
        debug_assert!(qword >= cursor, "overlapping volatile QWORDs");
        murmur.consume(image.read(cursor, (qword - cursor) as usize)?);
        cursor = qword + 8;
    }
    murmur.consume(image.read(cursor, (end - cursor) as usize)?);
    Ok(murmur.value())
}

/// Fill every volatile site: layer hashes, XOR masks and pre-image
/// hashes.
fn patch_volatile_sites(image: &mut ElfImage, chains: &[IntegrityChain]) -> Result<()> {
    for chain in chains {
        for (index, layer) in chain.layers.iter().enumerate() {
            let out_bytes = layer.out.to_le_bytes();

            for entry in &layer.entry_points {
                for site in entry.integrity_hash_sites(image)? {
                    log::debug!(
                        target: TARGET,
                        "patching integrity hash for chain '{}' layer #{index} at {site:#018x}",
                        chain.name
                    );
                    image.write(site, &out_bytes)?;
                }
            }

            for record in &layer.xor_to_known {
                let HashPatchKind::XorToKnown { required_value, .. } = record.kind else {
                    continue;
                };
                let mask = required_value ^ layer.out;
                let sites = record.placeholder_sites(image, XOR_MASK_KNOWN)?;
                if sites.is_empty() {
                    return Err(PatchError::PlaceholderNotFound {
                        pattern: "XOR_MASK_KNOWN",
                        section: record.section_name.clone(),
                    });
                }
                for site in sites {
                    log::debug!(
                        target: TARGET,
                        "injecting XOR mask for chain '{}' layer #{index} at {site:#018x}",
                        chain.name
                    );
                    image.write(site, &mask.to_le_bytes())?;
                }
            }

            for record in &layer.insert_hash {
                let HashPatchKind::InsertMurmur { ref expected, .. } = record.kind else {
                    continue;
                };
                let mut murmur = MurmurOaat64::new(layer.out);
                murmur.consume(expected);
                let sites = record.integrity_hash_sites(image)?;
                if sites.is_empty() {
                    return Err(PatchError::PlaceholderNotFound {
                        pattern: "INTEGRITY_HASH",
                        section: record.section_name.clone(),
                    });
                }
                for site in sites {
                    log::debug!(
                        target: TARGET,
                        "injecting pre-image hash for chain '{}' layer #{index} at {site:#018x}",
                        chain.name
                    );
                    image.write(site, &murmur.value().to_le_bytes())?;
                }
            }
        }
    }
    Ok(())
}
