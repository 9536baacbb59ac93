//! One function per CLI action, mapping subcommands onto the core
//! library and keeping the canonical pipeline order in one place:
//! strings are patched before hashes (reservations must be stable by the
//! time they are hashed), and stripping or payload emission operate on
//! the finished binary.

use std::path::Path;

use binseal_core::algo::MersenneTwister;
use binseal_core::algo::hidden_string::{HiddenString, fragment_seed};
use binseal_core::{ElfImage, Result, integrity, payload, strings, strip};

use crate::encoders::SequenceEncoding;

pub fn protect_strings(elf: &Path, out: &Path) -> Result<()> {
    log::info!(
        target: "action.protect-strings",
        "starting to patch protected strings in '{}'",
        elf.display()
    );
    let mut image = ElfImage::load(elf)?;
    strings::patch_protected_strings(&mut image)?;
    image.save(out)?;
    log::info!(
        target: "action.protect-strings",
        "finished patching protected strings as '{}'",
        out.display()
    );
    Ok(())
}

pub fn hash_patch(elf: &Path, out: &Path) -> Result<()> {
    log::info!(
        target: "action.hash-patch",
        "starting to patch integrity mechanisms in '{}'",
        elf.display()
    );
    let mut image = ElfImage::load(elf)?;
    integrity::hash_patch(&mut image)?;
    image.save(out)?;
    log::info!(
        target: "action.hash-patch",
        "finished patching integrity mechanisms as '{}'",
        out.display()
    );
    Ok(())
}

pub fn strip_binary(elf: &Path, out: &Path) -> Result<()> {
    let image = ElfImage::load(elf)?;
    strip::strip_binary(&image, out)
}

pub fn write_payload_header(elf: &Path, out: &Path) -> Result<()> {
    let image = ElfImage::load(elf)?;
    payload::write_payload_header(&image, out)
}

pub fn generate_hidden_string(text: &str, seed: Option<u32>, long_seed: Option<u64>) -> Result<()> {
    let long_seed = long_seed.or_else(|| seed.map(fragment_seed));
    let hidden = HiddenString::new(text, long_seed);

    println!(
        "      Seed (Literal): {} / 0x{:08x}",
        hidden.short_seed, hidden.short_seed
    );
    println!(
        "     Seed (Fragment): {} / 0x{:016x}",
        hidden.long_seed, hidden.long_seed
    );
    println!("    Mask [hex-array]: {}", hidden.mask_hex_array());
    println!("         [ c-string]: {}", hidden.mask_c_string());
    Ok(())
}

pub fn generate_mt_sequence(
    seed: u32,
    skip: usize,
    count: usize,
    encoding: SequenceEncoding,
) -> Result<()> {
    log::info!(
        target: "action.generate-mt-sequence",
        "generating {count} values after skipping {skip} for seed {seed}"
    );
    let values = MersenneTwister::generate(seed, skip, count);
    print!("{}", encoding.render(seed, skip, &values));
    Ok(())
}
