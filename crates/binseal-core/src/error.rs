//! Error types shared across the patch toolchain.
//!
//! Structural ELF parse failures keep their own [`elf::ElfError`] type and
//! are converted at the boundary; everything the patchers themselves can
//! fail with lives in [`PatchError`].

use thiserror::Error;

use crate::elf::ElfError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PatchError>;

/// Failure modes of the patch toolchain.
#[derive(Debug, Error)]
pub enum PatchError {
    /// A `.hash-patch.*` record carried an action value we do not know.
    #[error("unsupported hash-action identifier ({action})")]
    UnsupportedHashAction { action: i64 },

    /// More volatile QWORDs than the runtime generator can iterate.
    ///
    /// The generator builds its skip table with `mov DWORD PTR [rbx+imm8]`
    /// stores; the signed 8-bit offset caps the table at 32 entries, two of
    /// which are reserved for the end and stop markers.
    #[error("got {found} volatile QWORDs, the generator supports at most 30")]
    TooManyVolatileQwords { found: usize },

    /// Chain synthesis could not fit the reservation after all retries.
    #[error(
        "giving up on a gadget chain for '{section}' that fits the \
         {size} byte reservation after {attempts} attempts"
    )]
    ReservationTooSmall {
        section: String,
        size: u32,
        attempts: u32,
    },

    /// No acceptable XOR source sequence could be found in the section.
    #[error(
        "attempted to find an XOR solution without forbidden bytes in \
         {section}, but failed after {attempts} attempts"
    )]
    XorSourceExhausted { section: String, attempts: u32 },

    /// An expected magic placeholder pattern was absent.
    #[error("placeholder {pattern} not found in scope of {section}")]
    PlaceholderNotFound {
        pattern: &'static str,
        section: String,
    },

    /// A generator reserved fewer skip-table slots than are needed.
    #[error(
        "generator identified by section {section} reserved space for \
         {reserved} volatile QWORDs but it needs space for {needed}"
    )]
    GeneratorSlotsTooFew {
        section: String,
        reserved: usize,
        needed: usize,
    },

    /// The generator's NOP reservation was missing or ambiguous.
    #[error("expected exactly one {size}-byte NOP reservation in {section}, found {matches}")]
    DuplicateReservationMatch {
        section: String,
        size: usize,
        matches: usize,
    },

    /// A queried address does not fall into any section.
    #[error("address {va:#018x} does not fall into any section")]
    AddressInNoSection { va: u64 },

    /// A queried address falls into several (overlapping?) sections.
    #[error("address {va:#018x} appears in {count} overlapping sections")]
    AddressInMultipleSections { va: u64, count: usize },

    /// A virtual address is outside every loadable segment.
    #[error("address {va:#018x} is not mapped by any loadable segment")]
    UnmappedAddress { va: u64 },

    /// A write collided with one or more registered data dependencies.
    #[error(
        "attempted to write {len} bytes at {va:#018x}, but this clobbers \
         registered data dependencies:\n{collisions}"
    )]
    WriteClobbersDependency {
        va: u64,
        len: usize,
        collisions: String,
    },

    /// A marker section failed to decode.
    #[error("malformed marker section {section}: {reason}")]
    MalformedMarkerSection { section: String, reason: String },

    /// A volatile QWORD is not 8-aligned relative to its section base.
    #[error("volatile QWORD at {va:#018x} is not 8-byte aligned within its section")]
    MisalignedVolatileQword { va: u64 },

    /// An incremental integrity chain violated its layering rules.
    #[error("integrity chain '{chain}': {reason}")]
    InvalidIntegrityChain { chain: String, reason: String },

    /// Structural ELF parse failure.
    #[error("elf: {0}")]
    Elf(#[from] ElfError),

    /// Underlying disk I/O failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
