//! ELF64 parsing and the mutable patch workspace.
//!
//! Only what the patch toolchain needs: the file header, section headers
//! (with resolved names) and program headers, parsed from and serialised
//! back to raw little-endian bytes. Symbols, relocations and dynamic
//! linking information are never consulted; the patchers operate on the
//! section table and raw bytes alone.

pub mod header;
pub mod image;
pub mod program;
pub mod section;

use thiserror::Error;

pub use header::{Elf64Header, ElfData};
pub use image::{ElfImage, PatchSnapshot, Section};
pub use program::{Elf64ProgramHeader, ProgramType};
pub use section::{Elf64SectionHeader, SectionType};

/// ELF magic bytes: `\x7fELF`.
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Size of the ELF identification array.
pub const EI_NIDENT: usize = 16;

/// Structural parse failures for ELF input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ElfError {
    #[error("invalid ELF magic bytes")]
    InvalidMagic,
    #[error("unsupported ELF class ({0}), expected ELF64")]
    UnsupportedClass(u8),
    #[error("unsupported data encoding ({0}), expected little-endian")]
    UnsupportedEncoding(u8),
    #[error("unsupported machine type ({0:#x}), expected x86-64")]
    UnsupportedMachine(u16),
    #[error("buffer too small: needed {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("invalid {kind} offset {offset:#x}")]
    InvalidOffset { kind: &'static str, offset: u64 },
    #[error("no loadable segment declared")]
    MissingLoadSegment,
}

/// Result alias for ELF parsing.
pub type ElfResult<T> = Result<T, ElfError>;
