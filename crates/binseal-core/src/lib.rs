//! # binseal-core
//!
//! Post-link self-protection toolchain for x86-64 ELF binaries.
//!
//! The library consumes a freshly linked ELF that carries specially named
//! marker sections (`.protected-string-entry.*`, `.hash-patch.*`) and
//! transforms it into a binary that unpacks its own strings through
//! randomised instruction sequences and verifies itself through a chain of
//! Murmur-style hashes computed over its code section at load time. Two
//! further passes turn the patched binary into a self-extracting blob: a
//! stripper that collapses it to a single loadable segment, and a payload
//! emitter that wraps the code bytes in a C header for a 32-bit launcher.

#![deny(unsafe_code)]

pub mod algo;
pub mod elf;
pub mod error;
pub mod integrity;
pub mod manifest;
pub mod markers;
pub mod payload;
pub mod strings;
pub mod strip;
pub mod volatile;
pub mod x64;

pub use elf::image::ElfImage;
pub use error::{PatchError, Result};
pub use manifest::PatchManifest;
