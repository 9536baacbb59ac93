//! ELF64 file header parsing and serialisation.

use super::{EI_NIDENT, ELF_MAGIC, ElfError, ElfResult};

/// Indices into the e_ident array.
mod ident {
    pub const EI_CLASS: usize = 4;
    pub const EI_DATA: usize = 5;
}

/// ELF class byte values.
const ELFCLASS64: u8 = 2;

/// Machine type for x86-64.
const EM_X86_64: u16 = 0x3e;

/// Read a little-endian u64 at `offset`. Caller has bounds-checked.
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

/// ELF data encoding (endianness).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElfData {
    /// Little-endian (2's complement)
    Lsb = 1,
    /// Big-endian (2's complement)
    Msb = 2,
}

/// ELF64 file header.
///
/// Field names keep the `e_` prefix so the serialised layout is easy to
/// cross-check against the ELF64 definition.
#[derive(Debug, Clone)]
pub struct Elf64Header {
    /// Identification bytes (magic, class, encoding, ABI).
    pub e_ident: [u8; EI_NIDENT],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    /// Entry point virtual address.
    pub e_entry: u64,
    /// File offset of the program header table.
    pub e_phoff: u64,
    /// File offset of the section header table.
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    /// Index of the section-name string table.
    pub e_shstrndx: u16,
}

impl Elf64Header {
    /// Size of an ELF64 file header in bytes.
    pub const SIZE: usize = 64;

    /// Parse and validate a header from the start of a file image.
    ///
    /// Rejects anything that is not ELF64 / little-endian / x86-64; the
    /// patch toolchain emits x86-64 opcodes and has no business touching
    /// anything else.
    pub fn parse(data: &[u8]) -> ElfResult<Self> {
        if data.len() < Self::SIZE {
            return Err(ElfError::BufferTooSmall {
                needed: Self::SIZE,
                available: data.len(),
            });
        }

        if data[0..4] != ELF_MAGIC {
            return Err(ElfError::InvalidMagic);
        }

        let class = data[ident::EI_CLASS];
        if class != ELFCLASS64 {
            return Err(ElfError::UnsupportedClass(class));
        }

        let encoding = data[ident::EI_DATA];
        if encoding != ElfData::Lsb as u8 {
            return Err(ElfError::UnsupportedEncoding(encoding));
        }

        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        if e_machine != EM_X86_64 {
            return Err(ElfError::UnsupportedMachine(e_machine));
        }

        let mut e_ident = [0u8; EI_NIDENT];
        e_ident.copy_from_slice(&data[0..EI_NIDENT]);

        Ok(Self {
            e_ident,
            e_type: u16::from_le_bytes([data[16], data[17]]),
            e_machine,
            e_version: u32::from_le_bytes([data[20], data[21], data[22], data[23]]),
            e_entry: read_u64(data, 24),
            e_phoff: read_u64(data, 32),
            e_shoff: read_u64(data, 40),
            e_flags: u32::from_le_bytes([data[48], data[49], data[50], data[51]]),
            e_ehsize: u16::from_le_bytes([data[52], data[53]]),
            e_phentsize: u16::from_le_bytes([data[54], data[55]]),
            e_phnum: u16::from_le_bytes([data[56], data[57]]),
            e_shentsize: u16::from_le_bytes([data[58], data[59]]),
            e_shnum: u16::from_le_bytes([data[60], data[61]]),
            e_shstrndx: u16::from_le_bytes([data[62], data[63]]),
        })
    }

    /// Serialise back to the 64-byte on-disk representation.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..EI_NIDENT].copy_from_slice(&self.e_ident);
        bytes[16..18].copy_from_slice(&self.e_type.to_le_bytes());
        bytes[18..20].copy_from_slice(&self.e_machine.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.e_version.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.e_entry.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.e_phoff.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.e_shoff.to_le_bytes());
        bytes[48..52].copy_from_slice(&self.e_flags.to_le_bytes());
        bytes[52..54].copy_from_slice(&self.e_ehsize.to_le_bytes());
        bytes[54..56].copy_from_slice(&self.e_phentsize.to_le_bytes());
        bytes[56..58].copy_from_slice(&self.e_phnum.to_le_bytes());
        bytes[58..60].copy_from_slice(&self.e_shentsize.to_le_bytes());
        bytes[60..62].copy_from_slice(&self.e_shnum.to_le_bytes());
        bytes[62..64].copy_from_slice(&self.e_shstrndx.to_le_bytes());
        bytes
    }

    /// Rewrite the declared data encoding byte.
    ///
    /// The stripper flips this to big-endian as an obfuscation: there is no
    /// big-endian x86-64, the kernel loader ignores the byte, but analysis
    /// tools trip over it.
    pub fn set_data_encoding(&mut self, encoding: ElfData) {
        self.e_ident[ident::EI_DATA] = encoding as u8;
    }
}
