//! Tiny x86-64 instruction emitter.
//!
//! The patchers only ever emit a fixed instruction vocabulary, so instead of
//! a general assembler each supported instruction is an [`Insn`] variant
//! with a constant encoded length. RIP-relative operands take the absolute
//! target virtual address and compute the displacement at encode time, when
//! the instruction's own address is known.

use std::fmt;

/// One x86-64 instruction from the emitter's fixed vocabulary.
///
/// `RawByte` is a literal pass-through: it is emitted verbatim and is not
/// generally expected to be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    /// `inc rbx`: `48 FF C3`
    IncRbx,
    /// `dec rbx`: `48 FF CB`
    DecRbx,
    /// `add rbx, imm8`: `48 83 C3 ib`
    AddRbxImm8(u8),
    /// `sub rbx, imm8`: `48 83 EB ib`
    SubRbxImm8(u8),
    /// `mov BYTE PTR [rbx], imm8`: `C6 03 ib`
    MovBytePtrRbxImm8(u8),
    /// `mov DWORD PTR [rbx+imm8], imm32`: `C7 43 ib id`
    MovDwordPtrRbxOffImm32 { offset: i8, value: u32 },
    /// `mov cl, imm8`: `B1 ib`
    MovClImm8(u8),
    /// `shl rdx, cl`: `48 D3 E2`
    ShlRdxCl,
    /// `xor dl, imm8`: `80 F2 ib`
    XorDlImm8(u8),
    /// `xor dl, BYTE PTR [rip+disp32]`: `32 15 id`
    XorDlBytePtrRip { target: u64 },
    /// `xor rax, rdx`: `48 31 D0`
    XorRaxRdx,
    /// `mov eax, DWORD PTR [rip+disp32]`: `8B 05 id`
    MovEaxDwordPtrRip { target: u64 },
    /// `mov rax, QWORD PTR [rip+disp32]`: `48 8B 05 id`
    MovRaxQwordPtrRip { target: u64 },
    /// `mov DWORD PTR [rbx], eax`: `89 03`
    MovDwordPtrRbxEax,
    /// `mov QWORD PTR [rbx], rax`: `48 89 03`
    MovQwordPtrRbxRax,
    /// `lea rbx, [rip+disp32]`: `48 8D 1D id`
    LeaRbxRip { target: u64 },
    /// `jmp rel8`: `EB ib` (displacement relative to the next instruction)
    JmpRel8(i8),
    /// A raw byte emitted verbatim.
    RawByte(u8),
}

impl Insn {
    /// Encoded length in bytes. Constant per variant.
    pub fn length(self) -> usize {
        match self {
            Insn::IncRbx | Insn::DecRbx => 3,
            Insn::AddRbxImm8(_) | Insn::SubRbxImm8(_) => 4,
            Insn::MovBytePtrRbxImm8(_) => 3,
            Insn::MovDwordPtrRbxOffImm32 { .. } => 7,
            Insn::MovClImm8(_) => 2,
            Insn::ShlRdxCl => 3,
            Insn::XorDlImm8(_) => 3,
            Insn::XorDlBytePtrRip { .. } => 6,
            Insn::XorRaxRdx => 3,
            Insn::MovEaxDwordPtrRip { .. } => 6,
            Insn::MovRaxQwordPtrRip { .. } => 7,
            Insn::MovDwordPtrRbxEax => 2,
            Insn::MovQwordPtrRbxRax => 3,
            Insn::LeaRbxRip { .. } => 7,
            Insn::JmpRel8(_) => 2,
            Insn::RawByte(_) => 1,
        }
    }

    /// Displacement from this instruction to `target`.
    ///
    /// RIP points past the current instruction by the time the operand is
    /// evaluated, so the base is `current_va + length()`. The result must
    /// fit in an `i32`; keeping it in range is the caller's responsibility
    /// (all emitted references stay within one section).
    fn rip_disp(self, current_va: u64, target: u64) -> i32 {
        let disp = (target as i64).wrapping_sub(current_va as i64 + self.length() as i64);
        debug_assert!(i32::try_from(disp).is_ok(), "rip displacement overflow");
        disp as i32
    }

    /// Encode this instruction as placed at `current_va`.
    pub fn encode(self, current_va: u64) -> Vec<u8> {
        let bytes = match self {
            Insn::IncRbx => vec![0x48, 0xff, 0xc3],
            Insn::DecRbx => vec![0x48, 0xff, 0xcb],
            Insn::AddRbxImm8(value) => vec![0x48, 0x83, 0xc3, value],
            Insn::SubRbxImm8(value) => vec![0x48, 0x83, 0xeb, value],
            Insn::MovBytePtrRbxImm8(value) => vec![0xc6, 0x03, value],
            Insn::MovDwordPtrRbxOffImm32 { offset, value } => {
                let mut bytes = vec![0xc7, 0x43, offset as u8];
                bytes.extend_from_slice(&value.to_le_bytes());
                bytes
            }
            Insn::MovClImm8(value) => vec![0xb1, value],
            Insn::ShlRdxCl => vec![0x48, 0xd3, 0xe2],
            Insn::XorDlImm8(value) => vec![0x80, 0xf2, value],
            Insn::XorDlBytePtrRip { target } => {
                let mut bytes = vec![0x32, 0x15];
                bytes.extend_from_slice(&self.rip_disp(current_va, target).to_le_bytes());
                bytes
            }
            Insn::XorRaxRdx => vec![0x48, 0x31, 0xd0],
            Insn::MovEaxDwordPtrRip { target } => {
                let mut bytes = vec![0x8b, 0x05];
                bytes.extend_from_slice(&self.rip_disp(current_va, target).to_le_bytes());
                bytes
            }
            Insn::MovRaxQwordPtrRip { target } => {
                let mut bytes = vec![0x48, 0x8b, 0x05];
                bytes.extend_from_slice(&self.rip_disp(current_va, target).to_le_bytes());
                bytes
            }
            Insn::MovDwordPtrRbxEax => vec![0x89, 0x03],
            Insn::MovQwordPtrRbxRax => vec![0x48, 0x89, 0x03],
            Insn::LeaRbxRip { target } => {
                let mut bytes = vec![0x48, 0x8d, 0x1d];
                bytes.extend_from_slice(&self.rip_disp(current_va, target).to_le_bytes());
                bytes
            }
            Insn::JmpRel8(disp) => vec![0xeb, disp as u8],
            Insn::RawByte(value) => vec![value],
        };
        debug_assert_eq!(bytes.len(), self.length());
        bytes
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::IncRbx => write!(f, "inc    rbx"),
            Insn::DecRbx => write!(f, "dec    rbx"),
            Insn::AddRbxImm8(v) => write!(f, "add    rbx, 0x{v:02x}"),
            Insn::SubRbxImm8(v) => write!(f, "sub    rbx, 0x{v:02x}"),
            Insn::MovBytePtrRbxImm8(v) => write!(f, "mov    BYTE PTR [rbx], 0x{v:02x}"),
            Insn::MovDwordPtrRbxOffImm32 { offset, value } => {
                write!(f, "mov    DWORD PTR [rbx+0x{offset:02x}], 0x{value:08x}")
            }
            Insn::MovClImm8(v) => write!(f, "mov    cl, 0x{v:02x}"),
            Insn::ShlRdxCl => write!(f, "shl    rdx, cl"),
            Insn::XorDlImm8(v) => write!(f, "xor    dl, 0x{v:02x}"),
            Insn::XorDlBytePtrRip { target } => {
                write!(f, "xor    dl, BYTE PTR [rip] # 0x{target:08x}")
            }
            Insn::XorRaxRdx => write!(f, "xor    rax, rdx"),
            Insn::MovEaxDwordPtrRip { target } => {
                write!(f, "mov    eax, DWORD PTR [rip] # 0x{target:08x}")
            }
            Insn::MovRaxQwordPtrRip { target } => {
                write!(f, "mov    rax, QWORD PTR [rip] # 0x{target:08x}")
            }
            Insn::MovDwordPtrRbxEax => write!(f, "mov    DWORD PTR [rbx], eax"),
            Insn::MovQwordPtrRbxRax => write!(f, "mov    QWORD PTR [rbx], rax"),
            Insn::LeaRbxRip { target } => write!(f, "lea    rbx, [rip] # 0x{target:08x}"),
            Insn::JmpRel8(disp) => write!(f, "jmp    {disp:+}"),
            Insn::RawByte(v) => write!(f, "JUNK(0x{v:02x})"),
        }
    }
}

/// An ordered list of instructions encoded back to back.
#[derive(Debug, Clone, Default)]
pub struct Block {
    insns: Vec<Insn>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, insn: Insn) {
        self.insns.push(insn);
    }

    pub fn extend(&mut self, other: Block) {
        self.insns.extend(other.insns);
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    /// Total encoded length of the block.
    pub fn encoded_length(&self) -> usize {
        self.insns.iter().map(|insn| insn.length()).sum()
    }

    /// Encode the block as placed at `start_va`, threading each
    /// instruction its own address.
    pub fn encode(&self, start_va: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_length());
        let mut current_va = start_va;
        for insn in &self.insns {
            bytes.extend_from_slice(&insn.encode(current_va));
            current_va += insn.length() as u64;
        }
        bytes
    }

    /// Addresses at which raw bytes land when the block is placed at
    /// `start_va`. Used to register junk bytes with the patch manifest.
    pub fn raw_byte_vas(&self, start_va: u64) -> Vec<u64> {
        let mut vas = Vec::new();
        let mut current_va = start_va;
        for insn in &self.insns {
            if matches!(insn, Insn::RawByte(_)) {
                vas.push(current_va);
            }
            current_va += insn.length() as u64;
        }
        vas
    }
}

impl FromIterator<Insn> for Block {
    fn from_iter<I: IntoIterator<Item = Insn>>(iter: I) -> Self {
        Self {
            insns: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<Insn> {
        vec![
            Insn::IncRbx,
            Insn::DecRbx,
            Insn::AddRbxImm8(0x7f),
            Insn::SubRbxImm8(0x10),
            Insn::MovBytePtrRbxImm8(b'A'),
            Insn::MovDwordPtrRbxOffImm32 {
                offset: 0x0c,
                value: 0xdead_beef,
            },
            Insn::MovClImm8(8),
            Insn::ShlRdxCl,
            Insn::XorDlImm8(0x55),
            Insn::XorDlBytePtrRip { target: 0x401234 },
            Insn::XorRaxRdx,
            Insn::MovEaxDwordPtrRip { target: 0x401000 },
            Insn::MovRaxQwordPtrRip { target: 0x401000 },
            Insn::MovDwordPtrRbxEax,
            Insn::MovQwordPtrRbxRax,
            Insn::LeaRbxRip { target: 0x400000 },
            Insn::JmpRel8(1),
            Insn::RawByte(0xcc),
        ]
    }

    #[test]
    fn test_encoded_length_matches_declared() {
        // Sweep VAs across a 48-bit range; lengths never depend on address.
        for shift in [0u64, 12, 24, 36, 47] {
            let va = 0x400000u64 << (shift / 4);
            for insn in all_variants() {
                assert_eq!(insn.encode(va).len(), insn.length(), "{insn}");
            }
        }
    }

    #[test]
    fn test_rip_displacement_round_trip() {
        let cases = [
            (0x40_0000u64, 0x40_1000u64),
            (0x40_1000, 0x40_0000),
            (0x7fff_f000, 0x7fff_f000),
        ];
        for (cur, target) in cases {
            let insn = Insn::MovRaxQwordPtrRip { target };
            let bytes = insn.encode(cur);
            let disp = i32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
            assert_eq!(i64::from(disp), target as i64 - (cur as i64 + 7));
        }
    }

    #[test]
    fn test_xor_dl_rip_encoding() {
        // disp = target - (cur + 6)
        let insn = Insn::XorDlBytePtrRip { target: 0x400100 };
        let bytes = insn.encode(0x400000);
        assert_eq!(&bytes[..2], &[0x32, 0x15]);
        assert_eq!(
            i32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            0x100 - 6
        );
    }

    #[test]
    fn test_backwards_jmp_is_signed() {
        let bytes = Insn::JmpRel8(-9).encode(0);
        assert_eq!(bytes, vec![0xeb, 0xf7]);
    }

    #[test]
    fn test_block_encodes_sequentially() {
        let mut block = Block::new();
        block.push(Insn::IncRbx);
        block.push(Insn::LeaRbxRip { target: 0x40000a });
        let bytes = block.encode(0x400000);

        assert_eq!(block.encoded_length(), 10);
        assert_eq!(bytes.len(), 10);
        // lea sits at 0x400003; disp = 0x40000a - (0x400003 + 7) = 0.
        assert_eq!(&bytes[3..6], &[0x48, 0x8d, 0x1d]);
        assert_eq!(&bytes[6..10], &0i32.to_le_bytes());
    }

    #[test]
    fn test_raw_byte_vas() {
        let mut block = Block::new();
        block.push(Insn::JmpRel8(1));
        block.push(Insn::RawByte(0xaa));
        block.push(Insn::IncRbx);
        block.push(Insn::RawByte(0xbb));
        assert_eq!(block.raw_byte_vas(0x1000), vec![0x1002, 0x1006]);
    }
}
