//! Shared fixtures for the integration tests: a synthetic ELF64 builder
//! and a minimal x86-64 interpreter covering exactly the emitter's
//! instruction set.
//!
//! The synthesis being randomised, tests never compare patched bytes
//! against golden output; they decode or simulate what was actually
//! emitted.

#![allow(dead_code)]

use std::path::PathBuf;

use binseal_core::manifest::PatchManifest;
use binseal_core::ElfImage;

/// Load address of the fixture's single file-covering segment.
pub const BASE_VA: u64 = 0x40_0000;

/// File offset (and so VA offset) the `.text` payload is placed at.
const TEXT_OFFSET: usize = 0x100;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;

const SHT_PROGBITS: u32 = 1;
const SHT_STRTAB: u32 = 3;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;

/// Virtual address of the fixture's `.text` section.
pub fn text_va() -> u64 {
    BASE_VA + TEXT_OFFSET as u64
}

/// Builds a small but structurally honest ELF64 executable: one segment
/// mapping the whole file at [`BASE_VA`], a `.text` section with caller
/// supplied bytes, and any number of (unallocated) marker sections.
pub struct FixtureBuilder {
    text: Vec<u8>,
    entry_offset: u64,
    markers: Vec<(String, Vec<u8>)>,
    extra_segments: bool,
}

impl FixtureBuilder {
    pub fn new(text: Vec<u8>) -> Self {
        Self {
            text,
            entry_offset: 0,
            markers: Vec::new(),
            extra_segments: false,
        }
    }

    /// Entry point, as an offset into `.text`.
    pub fn entry(mut self, offset: u64) -> Self {
        self.entry_offset = offset;
        self
    }

    /// Add a marker section (not allocated, payload lives in the file).
    pub fn marker(mut self, name: &str, data: Vec<u8>) -> Self {
        self.markers.push((name.to_owned(), data));
        self
    }

    /// Add two more segments so the program header table has three
    /// entries (an empty high PT_LOAD and a GNU_STACK note).
    pub fn extra_segments(mut self) -> Self {
        self.extra_segments = true;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let segment_count: u16 = if self.extra_segments { 3 } else { 1 };

        // section name string table
        let mut names = vec![0u8];
        let mut name_offsets = Vec::new();
        for name in std::iter::once(".text")
            .chain(self.markers.iter().map(|(name, _)| name.as_str()))
            .chain(std::iter::once(".shstrtab"))
        {
            name_offsets.push(names.len() as u32);
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }

        // file layout: headers | .text | marker payloads | shstrtab | shdrs
        let mut body = vec![0u8; TEXT_OFFSET];
        assert!(EHDR_SIZE + segment_count as usize * PHDR_SIZE <= TEXT_OFFSET);

        let text_off = body.len();
        body.extend_from_slice(&self.text);

        let mut marker_offs = Vec::new();
        for (_, data) in &self.markers {
            marker_offs.push(body.len());
            body.extend_from_slice(data);
        }

        let names_off = body.len();
        body.extend_from_slice(&names);

        let shoff = body.len();
        let section_count = 3 + self.markers.len(); // null + .text + markers + shstrtab

        // null section
        body.extend_from_slice(&[0u8; SHDR_SIZE]);
        // .text
        body.extend_from_slice(&section_header(
            name_offsets[0],
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            BASE_VA + text_off as u64,
            text_off as u64,
            self.text.len() as u64,
        ));
        // markers
        for (index, (_, data)) in self.markers.iter().enumerate() {
            body.extend_from_slice(&section_header(
                name_offsets[1 + index],
                SHT_PROGBITS,
                0,
                0,
                marker_offs[index] as u64,
                data.len() as u64,
            ));
        }
        // .shstrtab
        body.extend_from_slice(&section_header(
            name_offsets[1 + self.markers.len()],
            SHT_STRTAB,
            0,
            0,
            names_off as u64,
            names.len() as u64,
        ));

        let file_len = body.len() as u64;

        // ELF header
        body[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        body[4] = 2; // ELF64
        body[5] = 1; // little-endian
        body[6] = 1; // version
        put_u16(&mut body, 16, 2); // ET_EXEC
        put_u16(&mut body, 18, 0x3e); // x86-64
        put_u32(&mut body, 20, 1);
        put_u64(&mut body, 24, BASE_VA + text_off as u64 + self.entry_offset);
        put_u64(&mut body, 32, EHDR_SIZE as u64); // e_phoff
        put_u64(&mut body, 40, shoff as u64); // e_shoff
        put_u16(&mut body, 52, EHDR_SIZE as u16);
        put_u16(&mut body, 54, PHDR_SIZE as u16);
        put_u16(&mut body, 56, segment_count);
        put_u16(&mut body, 58, SHDR_SIZE as u16);
        put_u16(&mut body, 60, section_count as u16);
        put_u16(&mut body, 62, (section_count - 1) as u16); // shstrndx

        // program headers
        let phdr = program_header(1, 0x5, 0, BASE_VA, file_len, file_len);
        body[EHDR_SIZE..EHDR_SIZE + PHDR_SIZE].copy_from_slice(&phdr);
        if self.extra_segments {
            let high = program_header(1, 0x6, 0, BASE_VA + 0x20_0000, 0, 0x1000);
            body[EHDR_SIZE + PHDR_SIZE..EHDR_SIZE + 2 * PHDR_SIZE].copy_from_slice(&high);
            let stack = program_header(0x6474_e551, 0x6, 0, 0, 0, 0);
            body[EHDR_SIZE + 2 * PHDR_SIZE..EHDR_SIZE + 3 * PHDR_SIZE].copy_from_slice(&stack);
        }

        body
    }

    pub fn image(self) -> ElfImage {
        let bytes = self.build();
        ElfImage::from_bytes(
            PathBuf::from("/tmp/fixture.elf"),
            bytes,
            PatchManifest::default(),
        )
        .expect("fixture should parse")
    }
}

fn put_u16(body: &mut [u8], offset: usize, value: u16) {
    body[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(body: &mut [u8], offset: usize, value: u32) {
    body[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(body: &mut [u8], offset: usize, value: u64) {
    body[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn section_header(
    name: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
) -> [u8; SHDR_SIZE] {
    let mut raw = [0u8; SHDR_SIZE];
    raw[0..4].copy_from_slice(&name.to_le_bytes());
    raw[4..8].copy_from_slice(&sh_type.to_le_bytes());
    raw[8..16].copy_from_slice(&flags.to_le_bytes());
    raw[16..24].copy_from_slice(&addr.to_le_bytes());
    raw[24..32].copy_from_slice(&offset.to_le_bytes());
    raw[32..40].copy_from_slice(&size.to_le_bytes());
    raw[48..56].copy_from_slice(&16u64.to_le_bytes()); // addralign
    raw
}

fn program_header(
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
) -> [u8; PHDR_SIZE] {
    let mut raw = [0u8; PHDR_SIZE];
    raw[0..4].copy_from_slice(&p_type.to_le_bytes());
    raw[4..8].copy_from_slice(&flags.to_le_bytes());
    raw[8..16].copy_from_slice(&offset.to_le_bytes());
    raw[16..24].copy_from_slice(&vaddr.to_le_bytes());
    raw[24..32].copy_from_slice(&vaddr.to_le_bytes());
    raw[32..40].copy_from_slice(&filesz.to_le_bytes());
    raw[40..48].copy_from_slice(&memsz.to_le_bytes());
    raw[48..56].copy_from_slice(&0x1000u64.to_le_bytes());
    raw
}

/// Marker payload for a `.protected-string-entry.*` section.
pub fn protected_string_payload(label_va: u64, reservation_size: u32, text: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&label_va.to_le_bytes());
    payload.extend_from_slice(&reservation_size.to_le_bytes());
    payload.extend_from_slice(text);
    payload.push(0);
    payload
}

/// Marker payload for a `.hash-patch.*` section.
pub fn hash_patch_payload(start_va: u64, end_va: u64, action: i64, meta: [u8; 256]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&start_va.to_le_bytes());
    payload.extend_from_slice(&end_va.to_le_bytes());
    payload.extend_from_slice(&action.to_le_bytes());
    payload.extend_from_slice(&meta);
    payload
}

pub fn incremental_meta(chain: &str) -> [u8; 256] {
    let mut meta = [0u8; 256];
    meta[..chain.len()].copy_from_slice(chain.as_bytes());
    meta
}

pub fn generator_meta(reserved_volatile_qwords: u64) -> [u8; 256] {
    let mut meta = [0u8; 256];
    meta[..8].copy_from_slice(&reserved_volatile_qwords.to_le_bytes());
    meta
}

pub fn xor_to_known_meta(required_value: u64, order: u64, chain: &str) -> [u8; 256] {
    let mut meta = [0u8; 256];
    meta[0..8].copy_from_slice(&required_value.to_le_bytes());
    meta[8..16].copy_from_slice(&order.to_le_bytes());
    meta[16..16 + chain.len()].copy_from_slice(chain.as_bytes());
    meta
}

pub fn insert_murmur_meta(buffer: &[u8], order: u64, chain: &str) -> [u8; 256] {
    let mut meta = [0u8; 256];
    meta[0..4].copy_from_slice(&(buffer.len() as u32).to_le_bytes());
    meta[4..12].copy_from_slice(&order.to_le_bytes());
    meta[12..12 + buffer.len()].copy_from_slice(buffer);
    let chain_off = 12 + buffer.len();
    meta[chain_off..chain_off + chain.len()].copy_from_slice(chain.as_bytes());
    meta
}

/// A filler byte pattern free of `0x00` and `0x90` (usable as XOR source
/// material).
pub fn palette(len: usize) -> Vec<u8> {
    (0..len)
        .map(|index| {
            let byte = (index % 0x7e) as u8 + 1;
            if byte == 0x90 { 0x91 } else { byte }
        })
        .collect()
}

/// Minimal x86-64 interpreter for the emitter's instruction set.
///
/// Flags are ignored entirely; memory is a set of disjoint mapped
/// regions.
pub struct Simulator {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    regions: Vec<(u64, Vec<u8>)>,
}

impl Simulator {
    pub fn new() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            regions: Vec::new(),
        }
    }

    pub fn map(&mut self, base: u64, bytes: Vec<u8>) {
        self.regions.push((base, bytes));
    }

    pub fn read_u8(&self, va: u64) -> u8 {
        for (base, bytes) in &self.regions {
            if va >= *base && va < base + bytes.len() as u64 {
                return bytes[(va - base) as usize];
            }
        }
        panic!("simulated read of unmapped address {va:#x}");
    }

    pub fn read_bytes(&self, va: u64, len: usize) -> Vec<u8> {
        (0..len as u64).map(|i| self.read_u8(va + i)).collect()
    }

    pub fn write_u8(&mut self, va: u64, value: u8) {
        for (base, bytes) in &mut self.regions {
            if va >= *base && va < *base + bytes.len() as u64 {
                bytes[(va - *base) as usize] = value;
                return;
            }
        }
        panic!("simulated write of unmapped address {va:#x}");
    }

    fn write_bytes(&mut self, va: u64, bytes: &[u8]) {
        for (index, &byte) in bytes.iter().enumerate() {
            self.write_u8(va + index as u64, byte);
        }
    }

    fn disp32(&self, va: u64) -> i64 {
        let bytes = self.read_bytes(va, 4);
        i64::from(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Execute from `start` until RIP reaches or passes `end`.
    pub fn run(&mut self, start: u64, end: u64) {
        let mut rip = start;
        let mut steps = 0u32;

        while rip < end {
            steps += 1;
            assert!(steps < 100_000, "runaway simulation at {rip:#x}");

            match self.read_u8(rip) {
                0x90 => rip += 1, // nop
                0xeb => {
                    let disp = self.read_u8(rip + 1) as i8;
                    rip = (rip + 2).wrapping_add_signed(i64::from(disp));
                }
                0xc6 => {
                    // mov BYTE PTR [rbx], imm8 (C6 03)
                    assert_eq!(self.read_u8(rip + 1), 0x03);
                    let value = self.read_u8(rip + 2);
                    self.write_u8(self.rbx, value);
                    rip += 3;
                }
                0xc7 => {
                    // mov DWORD PTR [rbx+imm8], imm32 (C7 43)
                    assert_eq!(self.read_u8(rip + 1), 0x43);
                    let offset = self.read_u8(rip + 2) as i8;
                    let value = self.read_bytes(rip + 3, 4);
                    let target = self.rbx.wrapping_add_signed(i64::from(offset));
                    self.write_bytes(target, &value);
                    rip += 7;
                }
                0xb1 => {
                    // mov cl, imm8
                    self.rcx = (self.rcx & !0xff) | u64::from(self.read_u8(rip + 1));
                    rip += 2;
                }
                0x80 => {
                    // xor dl, imm8 (80 F2)
                    assert_eq!(self.read_u8(rip + 1), 0xf2);
                    self.rdx ^= u64::from(self.read_u8(rip + 2));
                    rip += 3;
                }
                0x32 => {
                    // xor dl, BYTE PTR [rip+disp32] (32 15)
                    assert_eq!(self.read_u8(rip + 1), 0x15);
                    let target = (rip + 6).wrapping_add_signed(self.disp32(rip + 2));
                    self.rdx ^= u64::from(self.read_u8(target));
                    rip += 6;
                }
                0x8b => {
                    // mov eax, DWORD PTR [rip+disp32] (8B 05); zero-extends
                    assert_eq!(self.read_u8(rip + 1), 0x05);
                    let target = (rip + 6).wrapping_add_signed(self.disp32(rip + 2));
                    let bytes = self.read_bytes(target, 4);
                    self.rax =
                        u64::from(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
                    rip += 6;
                }
                0x89 => {
                    // mov DWORD PTR [rbx], eax (89 03)
                    assert_eq!(self.read_u8(rip + 1), 0x03);
                    let value = (self.rax as u32).to_le_bytes();
                    self.write_bytes(self.rbx, &value);
                    rip += 2;
                }
                0x48 => {
                    rip = self.step_rex(rip);
                }
                other => panic!("unsupported opcode {other:#04x} at {rip:#x}"),
            }
        }
    }

    /// Instructions behind a REX.W prefix.
    fn step_rex(&mut self, rip: u64) -> u64 {
        match (self.read_u8(rip + 1), self.read_u8(rip + 2)) {
            (0xff, 0xc3) => {
                self.rbx = self.rbx.wrapping_add(1);
                rip + 3
            }
            (0xff, 0xcb) => {
                self.rbx = self.rbx.wrapping_sub(1);
                rip + 3
            }
            (0x83, 0xc3) => {
                self.rbx = self.rbx.wrapping_add(u64::from(self.read_u8(rip + 3)));
                rip + 4
            }
            (0x83, 0xeb) => {
                self.rbx = self.rbx.wrapping_sub(u64::from(self.read_u8(rip + 3)));
                rip + 4
            }
            (0xd3, 0xe2) => {
                // shl rdx, cl (count masked to 6 bits)
                self.rdx = self.rdx.wrapping_shl((self.rcx as u32) & 0x3f);
                rip + 3
            }
            (0x31, 0xd0) => {
                self.rax ^= self.rdx;
                rip + 3
            }
            (0x8b, 0x05) => {
                let target = (rip + 7).wrapping_add_signed(self.disp32(rip + 3));
                let bytes = self.read_bytes(target, 8);
                self.rax = u64::from_le_bytes(bytes.try_into().unwrap());
                rip + 7
            }
            (0x89, 0x03) => {
                let value = self.rax.to_le_bytes();
                self.write_bytes(self.rbx, &value);
                rip + 3
            }
            (0x8d, 0x1d) => {
                self.rbx = (rip + 7).wrapping_add_signed(self.disp32(rip + 3));
                rip + 7
            }
            (b1, b2) => panic!("unsupported REX instruction 48 {b1:02x} {b2:02x} at {rip:#x}"),
        }
    }
}
