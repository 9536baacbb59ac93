//! Launcher payload emission.
//!
//! The 32-bit launcher carries the stripped 64-bit binary inside its own
//! `.text` and unpacks it at runtime. This module reads the code bytes out
//! of the stripped ELF, obfuscates them with a "fizz-buzz" XOR stream and
//! renders the C header the launcher build compiles in.

use chrono::Utc;
use rand::Rng;

use crate::elf::image::ElfImage;
use crate::error::Result;

const TARGET: &str = "action.write-payload-header";

/// Bytes rendered per `.byte` line in the generated header.
const BYTES_PER_LINE: usize = 32;

/// The obfuscated payload and the parameters needed to unpack it.
pub struct PayloadConfig {
    /// Payload bytes, already XORed with the fizz-buzz stream.
    pub payload: Vec<u8>,
    /// Byte offset into the payload where execution starts.
    pub entry: u64,
    pub fizz: u8,
    pub fizz_up: u8,
    pub buzz: u8,
    pub buzz_up: u8,
}

/// The fizz-buzz XOR key stream.
///
/// The key starts at 1 and is bumped at every index: by `fizz_up` on
/// multiples of `fizz`, by `buzz_up` on multiples of `buzz`, and by 1 when
/// neither divides the index. Truncated to a byte at each step.
pub fn fizzbuzz_stream(length: usize, fizz: u8, fizz_up: u8, buzz: u8, buzz_up: u8) -> Vec<u8> {
    let fizz = usize::from(fizz);
    let buzz = usize::from(buzz);
    let mut key: u8 = 1;

    (0..length)
        .map(|index| {
            if index % fizz == 0 {
                key = key.wrapping_add(fizz_up);
            }
            if index % buzz == 0 {
                key = key.wrapping_add(buzz_up);
            }
            if index % fizz != 0 && index % buzz != 0 {
                key = key.wrapping_add(1);
            }
            key
        })
        .collect()
}

impl PayloadConfig {
    /// Extract the section containing the entry point and obfuscate it
    /// with randomly drawn stream parameters.
    pub fn from_image(image: &ElfImage) -> Result<Self> {
        let section = image.section_containing(image.entry_va())?;
        let payload = image.section_bytes(&section).to_vec();
        let entry = image.entry_va() - section.start();

        let mut rng = rand::rng();
        let (fizz, fizz_up, buzz, buzz_up) = (
            rng.random_range(1..=255),
            rng.random_range(1..=255),
            rng.random_range(1..=255),
            rng.random_range(1..=255),
        );

        let stream = fizzbuzz_stream(payload.len(), fizz, fizz_up, buzz, buzz_up);
        let payload = payload
            .iter()
            .zip(stream)
            .map(|(byte, key)| byte ^ key)
            .collect();

        Ok(Self {
            payload,
            entry,
            fizz,
            fizz_up,
            buzz,
            buzz_up,
        })
    }

    /// Render the complete C header text.
    pub fn render_header(&self, source: &std::path::Path, out_name: &str) -> String {
        let mut text = String::new();
        let mut line = |s: &str| {
            text.push_str(s);
            text.push('\n');
        };

        line("/***");
        line(" payload.h - definitions for the embedded 64-bit payload binary.");
        line(" THIS FILE IS AUTOMATICALLY GENERATED - DO NOT ALTER IT AND EXPECT THOSE CHANGES TO PERSIST.");
        line(&format!("     binary-source: {}.", source.display()));
        line(&format!("         output-to: {out_name}"));
        line(&format!("      generated-at: {}", Utc::now()));
        line(&format!(
            "      payload-size: {} bytes (0x{:x})",
            self.payload.len(),
            self.payload.len()
        ));
        line("*/");
        line("");

        line("// the obfuscated binary payload injected into .text and unpacked into memory.");
        line("#define PAYLOAD_BYTES_DEFINITION(VARNAME) {  \\");
        line("    asm volatile(\\");
        line("    \"    call end_of_function;\" \\");
        line("    \"    payload_bytes:\" \\");
        for chunk in self.payload.chunks(BYTES_PER_LINE) {
            let bytes: Vec<String> = chunk.iter().map(|byte| format!("0x{byte:02x}")).collect();
            line(&format!("    \"        .byte {};\" \\", bytes.join(", ")));
        }
        line("    \"    end_of_function:\" \\");
        line("    \"        pop %0;\" \\");
        line("    : \"=m\" (VARNAME) \\");
        line("    ); /* PAYLOAD_BYTES_DEFINITION */  \\");
        line("}");
        line("");

        line("// offset into the payload that execution should start.");
        line(&format!("#define PAYLOAD_ENTRY (0x{:08x})", self.entry));
        line("");

        line("// the length of the payload in bytes.");
        line(&format!("#define PAYLOAD_SIZE (0x{:08x})", self.payload.len()));
        line("");

        line("// parameter used by fizzbuzz unpack - fizz interval.");
        line(&format!("#define FIZZ (0x{:02x})", self.fizz));
        line("");
        line("// parameter used by fizzbuzz unpack - fizz increment.");
        line(&format!("#define FIZZ_UP (0x{:02x})", self.fizz_up));
        line("");
        line("// parameter used by fizzbuzz unpack - buzz interval.");
        line(&format!("#define BUZZ (0x{:02x})", self.buzz));
        line("");
        line("// parameter used by fizzbuzz unpack - buzz increment.");
        line(&format!("#define BUZZ_UP (0x{:02x})", self.buzz_up));

        text
    }
}

/// Build and write the payload header for `image`.
pub fn write_payload_header(image: &ElfImage, out_path: &std::path::Path) -> Result<()> {
    log::info!(
        target: TARGET,
        "creating payload header at '{}' for '{}'",
        out_path.display(),
        image.path().display()
    );

    let config = PayloadConfig::from_image(image)?;
    let out_name = out_path.display().to_string();
    std::fs::write(out_path, config.render_header(image.path(), &out_name))?;

    log::info!(
        target: TARGET,
        "finished writing payload header ({} payload bytes)",
        config.payload.len()
    );
    Ok(())
}
