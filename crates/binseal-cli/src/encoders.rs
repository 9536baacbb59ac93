//! Output encodings for generated Mersenne Twister sequences.

use clap::ValueEnum;

/// How a sequence of u32 values is rendered on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SequenceEncoding {
    /// One decimal value per line.
    OnePerLineDec,
    /// One hexadecimal value per line.
    OnePerLineHex,
    /// A C `unsigned int` array.
    CUintArray,
    /// A C `unsigned char` array, values expanded little-endian.
    CCharArrayLe,
    /// A C `unsigned char` array, values expanded big-endian.
    CCharArrayBe,
}

impl SequenceEncoding {
    pub fn render(self, seed: u32, skip: usize, values: &[u32]) -> String {
        match self {
            Self::OnePerLineDec => {
                let lines: Vec<String> = values.iter().map(u32::to_string).collect();
                lines.join("\n") + "\n"
            }
            Self::OnePerLineHex => {
                let lines: Vec<String> = values.iter().map(|v| format!("0x{v:08x}")).collect();
                lines.join("\n") + "\n"
            }
            Self::CUintArray => {
                let mut text = sequence_comment(seed, skip);
                text.push_str(&c_array(
                    "unsigned int",
                    &format!("mt_seed_{seed:08x}_values"),
                    &values.iter().map(|v| format!("0x{v:08x}")).collect::<Vec<_>>(),
                    16,
                ));
                text
            }
            Self::CCharArrayLe => {
                let bytes: Vec<String> = values
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .map(|b| format!("0x{b:02x}"))
                    .collect();
                let mut text = sequence_comment(seed, skip);
                text.push_str(&c_array(
                    "unsigned char",
                    &format!("mt_seed_{seed:08x}_values"),
                    &bytes,
                    32,
                ));
                text
            }
            Self::CCharArrayBe => {
                let bytes: Vec<String> = values
                    .iter()
                    .flat_map(|v| v.to_be_bytes())
                    .map(|b| format!("0x{b:02x}"))
                    .collect();
                let mut text = sequence_comment(seed, skip);
                text.push_str(&c_array(
                    "unsigned char",
                    &format!("mt_seed_{seed:08x}_values"),
                    &bytes,
                    32,
                ));
                text
            }
        }
    }
}

fn sequence_comment(seed: u32, skip: usize) -> String {
    let mut text = format!("/// mersenne-twister sequence for seed {seed}\n");
    if skip > 0 {
        text.push_str(&format!("//  note: {skip} initial values skipped/discarded.\n"));
    }
    text
}

fn c_array(c_type: &str, name: &str, items: &[String], per_line: usize) -> String {
    let mut text = format!("{c_type} {name}[] = {{\n");
    for (index, chunk) in items.chunks(per_line).enumerate() {
        let trailing = if (index + 1) * per_line >= items.len() {
            ""
        } else {
            ","
        };
        text.push_str(&format!("    {}{}\n", chunk.join(", "), trailing));
    }
    text.push_str("};\n");
    text
}
