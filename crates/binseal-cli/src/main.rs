//! Command-line surface for the binseal patch toolchain.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod actions;
mod encoders;

use encoders::SequenceEncoding;

/// Post-link self-protection patcher for x86-64 ELF binaries.
#[derive(Debug, Parser)]
#[command(name = "binseal")]
#[command(about = "Post-link self-protection patcher for x86-64 ELF binaries")]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Implement code to unpack strings at locations identified by
    /// .protected-string-entry sections.
    ProtectStrings {
        /// The ELF file to patch.
        elf: PathBuf,
        /// Where to write the patched ELF.
        out: PathBuf,
    },
    /// Finalise the integrity checking mechanisms of the binary.
    HashPatch {
        /// The ELF file to patch.
        elf: PathBuf,
        /// Where to write the patched ELF.
        out: PathBuf,
    },
    /// Gut everything out of the binary that we don't need or want.
    StripBinary {
        /// The ELF file to strip.
        elf: PathBuf,
        /// Where to write the stripped ELF.
        out: PathBuf,
    },
    /// Generate the payload header compiled into the 32-bit launcher.
    WritePayloadHeader {
        /// The (stripped) ELF to embed.
        elf: PathBuf,
        /// Where to write the header.
        #[arg(short, long)]
        out_file: PathBuf,
    },
    /// Generate the values needed to embed a hidden string.
    GenerateHiddenString {
        /// The hidden string to embed.
        text: String,
        /// Literal 32-bit PRNG seed (omit for random).
        #[arg(short, long, conflicts_with = "long_seed")]
        seed: Option<u32>,
        /// Fragmented 64-bit seed (omit for random).
        #[arg(long)]
        long_seed: Option<u64>,
    },
    /// Generate and print a Mersenne Twister sequence.
    GenerateMtSequence {
        /// The seed to initialise the PRNG with.
        seed: u32,
        /// Number of leading values to discard.
        #[arg(short, long, default_value_t = 0)]
        skip: usize,
        /// Number of values to emit.
        #[arg(short, long, default_value_t = 100)]
        count: usize,
        /// Output encoding.
        #[arg(short, long, value_enum, default_value = "one-per-line-hex")]
        encode: SequenceEncoding,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::builder().filter_level(cli.log_level).init();

    let result = match cli.command {
        Command::ProtectStrings { elf, out } => actions::protect_strings(&elf, &out),
        Command::HashPatch { elf, out } => actions::hash_patch(&elf, &out),
        Command::StripBinary { elf, out } => actions::strip_binary(&elf, &out),
        Command::WritePayloadHeader { elf, out_file } => {
            actions::write_payload_header(&elf, &out_file)
        }
        Command::GenerateHiddenString {
            text,
            seed,
            long_seed,
        } => actions::generate_hidden_string(&text, seed, long_seed),
        Command::GenerateMtSequence {
            seed,
            skip,
            count,
            encode,
        } => actions::generate_mt_sequence(seed, skip, count, encode),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
