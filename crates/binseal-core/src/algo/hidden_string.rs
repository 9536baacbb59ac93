//! Hidden string masks.
//!
//! A hidden string is never stored in the binary; instead we store an XOR
//! mask derived from an MT19937 stream, and the runtime replays the stream
//! to recover the plaintext. The 64-bit seed is split across the binary as
//! a "fragment" value; the generator itself is seeded with the 32-bit fold
//! of that value.

use rand::Rng;

use super::mersenne::MersenneTwister;

/// A hidden string together with the values needed to embed it.
pub struct HiddenString {
    /// The fragmented 64-bit seed embedded in the binary.
    pub long_seed: u64,
    /// The folded 32-bit seed actually fed to the PRNG.
    pub short_seed: u32,
    /// XOR mask covering the plaintext plus its NUL terminator.
    pub mask: Vec<u8>,
    /// The plaintext this mask reconstructs.
    pub raw: String,
}

impl HiddenString {
    /// Build the mask for `text`, drawing a random long seed if none given.
    pub fn new(text: &str, long_seed: Option<u64>) -> Self {
        let long_seed = long_seed.unwrap_or_else(|| rand::rng().random());
        let short_seed = fold_seed(long_seed);

        let stream = MersenneTwister::new(short_seed).into_bytes();
        let mask = text
            .bytes()
            .chain(std::iter::once(0))
            .zip(stream)
            .map(|(byte, key)| byte ^ key)
            .collect();

        Self {
            long_seed,
            short_seed,
            mask,
            raw: text.to_owned(),
        }
    }

    /// The mask rendered as a C escape string (`\x41\x42...`).
    pub fn mask_c_string(&self) -> String {
        self.mask.iter().map(|b| format!("\\x{b:02x}")).collect()
    }

    /// The mask rendered as a hex array (`0x41, 0x42, ...`).
    pub fn mask_hex_array(&self) -> String {
        let values: Vec<String> = self.mask.iter().map(|b| format!("0x{b:02x}")).collect();
        values.join(", ")
    }
}

/// Fold a fragmented 64-bit seed into the 32-bit PRNG seed.
pub fn fold_seed(long_seed: u64) -> u32 {
    ((long_seed >> 32) as u32) ^ (long_seed as u32)
}

/// Expand a 32-bit seed into a fragmented long seed.
///
/// The high half is a random fragment and the low half is that fragment
/// XORed with the seed, so folding the result recovers the seed while the
/// stored value leaks neither part on its own.
pub fn fragment_seed(short_seed: u32) -> u64 {
    let fragment: u32 = rand::rng().random();
    (u64::from(fragment) << 32) | u64::from(fragment ^ short_seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_round_trips() {
        let hidden = HiddenString::new("s3cret-fl4g", Some(0x0123_4567_89ab_cdef));
        let stream = MersenneTwister::new(hidden.short_seed).into_bytes();
        let recovered: Vec<u8> = hidden.mask.iter().zip(stream).map(|(m, k)| m ^ k).collect();

        let mut expected = b"s3cret-fl4g".to_vec();
        expected.push(0);
        assert_eq!(recovered, expected);
    }

    #[test]
    fn test_mask_covers_terminator() {
        let hidden = HiddenString::new("ab", Some(7));
        assert_eq!(hidden.mask.len(), 3);
    }

    #[test]
    fn test_fragment_seed_folds_back() {
        for seed in [0u32, 1, 0xdead_beef, u32::MAX] {
            assert_eq!(fold_seed(fragment_seed(seed)), seed);
        }
    }

    #[test]
    fn test_short_seed_is_fold_of_long() {
        let hidden = HiddenString::new("x", Some(0xffff_0000_0000_ffff));
        assert_eq!(hidden.short_seed, 0xffff_ffff ^ 0x0000_0000);
    }
}
