//! Mersenne Twister (MT19937) PRNG.
//!
//! The protected binary reconstructs hidden strings by replaying this exact
//! generator, so we carry our own implementation rather than depend on a
//! library whose seeding mechanics we do not control. Parameters follow the
//! classic 32-bit MT19937 definition.

/// Degree of recurrence (`n`): number of 32-bit words of state.
pub const STATE_SIZE: usize = 624;

/// Middle word offset (`m`) used by the recurrence relation.
const MIDDLE_WORD: usize = 397;

/// Coefficients of the rational normal form twist matrix (`a`).
const MATRIX_A: u32 = 0x9908_b0df;

/// Tempering bitmask `b`.
const TEMPER_B: u32 = 0x9d2c_5680;

/// Tempering bitmask `c`.
const TEMPER_C: u32 = 0xefc6_0000;

/// Seed-initialisation multiplier (`f`).
const INIT_F: u32 = 1_812_433_253;

/// Most significant bit of a state word.
const UPPER_MASK: u32 = 0x8000_0000;

/// The 31 least significant bits of a state word.
const LOWER_MASK: u32 = 0x7fff_ffff;

/// MT19937 pseudo-random number generator.
#[derive(Clone)]
pub struct MersenneTwister {
    state: [u32; STATE_SIZE],
    index: usize,
}

impl MersenneTwister {
    /// Seed the generator.
    ///
    /// State fill follows the reference initialisation:
    /// `x[i] = f * (x[i-1] ^ (x[i-1] >> 30)) + i (mod 2^32)`.
    pub fn new(seed: u32) -> Self {
        let mut state = [0u32; STATE_SIZE];
        state[0] = seed;
        for index in 1..STATE_SIZE {
            let prev = state[index - 1];
            state[index] = INIT_F
                .wrapping_mul(prev ^ (prev >> 30))
                .wrapping_add(index as u32);
        }
        Self {
            state,
            index: STATE_SIZE,
        }
    }

    /// Generate a sequence in one call: seed, discard `skip` values, then
    /// collect `count` values.
    pub fn generate(seed: u32, skip: usize, count: usize) -> Vec<u32> {
        let mut mt = Self::new(seed);
        for _ in 0..skip {
            mt.next_u32();
        }
        (0..count).map(|_| mt.next_u32()).collect()
    }

    /// Progress the internal state once all current values are consumed.
    fn twist(&mut self) {
        for index in 0..STATE_SIZE {
            let next = (index + 1) % STATE_SIZE;
            let take = (index + MIDDLE_WORD) % STATE_SIZE;

            let x = (self.state[index] & UPPER_MASK) | (self.state[next] & LOWER_MASK);
            let mut x_a = x >> 1;
            if x & 1 == 1 {
                x_a ^= MATRIX_A;
            }
            self.state[index] = self.state[take] ^ x_a;
        }
        self.index = 0;
    }

    /// The next unsigned 32-bit number in the sequence.
    pub fn next_u32(&mut self) -> u32 {
        if self.index >= STATE_SIZE {
            self.twist();
        }

        let mut y = self.state[self.index];
        y ^= y >> 11;
        y ^= (y << 7) & TEMPER_B;
        y ^= (y << 15) & TEMPER_C;
        y ^= y >> 18;

        self.index += 1;
        y
    }

    /// Consume the generator as a byte stream: each u32 output expanded to
    /// its little-endian bytes, as the values would be seen in memory.
    pub fn into_bytes(self) -> MtBytes {
        MtBytes {
            mt: self,
            buffer: [0; 4],
            cursor: 4,
        }
    }
}

/// Infinite little-endian byte stream over an MT19937 generator.
pub struct MtBytes {
    mt: MersenneTwister,
    buffer: [u8; 4],
    cursor: usize,
}

impl Iterator for MtBytes {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.cursor == 4 {
            self.buffer = self.mt.next_u32().to_le_bytes();
            self.cursor = 0;
        }
        let byte = self.buffer[self.cursor];
        self.cursor += 1;
        Some(byte)
    }
}
