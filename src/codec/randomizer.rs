//! Sector randomizer
//!
//! Scrambles a sector with a keystream from a linear congruential generator
//! so the recorded signal stays DC-balanced and free of long runs. The
//! keystream depends only on the seed and the buffer length, so the
//! transform is its own inverse.
//!
//! Words are 4 bytes, little-endian on the medium regardless of host byte
//! order, and are visited from the end of the buffer towards the start.

use super::WORD_SIZE;

const LCG_MULTIPLIER: u32 = 1_664_525;
const LCG_INCREMENT: u32 = 1_013_904_223;

/// Number of keystream history slots.
const HISTORY: usize = 4;

#[inline]
fn advance(seed: u32) -> u32 {
    seed.wrapping_mul(LCG_MULTIPLIER).wrapping_add(LCG_INCREMENT)
}

/// Scramble `buf` in place with `seed`.
///
/// The length is treated as rounded up to a whole number of words; a
/// trailing partial word is transformed exactly as if the buffer had been
/// padded and then truncated. An empty buffer is left untouched.
pub fn scramble(buf: &mut [u8], seed: u32) {
    if buf.is_empty() {
        return;
    }

    let mut seed = seed;
    let mut history = [0u32; HISTORY];
    for slot in history.iter_mut() {
        seed = advance(seed);
        *slot = seed;
    }

    let words = buf.len().div_ceil(WORD_SIZE);
    for index in (0..words).rev() {
        seed = advance(seed);
        let slot = (seed >> 30) as usize;
        let key = history[slot].to_le_bytes();

        let start = index * WORD_SIZE;
        let end = (start + WORD_SIZE).min(buf.len());
        for (byte, k) in buf[start..end].iter_mut().zip(key) {
            *byte ^= k;
        }

        history[slot] = seed;
    }
}

/// Undo [`scramble`]. Identical to it by construction.
#[inline]
pub fn descramble(buf: &mut [u8], seed: u32) {
    scramble(buf, seed);
}

/// Seed for the sector at `sequence` in a recording.
///
/// Record and playback both derive it from the running sector counter, so
/// it never has to be stored on tape.
#[inline]
pub fn sector_seed(sequence: u64) -> u32 {
    sequence as u32
}
