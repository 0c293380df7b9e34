//! Property-Based Tests for the Sector Codec and Ring Buffer
//!
//! # Test Properties
//!
//! 1. **Involution**: scramble(scramble(buf, s), s) = buf
//! 2. **Determinism**: same seed and length give the same keystream
//! 3. **Geometry totality**: every mode combination yields a usable layout
//! 4. **Ring conservation**: available + free = capacity, FIFO order kept
//! 5. **Fill-to**: pads exactly up to the target, no-op when already there
//! 6. **Framing**: deframe(frame(payload, s)) recovers payload and s

#![cfg(test)]

use std::collections::VecDeque;

use proptest::prelude::*;

use super::framing::{FrameCheck, SectorFramer};
use super::randomizer::{descramble, scramble};
use crate::format::geometry::{all_combinations, geometry};
use crate::ring::RingBuffer;

// =============================================================================
// Property Strategies
// =============================================================================

/// Buffers whose length is a positive multiple of the word size, up to the
/// largest sector in the table.
fn word_buffer_strategy() -> impl Strategy<Value = Vec<u8>> {
    (1usize..=672).prop_flat_map(|words| prop::collection::vec(any::<u8>(), words * 4))
}

#[derive(Debug, Clone)]
enum RingOp {
    Write(Vec<u8>),
    Read(usize),
}

fn ring_ops_strategy() -> impl Strategy<Value = Vec<RingOp>> {
    let op = prop_oneof![
        prop::collection::vec(any::<u8>(), 0..96).prop_map(RingOp::Write),
        (0usize..96).prop_map(RingOp::Read),
    ];
    prop::collection::vec(op, 1..64)
}

// =============================================================================
// Randomizer Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: scrambling twice with the same seed restores the buffer.
    #[test]
    fn prop_scramble_is_involution(buf in word_buffer_strategy(), seed in any::<u32>()) {
        let mut work = buf.clone();
        scramble(&mut work, seed);
        descramble(&mut work, seed);
        prop_assert_eq!(work, buf);
    }

    /// Property: the keystream depends only on seed and length.
    #[test]
    fn prop_scramble_is_deterministic(buf in word_buffer_strategy(), seed in any::<u32>()) {
        let mut a = buf.clone();
        let mut b = buf.clone();
        scramble(&mut a, seed);
        scramble(&mut b, seed);
        prop_assert_eq!(&a, &b);

        // XOR of output and input is the keystream; it must not depend on data
        let mut zeros = vec![0u8; buf.len()];
        scramble(&mut zeros, seed);
        let keystream: Vec<u8> = a.iter().zip(&buf).map(|(x, y)| x ^ y).collect();
        prop_assert_eq!(keystream, zeros);
    }
}

// =============================================================================
// Geometry Properties
// =============================================================================

#[test]
fn prop_geometry_is_total() {
    for (standard, density, format) in all_combinations() {
        let sf = geometry(standard, density, format);
        assert!(sf.data_size > 0);
        assert!(sf.leader + sf.key_length <= sf.data_size);
    }
}

// =============================================================================
// Ring Buffer Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: conservation and FIFO order under arbitrary partial transfers.
    #[test]
    fn prop_ring_conservation_and_fifo(capacity in 1usize..128, ops in ring_ops_strategy()) {
        let mut ring = RingBuffer::new(capacity)?;
        let mut model: VecDeque<u8> = VecDeque::new();

        for op in ops {
            match op {
                RingOp::Write(data) => {
                    let written = ring.write(&data);
                    prop_assert_eq!(written, data.len().min(capacity - model.len()));
                    model.extend(&data[..written]);
                }
                RingOp::Read(n) => {
                    let mut out = vec![0u8; n];
                    let read = ring.read(&mut out);
                    prop_assert_eq!(read, n.min(model.len()));
                    let expected: Vec<u8> = model.drain(..read).collect();
                    prop_assert_eq!(&out[..read], &expected[..]);
                }
            }
            prop_assert_eq!(ring.bytes_available() + ring.space_available(), capacity);
            prop_assert_eq!(ring.bytes_available(), model.len());
        }
    }

    /// Property: fill_to pads up to exactly n, and is a no-op once reached.
    #[test]
    fn prop_fill_to(
        capacity in 1usize..128,
        prefill in 0usize..128,
        target in 0usize..128,
        filler in any::<u8>(),
    ) {
        let mut ring = RingBuffer::new(capacity)?;
        let prefill = prefill.min(capacity);
        ring.write(&vec![0xAB; prefill]);

        let before = ring.bytes_available();
        let padded = ring.fill_to(target, filler);
        let after = ring.bytes_available();

        if before >= target {
            prop_assert_eq!(padded, 0);
            prop_assert_eq!(after, before);
        } else {
            prop_assert_eq!(after, target.min(capacity));
            prop_assert_eq!(padded, after - before);

            let mut out = vec![0u8; after];
            ring.read(&mut out);
            prop_assert!(out[..before].iter().all(|&b| b == 0xAB));
            prop_assert!(out[before..].iter().all(|&b| b == filler));
        }
    }
}

// =============================================================================
// Framing Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: a clean frame always deframes to its payload and sequence.
    #[test]
    fn prop_frame_roundtrip(combo in 0usize..8, sequence in any::<u64>(), fill in any::<u8>()) {
        let (standard, density, format) = all_combinations().nth(combo).unwrap();
        let framer = SectorFramer::new(geometry(standard, density, format), fill);

        let payload: Vec<u8> = (0..framer.sector_size())
            .map(|i| (i as u64).wrapping_mul(sequence | 1) as u8)
            .collect();
        let mut field = vec![0u8; framer.field_size()];
        framer.frame(&payload, sequence, &mut field);

        let mut out = vec![0u8; framer.sector_size()];
        let check = framer.deframe(&field, &mut out);
        prop_assert_eq!(check, FrameCheck::Valid { sequence: sequence as u32 });
        prop_assert_eq!(out, payload);
    }
}
