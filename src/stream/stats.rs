//! Stream Statistics
//!
//! Lock-free counters shared between a stream node and whoever watches it.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-node transfer counters
#[derive(Debug, Default)]
pub struct StreamStats {
    // Application-facing traffic
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,

    // Sector traffic
    sectors: AtomicU64,
    concealed_sectors: AtomicU64,
    integrity_warnings: AtomicU64,

    // Flow control
    would_blocks: AtomicU64,
    stalls: AtomicU64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes accepted from the caller (write direction).
    pub fn record_bytes_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Bytes handed to the caller (read direction).
    pub fn record_bytes_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_sector(&self) {
        self.sectors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_concealed(&self) {
        self.concealed_sectors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_integrity_warning(&self) {
        self.integrity_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_would_block(&self) {
        self.would_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn sectors(&self) -> u64 {
        self.sectors.load(Ordering::Relaxed)
    }

    pub fn concealed_sectors(&self) -> u64 {
        self.concealed_sectors.load(Ordering::Relaxed)
    }

    pub fn integrity_warnings(&self) -> u64 {
        self.integrity_warnings.load(Ordering::Relaxed)
    }

    pub fn would_blocks(&self) -> u64 {
        self.would_blocks.load(Ordering::Relaxed)
    }

    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    /// Get snapshot of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
            sectors: self.sectors(),
            concealed_sectors: self.concealed_sectors(),
            integrity_warnings: self.integrity_warnings(),
            would_blocks: self.would_blocks(),
            stalls: self.stalls(),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        self.sectors.store(0, Ordering::Relaxed);
        self.concealed_sectors.store(0, Ordering::Relaxed);
        self.integrity_warnings.store(0, Ordering::Relaxed);
        self.would_blocks.store(0, Ordering::Relaxed);
        self.stalls.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`StreamStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub sectors: u64,
    pub concealed_sectors: u64,
    pub integrity_warnings: u64,
    pub would_blocks: u64,
    pub stalls: u64,
}
