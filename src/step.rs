//! Step arithmetic and the hot-tier step encoding.
//!
//! Time is partitioned into fixed-size intervals of `step_size`
//! transactions. The hot tier stores the step of a row bitwise-inverted
//! in big-endian form so that ascending duplicate-sort order traverses
//! recent steps first. The helpers here name that encoding explicitly
//! instead of scattering `^` over the callers.

/// Files spanning exactly this many steps are frozen: completely
/// immutable, never refcounted, never deleted.
pub const STEPS_IN_FROZEN_FILE: u64 = 64;

/// Allowed spans for merged files, largest first.
pub const MERGE_SPANS: [u64; 6] = [64, 32, 16, 8, 4, 2];

#[inline]
pub fn step_of(tx_num: u64, step_size: u64) -> u64 {
    tx_num / step_size
}

/// Big-endian encoding of the bitwise-inverted step.
#[inline]
pub fn inverted_step_bytes(step: u64) -> [u8; 8] {
    (!step).to_be_bytes()
}

/// Inverse of [`inverted_step_bytes`].
#[inline]
pub fn step_from_inverted(buf: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[..8]);
    !u64::from_be_bytes(b)
}

#[inline]
pub fn tx_num_bytes(tx_num: u64) -> [u8; 8] {
    tx_num.to_be_bytes()
}

#[inline]
pub fn tx_num_from_bytes(buf: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[..8]);
    u64::from_be_bytes(b)
}

/// `key ‖ suffix` composite used by the values and history tables.
#[inline]
pub fn composite(key: &[u8], suffix: &[u8; 8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 8);
    out.extend_from_slice(key);
    out.extend_from_slice(suffix);
    out
}
