//! Types for configuring petal nodes.
//!
//! Every node constructor takes an explicit, immutable [RingConfig]. There
//! is no process-wide "already initialized" state: two overlays with
//! different digit widths can coexist in one process.

use crate::{PetalError, PetalResult, KEY_BITS};

/// Immutable key-ring parameters shared by every node of one overlay.
///
/// The ring is the space of [crate::NodeKey]s: fixed 128-bit unsigned
/// integers, written in base `2^digit_bits` for prefix routing.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RingConfig {
    /// Bits per routing digit (`b` in the Pastry literature).
    ///
    /// Must divide the 128-bit key width. Default: 4 (hex digits).
    pub digit_bits: u32,

    /// Total leaf-set size (`L`): half below, half above the pivot.
    ///
    /// Must be even and non-zero. Default: 32.
    pub leaf_count: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            digit_bits: 4,
            leaf_count: 32,
        }
    }
}

impl RingConfig {
    /// Construct a validated ring config.
    pub fn new(digit_bits: u32, leaf_count: usize) -> PetalResult<Self> {
        let out = Self {
            digit_bits,
            leaf_count,
        };
        out.validate()?;
        Ok(out)
    }

    /// Check this config for internal consistency.
    pub fn validate(&self) -> PetalResult<()> {
        if self.digit_bits == 0
            || self.digit_bits > 8
            || KEY_BITS % self.digit_bits != 0
        {
            return Err(PetalError::other(format!(
                "digit_bits must be in 1..=8 and divide {KEY_BITS}, got {}",
                self.digit_bits
            )));
        }
        if self.leaf_count == 0 || self.leaf_count % 2 != 0 {
            return Err(PetalError::other(format!(
                "leaf_count must be even and non-zero, got {}",
                self.leaf_count
            )));
        }
        Ok(())
    }

    /// Number of digits in a key at this digit width.
    ///
    /// This is also the row count of every routing table on the ring.
    pub fn digits(&self) -> usize {
        (KEY_BITS / self.digit_bits) as usize
    }

    /// Size of the digit alphabet (`2^digit_bits`), the routing table
    /// column count.
    pub fn base(&self) -> usize {
        1usize << self.digit_bits
    }

    /// Entries held on each side of a leaf set (`L / 2`).
    pub fn half_leaf(&self) -> usize {
        self.leaf_count / 2
    }
}
