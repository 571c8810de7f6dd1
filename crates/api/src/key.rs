//! The key ring and its arithmetic.
//!
//! Node identities and data keys are the same kind of value: a fixed-width
//! unsigned integer on a circular key space. All prefix arithmetic is done
//! in the base configured by [RingConfig::digit_bits].

use crate::RingConfig;

/// Bit width of the key ring.
pub const KEY_BITS: u32 = 128;

/// A position on the key ring.
///
/// Equality of keys defines node identity. Two live nodes may hold the same
/// key only transiently while a join collision is being resolved.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct NodeKey(pub u128);

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the leading digits are what routing cares about
        f.write_str(&self.short())
    }
}

impl From<u128> for NodeKey {
    fn from(v: u128) -> Self {
        Self(v)
    }
}

impl NodeKey {
    /// Draw a uniformly random key from the full ring.
    pub fn random<R: rand::Rng>(rng: &mut R) -> Self {
        Self(rng.gen())
    }

    /// Abbreviated hex form (first four digits) for logs and debugging.
    pub fn short(&self) -> String {
        let full = format!("{:032x}", self.0);
        format!("{}-", &full[..4])
    }

    /// The digit at position `pos` (0 is the most significant digit) when
    /// this key is written in the configured base.
    ///
    /// Out-of-range positions yield digit 0, matching the silent tolerance
    /// of the table mutators.
    pub fn digit_at(&self, pos: usize, config: &RingConfig) -> usize {
        if pos >= config.digits() {
            return 0;
        }
        let shift = KEY_BITS - (pos as u32 + 1) * config.digit_bits;
        ((self.0 >> shift) as usize) & (config.base() - 1)
    }

    /// Number of leading digits this key shares with `other` in the
    /// configured base. Equal keys share all [RingConfig::digits] digits.
    pub fn prefix_len(&self, other: &NodeKey, config: &RingConfig) -> usize {
        let x = self.0 ^ other.0;
        if x == 0 {
            return config.digits();
        }
        x.leading_zeros() as usize / config.digit_bits as usize
    }

    /// Linear distance `|self - other|`, the metric used by next-hop
    /// selection and tie-breaks.
    pub fn distance(&self, other: &NodeKey) -> u128 {
        self.0.abs_diff(other.0)
    }

    /// Distance walking the ring clockwise (increasing keys, wrapping at
    /// the top of the key space) from `self` to `other`.
    pub fn clockwise_distance(&self, other: &NodeKey) -> u128 {
        other.0.wrapping_sub(self.0)
    }

    /// Shorter-arc ring distance between two keys.
    pub fn ring_distance(&self, other: &NodeKey) -> u128 {
        let cw = self.clockwise_distance(other);
        let ccw = other.clockwise_distance(self);
        cw.min(ccw)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn hex_ring() -> RingConfig {
        RingConfig::default()
    }

    #[test]
    fn digit_extraction_hex() {
        let c = hex_ring();
        let k = NodeKey(0xa5f0_0000_0000_0000_0000_0000_0000_0001);
        assert_eq!(0xa, k.digit_at(0, &c));
        assert_eq!(0x5, k.digit_at(1, &c));
        assert_eq!(0xf, k.digit_at(2, &c));
        assert_eq!(0x0, k.digit_at(3, &c));
        assert_eq!(0x1, k.digit_at(31, &c));
        // out of range is tolerated
        assert_eq!(0, k.digit_at(32, &c));
    }

    #[test]
    fn digit_extraction_binary() {
        let c = RingConfig::new(1, 4).unwrap();
        let k = NodeKey(1u128 << 127);
        assert_eq!(1, k.digit_at(0, &c));
        assert_eq!(0, k.digit_at(1, &c));
        assert_eq!(128, c.digits());
    }

    #[test]
    fn prefix_len_cases() {
        let c = hex_ring();
        let a = NodeKey(0xab00_0000_0000_0000_0000_0000_0000_0000);
        let b = NodeKey(0xab70_0000_0000_0000_0000_0000_0000_0000);
        assert_eq!(2, a.prefix_len(&b, &c));
        assert_eq!(2, b.prefix_len(&a, &c));

        let d = NodeKey(0x1b00_0000_0000_0000_0000_0000_0000_0000);
        assert_eq!(0, a.prefix_len(&d, &c));

        assert_eq!(32, a.prefix_len(&a, &c));
    }

    #[test]
    fn ring_distance_wraps() {
        let lo = NodeKey(1);
        let hi = NodeKey(u128::MAX);
        assert_eq!(2, lo.ring_distance(&hi));
        assert_eq!(2, hi.ring_distance(&lo));
        // but the linear metric does not wrap
        assert_eq!(u128::MAX - 1, lo.distance(&hi));
    }

    #[test]
    fn clockwise_distance_is_directional() {
        let a = NodeKey(10);
        let b = NodeKey(20);
        assert_eq!(10, a.clockwise_distance(&b));
        assert_eq!(u128::MAX - 9, b.clockwise_distance(&a));
    }

    #[test]
    fn short_form_is_four_digits() {
        assert_eq!("00ff", &NodeKey(0x00ffu128 << 112).short()[..4]);
    }
}
