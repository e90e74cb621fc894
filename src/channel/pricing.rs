//! Proportional pricing (spec §4.2, property `Px-Proportional`): a pure
//! function of block size, rate, and the configured standard unit, kept
//! separate from channel state so it is trivial to property-test.

/// `amount = clamp(floor(rate * block_size / standard_size), min, max)`.
///
/// Returns `None` when the floored amount is zero and no payment floor is
/// configured (`min_payment == 0`) — the event contributes nothing and the
/// caller should reject it rather than admit a zero-value payment.
pub fn price_for_block(block_size: u64, rate: u64, standard_size: u64, min_payment: u64, max_payment: u64) -> Option<u64> {
    if standard_size == 0 {
        return None;
    }
    let raw = ((rate as f64) * (block_size as f64) / (standard_size as f64)).floor();
    let raw = raw.max(0.0) as u64;
    if raw == 0 && min_payment == 0 {
        return None;
    }
    Some(raw.clamp(min_payment, max_payment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_size_block_pays_exact_rate() {
        assert_eq!(price_for_block(16_384, 17, 16_384, 1, 10_000), Some(17));
    }

    #[test]
    fn half_size_block_pays_half_rate() {
        assert_eq!(price_for_block(8_192, 20, 16_384, 1, 10_000), Some(10));
    }

    #[test]
    fn clamps_to_max_payment() {
        assert_eq!(price_for_block(16_384, 1_000_000, 16_384, 1, 500), Some(500));
    }

    #[test]
    fn zero_size_with_floor_pays_floor() {
        assert_eq!(price_for_block(0, 17, 16_384, 5, 10_000), Some(5));
    }

    #[test]
    fn zero_size_without_floor_is_rejected() {
        assert_eq!(price_for_block(0, 17, 16_384, 0, 10_000), None);
    }

    #[test]
    fn tiny_block_below_floor_pays_floor() {
        // 1 byte at rate 17 / standard 16384 floors to 0, floor kicks in.
        assert_eq!(price_for_block(1, 17, 16_384, 1, 10_000), Some(1));
    }
}
