// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use epic_common::Params;
use primitive_types::U256;

/// Decode the Bitcoin 32-bit mantissa/exponent compact form. Returns None for negative or
/// overflowing encodings.
pub fn compact_to_target(compact: u32) -> Option<U256> {
    let exponent = compact >> 24;
    let mantissa = compact & 0x007f_ffff;
    if compact & 0x0080_0000 != 0 {
        // sign bit: negative targets are invalid
        return None;
    }
    if mantissa == 0 {
        return Some(U256::zero());
    }
    if exponent <= 3 {
        Some(U256::from(mantissa >> (8 * (3 - exponent))))
    } else {
        if exponent > 34 || (mantissa > 0xff && exponent > 33) || (mantissa > 0xffff && exponent > 32) {
            return None;
        }
        Some(U256::from(mantissa) << (8 * (exponent - 3)))
    }
}

/// Encode a 256-bit target into compact form, rounding toward zero.
pub fn target_to_compact(target: U256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact: u32 = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        (target >> (8 * (size - 3))).low_u64() as u32
    };
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | ((size as u32) << 24)
}

/// Difficulty retarget outcome: the new milestone and block targets plus an estimated network
/// hash rate for the elapsed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retarget {
    pub milestone_target: U256,
    pub block_target: U256,
    pub hash_rate: u64,
}

/// Recompute targets so the observed spacing of the last `interval` milestones converges on
/// `params.target_timespan` seconds each. The adjustment per window is clamped to 4x in either
/// direction, and targets never exceed `max_target`.
pub fn next_targets(old_ms_target: U256, actual_timespan: u32, params: &Params) -> Retarget {
    let expected = params.target_timespan.saturating_mul(params.interval as u32).max(1);
    let actual = actual_timespan.clamp(expected / 4, expected.saturating_mul(4)).max(1);

    let mut ms_target = old_ms_target / U256::from(expected) * U256::from(actual);
    if ms_target.is_zero() {
        ms_target = U256::one();
    }
    if ms_target > params.max_target {
        ms_target = params.max_target;
    }

    let block_target = block_target_for(ms_target, params);

    // hashes per second needed to land `interval` milestones in the observed window
    let difficulty = params.max_target / ms_target;
    let difficulty_per_ms = if difficulty.bits() > 64 {
        u64::MAX
    } else {
        difficulty.low_u64()
    };
    let hash_rate = difficulty_per_ms
        .saturating_mul(params.interval)
        .checked_div(u64::from(actual))
        .unwrap_or(0)
        .max(1);

    Retarget {
        milestone_target: ms_target,
        block_target,
        hash_rate,
    }
}

/// The (easier) per-block target derived from a milestone target.
pub fn block_target_for(ms_target: U256, params: &Params) -> U256 {
    ms_target
        .saturating_mul(U256::from(params.sortition_coefficient))
        .min(params.max_target)
}

#[cfg(test)]
mod test {
    use epic_common::Params;

    use super::*;

    #[test]
    fn compact_round_trip() {
        for target in [
            U256::from(1u64),
            U256::from(0x1234u64),
            U256::from(0xffffffu64),
            U256::MAX >> 16,
            U256::MAX >> 1,
        ] {
            let compact = target_to_compact(target);
            let decoded = compact_to_target(compact).unwrap();
            // compact form keeps 3 bytes of mantissa; decoded never exceeds the original
            assert!(decoded <= target);
            assert!(decoded > target >> 24);
        }
    }

    #[test]
    fn compact_rejects_negative() {
        assert_eq!(compact_to_target(0x0180_0000), None);
    }

    #[test]
    fn small_targets_are_exact() {
        for v in [0u64, 1, 0x7f, 0x80, 0xffff, 0x7f_ffff] {
            let compact = target_to_compact(U256::from(v));
            assert_eq!(compact_to_target(compact).unwrap(), U256::from(v));
        }
    }

    #[test]
    fn slow_milestones_raise_target() {
        let params = Params::mainnet();
        let old = params.max_target >> 10;
        let expected = params.target_timespan * params.interval as u32;
        let slow = next_targets(old, expected * 2, &params);
        let fast = next_targets(old, expected / 2, &params);
        assert!(slow.milestone_target > old);
        assert!(fast.milestone_target < old);
        assert!(fast.hash_rate > slow.hash_rate);
    }

    #[test]
    fn adjustment_is_clamped() {
        let params = Params::mainnet();
        let old = params.max_target >> 10;
        let expected = params.target_timespan * params.interval as u32;
        let extreme = next_targets(old, expected * 1000, &params);
        let clamped = next_targets(old, expected * 4, &params);
        assert_eq!(extreme.milestone_target, clamped.milestone_target);
    }

    #[test]
    fn target_never_exceeds_max() {
        let params = Params::mainnet();
        let retarget = next_targets(params.max_target, u32::MAX, &params);
        assert!(retarget.milestone_target <= params.max_target);
        assert!(retarget.block_target <= params.max_target);
    }
}
