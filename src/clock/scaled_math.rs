// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Fixed point conversion between counter ticks and nanoseconds.

/// Nanoseconds in one second.
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Returns the counter mask for a counter which is `bits` wide.
///
/// `bits` must be in the range `1..=64`.
pub const fn counter_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1 << bits) - 1
    }
}

/// Calculates a `(mult, shift)` pair to convert ticks at `from` Hz to units at `to` Hz, as
/// `(ticks * mult) >> shift`.
///
/// The largest shift is chosen which still allows `max_secs` seconds worth of ticks to be
/// converted without the 64-bit product overflowing.
pub fn mult_shift(from: u64, to: u64, max_secs: u64) -> (u32, u32) {
    debug_assert_ne!(from, 0);

    // Work out how many bits of headroom the tick count for `max_secs` needs.
    let mut tmp = max_secs.saturating_mul(from) >> 32;
    let mut accumulator = 32;
    while tmp != 0 {
        tmp >>= 1;
        accumulator -= 1;
    }

    let mut shift = 32;
    let mut mult = 0;
    while shift > 0 {
        mult = ((to << shift) + from / 2) / from;
        if mult >> accumulator == 0 {
            break;
        }
        shift -= 1;
    }
    if shift == 0 {
        mult = (to + from / 2) / from;
    }

    (u32::try_from(mult).unwrap_or(u32::MAX), shift)
}

/// Converts a tick delta to nanoseconds.
///
/// The multiplication deliberately wraps; callers keep `ticks` below the wrap interval.
pub const fn ticks_to_ns(ticks: u64, mult: u32, shift: u32) -> u64 {
    ticks.wrapping_mul(mult as u64) >> shift
}

/// Returns the number of nanoseconds which may elapse before either the counter wraps or the
/// conversion overflows, whichever comes first.
pub fn wrap_interval_ns(mask: u64, mult: u32, shift: u32) -> u64 {
    let max_ticks = (u64::MAX / u64::from(mult.max(1))).min(mask);
    ticks_to_ns(max_ticks, mult, shift)
}

/// Returns the period at which the epoch must be refreshed, leaving a margin of one eighth of the
/// wrap interval.
pub const fn refresh_period_ns(wrap_ns: u64) -> u64 {
    wrap_ns - (wrap_ns >> 3)
}
