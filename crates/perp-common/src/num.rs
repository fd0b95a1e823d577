//! Step/tick quantisation for order quantities and prices.
//!
//! Venue order endpoints reject quantities that are not multiples of the
//! instrument's `step_size`, and f64 arithmetic leaves floating-point tails
//! ("0.26600000000000001") that fail string validation. Quantisation is done
//! in `Decimal` and rendered back without tails.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

/// Floor `value` to the nearest lower multiple of `step`.
///
/// Binary-float noise is forgiven: a value within 1e-9 steps of an exact
/// multiple (e.g. `10000 × 0.30 / 50000` landing at 0.059999999999999995)
/// snaps to that multiple instead of dropping a whole step. A non-positive
/// or non-finite `step` returns `value` unchanged; a non-finite `value`
/// returns 0.
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    if !(step.is_finite() && step > 0.0) {
        return value;
    }
    let (Some(v), Some(s)) = (Decimal::from_f64(value), Decimal::from_f64(step)) else {
        return 0.0;
    };
    if s.is_zero() {
        return value;
    }
    let ratio = v / s;
    let nearest = ratio.round();
    let snap_tolerance = Decimal::new(1, 9); // 1e-9 steps
    let steps = if (ratio - nearest).abs() <= snap_tolerance {
        nearest
    } else {
        ratio.floor()
    };
    (steps * s).to_f64().unwrap_or(0.0)
}

/// Render `value` as a venue-acceptable string with the precision of `step`.
///
/// `format_step(0.266, 0.001)` → `"0.266"`, `format_step(50000.0, 0.5)` →
/// `"50000"` (trailing zeros and dangling dots stripped).
pub fn format_step(value: f64, step: f64) -> String {
    let quantised = floor_to_step(value, step);
    let decimals = step_decimals(step);
    let mut s = format!("{quantised:.decimals$}");
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    s
}

/// Number of decimal places implied by a step size (capped at 8).
fn step_decimals(step: f64) -> usize {
    if !(step.is_finite() && step > 0.0) {
        return 8;
    }
    let mut decimals = 0usize;
    let mut s = step;
    while decimals < 8 && (s.fract()).abs() > 1e-9 {
        s *= 10.0;
        decimals += 1;
    }
    decimals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floors_to_step() {
        assert_eq!(floor_to_step(0.2668, 0.001), 0.266);
        assert_eq!(floor_to_step(13_340.0 / 50_000.0, 0.001), 0.266);
        assert_eq!(floor_to_step(1.0, 0.1), 1.0);
        assert_eq!(floor_to_step(0.05, 0.1), 0.0);
    }

    #[test]
    fn flooring_is_idempotent() {
        let once = floor_to_step(0.123_456, 0.001);
        assert_eq!(floor_to_step(once, 0.001), once);
    }

    #[test]
    fn near_multiple_snaps_instead_of_dropping_a_step() {
        // 10000 * 0.30 / 50000 is 0.059999999999999995 in f64.
        let qty = floor_to_step(10_000.0 * 0.30 / 50_000.0, 0.001);
        assert_eq!(qty, 0.060);
    }

    #[test]
    fn degenerate_steps_pass_through() {
        assert_eq!(floor_to_step(1.5, 0.0), 1.5);
        assert_eq!(floor_to_step(1.5, f64::NAN), 1.5);
        assert_eq!(floor_to_step(f64::NAN, 0.1), 0.0);
    }

    #[test]
    fn formats_without_float_tails() {
        assert_eq!(format_step(0.266_000_000_000_000_01, 0.001), "0.266");
        assert_eq!(format_step(50_000.0, 0.5), "50000");
        assert_eq!(format_step(0.1 + 0.2, 0.1), "0.3");
    }

    #[test]
    fn step_decimal_inference() {
        assert_eq!(step_decimals(0.001), 3);
        assert_eq!(step_decimals(1.0), 0);
        assert_eq!(step_decimals(0.5), 1);
    }
}
