//! Crossfade curves

use std::f64::consts::FRAC_PI_2;

/// Position of `value` between `start` and `end`, clamped to [0, 1].
///
/// A degenerate range acts as a step at `end`.
pub fn ratio(value: f64, start: f64, end: f64) -> f64 {
    if end <= start {
        return if value >= end { 1.0 } else { 0.0 };
    }
    ((value - start) / (end - start)).clamp(0.0, 1.0)
}

/// Equal-power crossfade at position `x` (clamped to [0, 1]).
///
/// Returns `(outgoing, incoming)`; their squares always sum to one.
pub fn equal_power(x: f64) -> (f64, f64) {
    let x = x.clamp(0.0, 1.0);
    ((x * FRAC_PI_2).cos(), ((1.0 - x) * FRAC_PI_2).cos())
}

/// Equal-power crossfade across an RPM band
pub fn equal_power_band(value: f64, start: f64, end: f64) -> (f64, f64) {
    equal_power(ratio(value, start, end))
}
