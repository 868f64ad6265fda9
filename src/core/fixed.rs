//! Q16.16 Fixed-Point Arithmetic
//!
//! Deterministic scalar type used for every simulated quantity that would
//! otherwise be a float: the per-tick delta time stored in the frame globals,
//! physics settings, and anything user systems want to keep bit-exact.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Bit Layout: Q16.16 (32-bit signed integer)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  [S][IIIIIIIIIIIIIII][FFFFFFFFFFFFFFFF]                     │
//! │   │  └── 15 bits ──┘ └──── 16 bits ───┘                     │
//! │   └─ Sign bit                                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

/// Q16.16 fixed-point number stored as i32.
pub type Fixed = i32;

/// Number of fractional bits (16)
pub const FIXED_SCALE: i32 = 16;

/// 1.0 in fixed-point (65536)
pub const FIXED_ONE: Fixed = 1 << FIXED_SCALE;

/// 0.5 in fixed-point (32768)
pub const FIXED_HALF: Fixed = FIXED_ONE >> 1;

// =============================================================================
// CORE OPERATIONS
// =============================================================================

/// Convert a float to fixed-point.
///
/// Only for configuration and tests, never inside a tick.
///
/// ```
/// use lockstep::core::fixed::{to_fixed, FIXED_ONE};
/// const HALF: i32 = to_fixed(0.5);
/// assert_eq!(HALF, FIXED_ONE / 2);
/// ```
#[inline]
pub const fn to_fixed(f: f64) -> Fixed {
    (f * (FIXED_ONE as f64)) as Fixed
}

/// Convert fixed-point to float for display.
#[inline]
pub fn to_float(f: Fixed) -> f32 {
    f as f32 / FIXED_ONE as f32
}

/// Multiply two fixed-point numbers through an i64 intermediate.
#[inline]
pub fn fixed_mul(a: Fixed, b: Fixed) -> Fixed {
    let wide = (a as i64) * (b as i64);
    (wide >> FIXED_SCALE) as Fixed
}

/// Divide two fixed-point numbers. Divide-by-zero returns 0.
#[inline]
pub fn fixed_div(a: Fixed, b: Fixed) -> Fixed {
    if b == 0 {
        return 0;
    }
    let wide = (a as i64) << FIXED_SCALE;
    (wide / b as i64) as Fixed
}

/// Exact rational `num / den` in fixed-point, computed with integers only.
///
/// Used for deriving the simulation delta time from the update rate, so two
/// peers with the same config always agree on the bits.
#[inline]
pub fn fixed_ratio(num: i32, den: i32) -> Fixed {
    if den == 0 {
        return 0;
    }
    (((num as i64) << FIXED_SCALE) / den as i64) as Fixed
}

/// Delta time of one tick at `update_fps`.
#[inline]
pub fn delta_time_for_fps(update_fps: u32) -> Fixed {
    fixed_ratio(1, update_fps.min(i32::MAX as u32) as i32)
}

/// Clamp a fixed-point number to a range.
#[inline]
pub fn fixed_clamp(value: Fixed, min: Fixed, max: Fixed) -> Fixed {
    value.max(min).min(max)
}
