//! Saturating vector summation.

/// Sum a vector of `u16` values, clamping at `u16::MAX` instead of wrapping.
///
/// The accumulator is 32 bits wide; once the running total reaches the
/// maximum it can never decrease, so the loop stops early.
pub fn saturating_sum(vector: &[u16]) -> u16 {
    let mut sum: u32 = 0;

    for &value in vector {
        sum += u32::from(value);
        if sum >= u32::from(u16::MAX) {
            return u16::MAX;
        }
    }

    sum as u16
}
