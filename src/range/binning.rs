//! Size-class binning.
//!
//! Free regions are sorted into 256 bins whose advertised sizes follow a
//! small floating-point distribution: a 3-bit mantissa (8 values per
//! exponent) and up to 32 exponent levels, giving a piecewise-linear
//! logarithmic progression. Per size class the worst-case internal overhead
//! is bounded by `1/8 = 12.5%`.
//!
//! A bin index decomposes as `(exponent << 3) | mantissa`, which is also the
//! `(top, leaf)` split used by the allocator's two-level bitmap: the top
//! 5 bits select one of 32 top bins, the low 3 bits one of 8 leaf bins.
//!
//! Sizes below 8 live in a "denorm" region where the bin index is the size
//! itself, so tiny regions are byte-exact.
//!
//! Two rounding directions exist and must not be merged: allocation rounds
//! the request *up* (every node in the found bin is then guaranteed to fit),
//! while insertion of a free node rounds *down* (a bin never advertises more
//! than its members can deliver).

pub(crate) const MANTISSA_BITS: u32 = 3;
pub(crate) const MANTISSA_VALUE: u32 = 1 << MANTISSA_BITS;
pub(crate) const MANTISSA_MASK: u32 = MANTISSA_VALUE - 1;

/// Smallest bin index whose every member size is `>= size`.
pub(crate) fn bin_index_round_up(size: u32) -> u32 {
    if size < MANTISSA_VALUE {
        // Denorm: the bin index is the size itself.
        return size;
    }

    // Normalized: the hidden high bit is implied and not stored, just like
    // a float.
    let highest_set_bit = 31 - size.leading_zeros();
    let mantissa_start_bit = highest_set_bit - MANTISSA_BITS;
    let exp = mantissa_start_bit + 1;
    let mut mantissa = (size >> mantissa_start_bit) & MANTISSA_MASK;

    // Round up when any discarded low bit is set. Addition lets the carry
    // ripple from the mantissa into the exponent.
    let low_bits_mask = (1u32 << mantissa_start_bit) - 1;
    if size & low_bits_mask != 0 {
        mantissa += 1;
    }

    (exp << MANTISSA_BITS) + mantissa
}

/// Largest bin index whose advertised size is `<= size`.
pub(crate) fn bin_index_round_down(size: u32) -> u32 {
    if size < MANTISSA_VALUE {
        return size;
    }

    let highest_set_bit = 31 - size.leading_zeros();
    let mantissa_start_bit = highest_set_bit - MANTISSA_BITS;
    let exp = mantissa_start_bit + 1;
    let mantissa = (size >> mantissa_start_bit) & MANTISSA_MASK;

    (exp << MANTISSA_BITS) | mantissa
}

/// Advertised (representative) size of a bin. Inverse of the round
/// conversions for exact representatives; overflows past bin 239.
pub(crate) fn bin_to_size(bin_index: u32) -> u32 {
    let exponent = bin_index >> MANTISSA_BITS;
    let mantissa = bin_index & MANTISSA_MASK;
    if exponent == 0 {
        // Denorm
        mantissa
    } else {
        (mantissa | MANTISSA_VALUE) << (exponent - 1)
    }
}

/// Position of the lowest set bit of `mask` at index `>= start_bit_index`,
/// or `None` when no such bit exists.
pub(crate) fn lowest_set_bit_at_or_after(mask: u32, start_bit_index: u32) -> Option<u32> {
    debug_assert!(start_bit_index < 32);
    let mask_before_start = (1u32 << start_bit_index) - 1;
    let bits_at_or_after = mask & !mask_before_start;
    if bits_at_or_after == 0 {
        None
    } else {
        Some(bits_at_or_after.trailing_zeros())
    }
}
