//! Constant-time comparisons.
//!
//! Every comparison of a tag, digest or confirmation value against an
//! expected value goes through here. Length is treated as public.

use subtle::ConstantTimeEq;

/// Compare two byte strings without an early exit on the first difference.
///
/// Slices of different length compare unequal; only the length check
/// short-circuits.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Constant-time equality for 32-byte digests.
pub fn ct_eq_32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_compare_equal() {
        assert!(ct_eq(b"manifest", b"manifest"));
        assert!(ct_eq(&[], &[]));
        assert!(ct_eq_32(&[7u8; 32], &[7u8; 32]));
    }

    #[test]
    fn single_bit_difference_is_detected() {
        let a = [0u8; 32];
        for byte in 0..32 {
            for bit in 0..8 {
                let mut b = a;
                b[byte] ^= 1 << bit;
                assert!(!ct_eq_32(&a, &b));
                assert!(!ct_eq(&a, &b));
            }
        }
    }

    #[test]
    fn length_mismatch_is_unequal() {
        assert!(!ct_eq(b"abc", b"abcd"));
    }
}
