//! Deterministic alert-pool id derivation (spec §6).
//!
//! The pool id is a 64-bit hash folded sequentially over `objectid`,
//! `source`, `object`, in that order, matching the field order the
//! reference alert manager folds them in. Any fixed mixing function
//! satisfies the spec; this one is an FNV-1a-style accumulator, chosen
//! because it is the simplest fixed, allocation-free 64-bit mix available
//! without pulling in an extra hashing crate for three integers.

use am_common::AlertPoolId;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a_fold(hash: u64, bytes: &[u8]) -> u64 {
    let mut h = hash;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Compute the stable alert-pool id for `(objectid, source, object)`.
///
/// Folding order is fixed: `objectid` (u64) first, then `source` (i32), then
/// `object` (i32). Two calls with identical arguments always produce the
/// identical id, across process restarts, because the mix has no
/// process-local seed.
pub fn calc_alertpoolid(objectid: u64, source: i32, object: i32) -> AlertPoolId {
    let mut h = FNV_OFFSET_BASIS;
    h = fnv1a_fold(h, &objectid.to_le_bytes());
    h = fnv1a_fold(h, &source.to_le_bytes());
    h = fnv1a_fold(h, &object.to_le_bytes());
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_produce_identical_id() {
        let a = calc_alertpoolid(42, 0, 0);
        let b = calc_alertpoolid(42, 0, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn differing_objectid_produces_different_id() {
        let a = calc_alertpoolid(42, 0, 0);
        let b = calc_alertpoolid(43, 0, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn differing_source_or_object_produces_different_id() {
        let base = calc_alertpoolid(1, 1, 1);
        assert_ne!(base, calc_alertpoolid(1, 2, 1));
        assert_ne!(base, calc_alertpoolid(1, 1, 2));
    }

    #[test]
    fn field_order_matters() {
        // Swapping source/object across two calls with the same set of
        // values must not collide, confirming the fold is order-sensitive.
        let a = calc_alertpoolid(1, 5, 9);
        let b = calc_alertpoolid(1, 9, 5);
        assert_ne!(a, b);
    }
}
