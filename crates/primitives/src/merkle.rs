//! Merkle tree commitment over block transactions.

use kestrel_consensus::Hash256;

use crate::hash::sha256d;

/// Computes the merkle root of a list of leaf hashes.
///
/// An odd row duplicates its last entry, so the root of a single leaf is
/// the leaf itself and the root of an empty list is all zeroes.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return [0u8; 32];
    }
    let mut row: Vec<Hash256> = leaves.to_vec();
    while row.len() > 1 {
        let mut next = Vec::with_capacity(row.len().div_ceil(2));
        for pair in row.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut joined = [0u8; 64];
            joined[..32].copy_from_slice(&left);
            joined[32..].copy_from_slice(&right);
            next.push(sha256d(&joined));
        }
        row = next;
    }
    row[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = [0x42u8; 32];
        assert_eq!(merkle_root(&[leaf]), leaf);
        assert_eq!(merkle_root(&[]), [0u8; 32]);
    }

    #[test]
    fn odd_row_duplicates_last_leaf() {
        let a = [0x01u8; 32];
        let b = [0x02u8; 32];
        let c = [0x03u8; 32];
        // [a b c] pairs as (a,b) (c,c).
        assert_eq!(merkle_root(&[a, b, c]), merkle_root(&[a, b, c, c]));
        assert_ne!(merkle_root(&[a, b, c]), merkle_root(&[a, c, b]));
    }
}
