//! Binary tree commitment over an ordered sequence of 32-byte leaves.
//!
//! Adjacent leaves are hashed pairwise with SHA-256; an odd level duplicates
//! its last element. The empty commitment is the digest of the empty string
//! and a single leaf commits to itself.

use serde::{Deserialize, Serialize};

use crate::hash::sha256;

/// Which side of the running hash a proof sibling sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiblingSide {
    Left,
    Right,
}

/// One level of an inclusion proof: the sibling digest and its side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: [u8; 32],
    pub side: SiblingSide,
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256(&buf)
}

/// Root of the commitment over `leaves` in order.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return sha256(b"");
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().expect("level is non-empty"));
        }
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}

/// Inclusion proof for `index`, or None if out of range.
pub fn merkle_proof(leaves: &[[u8; 32]], index: usize) -> Option<Vec<ProofStep>> {
    if index >= leaves.len() {
        return None;
    }
    let mut proof = Vec::new();
    let mut level = leaves.to_vec();
    let mut i = index;
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().expect("level is non-empty"));
        }
        let (sibling_index, side) = if i % 2 == 0 {
            (i + 1, SiblingSide::Right)
        } else {
            (i - 1, SiblingSide::Left)
        };
        proof.push(ProofStep {
            sibling: level[sibling_index],
            side,
        });
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
        i /= 2;
    }
    Some(proof)
}

/// Recompute the root from a leaf and its proof and compare.
pub fn verify_proof(leaf: [u8; 32], proof: &[ProofStep], root: [u8; 32]) -> bool {
    let mut acc = leaf;
    for step in proof {
        acc = match step.side {
            SiblingSide::Left => hash_pair(&step.sibling, &acc),
            SiblingSide::Right => hash_pair(&acc, &step.sibling),
        };
    }
    acc == root
}
