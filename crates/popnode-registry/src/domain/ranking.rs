//! # Ranking Engine
//!
//! Deterministic per-block ordering of enabled entries. Every honest node
//! computes the same ranks for the same block.

use primitive_types::U256;

use crate::domain::entry::NodeEntry;
use crate::domain::types::{double_sha256, Hash, NodeIdentity};

/// `|H(block_hash ‖ (txid + vout)) − H(block_hash)|` as 256-bit integers.
pub fn calculate_score(identity: &NodeIdentity, block_hash: &Hash) -> U256 {
    let collateral = U256::from_big_endian(&identity.txid)
        .overflowing_add(U256::from(identity.vout))
        .0;
    let mut collateral_bytes = [0u8; 32];
    collateral.to_big_endian(&mut collateral_bytes);

    let mut preimage = Vec::with_capacity(64);
    preimage.extend_from_slice(block_hash);
    preimage.extend_from_slice(&collateral_bytes);

    let with_collateral = U256::from_big_endian(&double_sha256(&preimage));
    let block_only = U256::from_big_endian(&double_sha256(block_hash));

    if with_collateral > block_only {
        with_collateral - block_only
    } else {
        block_only - with_collateral
    }
}

/// Rank enabled entries meeting `min_protocol` against `block_hash`.
///
/// Ascending by score, ties broken by identity; ranks start at 1.
pub fn rank_entries<'a, I>(
    entries: I,
    block_hash: &Hash,
    min_protocol: Option<u32>,
) -> Vec<(usize, &'a NodeEntry)>
where
    I: IntoIterator<Item = &'a NodeEntry>,
{
    let mut scored: Vec<(U256, &NodeEntry)> = entries
        .into_iter()
        .filter(|e| e.is_enabled())
        .filter(|e| min_protocol.map_or(true, |floor| e.protocol_version >= floor))
        .map(|e| (calculate_score(&e.identity, block_hash), e))
        .collect();

    scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.identity.cmp(&b.1.identity)));

    scored
        .into_iter()
        .enumerate()
        .map(|(i, (_, entry))| (i + 1, entry))
        .collect()
}
