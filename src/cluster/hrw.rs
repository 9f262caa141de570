//! Highest random weight (rendezvous) placement.
//!
//! Every node scores a key by mixing its own ID digest with the key's digest; the node with the
//! greatest score owns the key. A node joining or leaving only moves the keys it wins or won,
//! as the scores of all other nodes are unaffected.

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::cluster::{ClusterView, NodeInfo};
use crate::error::AppError;

/// Resolve the owner of the given placement key.
///
/// Ties are broken in favor of the lowest node ID, which keeps the result a pure function of
/// the key and the view.
pub fn resolve(key: &[u8], view: &ClusterView) -> Result<Arc<NodeInfo>> {
    resolve_key(seahash::hash(key), view)
}

/// Resolve the owner of a pre-hashed placement key.
fn resolve_key(key_digest: u64, view: &ClusterView) -> Result<Arc<NodeInfo>> {
    let mut owner: Option<(u64, &Arc<NodeInfo>)> = None;
    for node in view.nodes.values() {
        let score = mix64(node.digest ^ key_digest);
        match owner {
            Some((max, _)) if score <= max => continue,
            _ => owner = Some((score, node)),
        }
    }
    match owner {
        Some((_, node)) => Ok(node.clone()),
        None => bail!(AppError::NoEligibleNodes(view.version)),
    }
}

/// The splitmix64 finalizer, used to spread the xor of two digests across all bits.
fn mix64(mut val: u64) -> u64 {
    val = (val ^ (val >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    val = (val ^ (val >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    val ^ (val >> 31)
}
