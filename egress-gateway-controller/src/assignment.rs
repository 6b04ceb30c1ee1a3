//! Endpoint to gateway assignment.
//!
//! Rendezvous hashing: every (endpoint, gateway) pair gets a score and the
//! endpoint goes to the highest scoring gateway. Removing a gateway only moves
//! the endpoints it served; adding one only moves endpoints it now outscores.

use sha2::{Digest, Sha256};

fn score(endpoint: &str, gateway: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update([0u8]);
    hasher.update(gateway.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Index of the gateway serving `endpoint`, or None when there are no gateways.
/// Equal scores go to the lexicographically smaller gateway name.
pub fn assign_gateway<S: AsRef<str>>(endpoint: &str, gateways: &[S]) -> Option<usize> {
    gateways
        .iter()
        .enumerate()
        .map(|(idx, gateway)| (idx, gateway.as_ref(), score(endpoint, gateway.as_ref())))
        .max_by(|(_, a_name, a_score), (_, b_name, b_score)| {
            a_score.cmp(b_score).then_with(|| b_name.cmp(a_name))
        })
        .map(|(idx, _, _)| idx)
}
