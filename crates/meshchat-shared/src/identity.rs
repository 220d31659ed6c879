use rand::Rng;

use crate::constants::{PEER_ID_CODE_LEN, PEER_ID_PREFIX};
use crate::types::PeerIdentity;

/// nanoid's URL-safe alphabet. `_` and `-` are stripped afterwards because
/// the rendezvous namespace only accepts alphanumerics after the prefix.
const CODE_ALPHABET: &[u8] = b"_-0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Generate a fresh identity: `user-` followed by a random short code.
pub fn generate_peer_identity() -> PeerIdentity {
    generate_with(&mut rand::thread_rng())
}

/// Same as [`generate_peer_identity`] with a caller-supplied RNG.
pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> PeerIdentity {
    loop {
        let code: String = (0..PEER_ID_CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        let code = strip_non_alphanumeric(&code);
        // All eight characters landing on `_`/`-` is possible, just unlikely.
        if !code.is_empty() {
            return PeerIdentity::new(format!("{PEER_ID_PREFIX}{code}"));
        }
    }
}

pub fn strip_non_alphanumeric(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}
