//! Packet ids and random nonces.

use rand::{Rng, RngCore};

/// URL-safe alphabet used for packet ids
const ID_ALPHABET: &[u8; 64] = b"useandom-26T198340PX75pxJACKVERYMINDBUSHWOLF_GQZbfghjklqvwyzrict";

/// Length of generated packet ids (126 bits of entropy)
pub const PACKET_ID_LEN: usize = 21;

/// Generate a collision-resistant packet id
pub fn packet_id() -> String {
    let mut rng = rand::rng();
    (0..PACKET_ID_LEN)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Generate 32 random bytes
pub fn random_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_packet_ids_are_url_safe_and_unique() {
        let ids: HashSet<String> = (0..10_000).map(|_| packet_id()).collect();
        assert_eq!(ids.len(), 10_000);
        for id in ids.iter().take(100) {
            assert_eq!(id.len(), PACKET_ID_LEN);
            assert!(id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-'));
        }
    }

    #[test]
    fn test_nonces_differ() {
        assert_ne!(random_nonce(), random_nonce());
    }
}
