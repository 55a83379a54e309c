//! # Cryptographic Primitives
//!
//! Everything the handshake and the session envelope need, behind small types:
//!
//! - [`KeyPair`]: per-connection ephemeral X25519 secret (key agreement) plus an
//!   Ed25519 signing key (authentication of the agreed hash)
//! - [`PublicKey`]: the 64-byte exported form `x25519 || ed25519`
//! - [`hash`]: SHA-256
//! - [`derive_password_key`]: HKDF-SHA256 stretching of a shared value into a
//!   session key
//! - [`SessionCipher`]: XChaCha20-Poly1305 AEAD, `nonce(24) || ciphertext`
//!
//! All secret material is zeroized on drop.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use tracing::debug;
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{constants, ProtocolError, Result};

/// Size of an exported public key (x25519 || ed25519)
pub const PUBLIC_KEY_SIZE: usize = 64;
/// Size of an Ed25519 signature
pub const SIGNATURE_SIZE: usize = 64;
/// Size of a SHA-256 digest
pub const HASH_SIZE: usize = 32;
/// Size of a session key
pub const KEY_SIZE: usize = 32;
/// Size of an XChaCha20 nonce
pub const NONCE_SIZE: usize = 24;

const KDF_SALT: &[u8] = b"uni-rpc/v1/session-salt";
const KDF_INFO: &[u8] = b"uni-rpc/v1/session-key";

/// SHA-256 of `data`
pub fn hash(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Output of an X25519 agreement
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Symmetric session key
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Stretch a shared value into a session key
pub fn derive_password_key(secret: &[u8]) -> Result<SessionKey> {
    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), secret);
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(KDF_INFO, &mut okm)
        .map_err(|_| ProtocolError::HandshakeError("key derivation failed".into()))?;
    let key = SessionKey(okm);
    okm.zeroize();
    Ok(key)
}

/// Ephemeral key pair used for one handshake
pub struct KeyPair {
    ecdh: StaticSecret,
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            ecdh: StaticSecret::random_from_rng(OsRng),
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            ecdh: x25519_dalek::PublicKey::from(&self.ecdh),
            verifying: self.signing.verifying_key(),
        }
    }

    /// X25519 agreement with a peer
    pub fn diffie_hellman(&self, peer: &PublicKey) -> SharedSecret {
        SharedSecret(self.ecdh.diffie_hellman(&peer.ecdh).to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Public half of a [`KeyPair`]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    ecdh: x25519_dalek::PublicKey,
    verifying: VerifyingKey,
}

impl PublicKey {
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        out[..32].copy_from_slice(self.ecdh.as_bytes());
        out[32..].copy_from_slice(self.verifying.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(ProtocolError::HandshakeError(
                constants::ERR_INVALID_PUBLIC_KEY.into(),
            ));
        }
        let mut ecdh = [0u8; 32];
        let mut verifying = [0u8; 32];
        ecdh.copy_from_slice(&bytes[..32]);
        verifying.copy_from_slice(&bytes[32..]);
        let verifying = VerifyingKey::from_bytes(&verifying).map_err(|_| {
            ProtocolError::HandshakeError(constants::ERR_INVALID_PUBLIC_KEY.into())
        })?;
        Ok(Self {
            ecdh: x25519_dalek::PublicKey::from(ecdh),
            verifying,
        })
    }

    /// Check an Ed25519 signature over `message`
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            debug!("{}", constants::ERR_INVALID_SIGNATURE);
            return false;
        };
        self.verifying.verify(message, &signature).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        write!(f, "PublicKey(")?;
        for b in &bytes[..6] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// AEAD wrapper applied to encoded packets once a session key exists
pub struct SessionCipher {
    cipher: XChaCha20Poly1305,
}

impl SessionCipher {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
        }
    }

    /// Generate a fresh random nonce
    pub fn generate_nonce() -> Result<[u8; NONCE_SIZE]> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce).map_err(|_| ProtocolError::EncryptionFailure)?;
        Ok(nonce)
    }

    /// Encrypt to `nonce || ciphertext`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = Self::generate_nonce()?;
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| {
                debug!("{}", constants::ERR_ENCRYPTION_FAILED);
                ProtocolError::EncryptionFailure
            })?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend(ciphertext);
        nonce.zeroize();
        Ok(out)
    }

    /// Decrypt `nonce || ciphertext`
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < NONCE_SIZE {
            debug!(len = payload.len(), "{}", constants::ERR_CIPHERTEXT_TOO_SHORT);
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                debug!("{}", constants::ERR_DECRYPTION_FAILED);
                ProtocolError::DecryptionFailure
            })
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionCipher(..)")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_is_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let ab = a.diffie_hellman(&b.public_key());
        let ba = b.diffie_hellman(&a.public_key());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_public_key_export_roundtrip() {
        let pair = KeyPair::generate();
        let exported = pair.public_key().to_bytes();
        let imported = PublicKey::from_bytes(&exported).unwrap();
        assert_eq!(imported, pair.public_key());
        assert!(PublicKey::from_bytes(&exported[..63]).is_err());
    }

    #[test]
    fn test_signature_verification() {
        let pair = KeyPair::generate();
        let other = KeyPair::generate();
        let digest = hash(b"shared");
        let sig = pair.sign(&digest);

        assert!(pair.public_key().verify(&digest, &sig));
        assert!(!other.public_key().verify(&digest, &sig));
        assert!(!pair.public_key().verify(&hash(b"other"), &sig));
        assert!(!pair.public_key().verify(&digest, &sig[..10]));
    }

    #[test]
    fn test_password_key_is_deterministic() {
        let k1 = derive_password_key(b"secret").unwrap();
        let k2 = derive_password_key(b"secret").unwrap();
        let k3 = derive_password_key(b"secreT").unwrap();
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_cipher_roundtrip_and_tamper() {
        let key = derive_password_key(b"k").unwrap();
        let cipher = SessionCipher::new(&key);
        let sealed = cipher.encrypt(b"hello").unwrap();
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"hello");

        let mut tampered = sealed.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(matches!(
            cipher.decrypt(&tampered),
            Err(ProtocolError::DecryptionFailure)
        ));

        let wrong = SessionCipher::new(&derive_password_key(b"other").unwrap());
        assert!(wrong.decrypt(&sealed).is_err());
        assert!(cipher.decrypt(&[0u8; 4]).is_err());
    }
}
