//! Protocol-specific key material, event signing, and pairwise encryption.
//!
//! spec.md §1 names "the protocol-specific event encoding and signature
//! primitives" as an external collaborator, interacted with only through a
//! contract. This module *is* that contract's concrete implementation:
//! secp256k1 keys with Schnorr (BIP-340-style) signing for `sign_event`, and
//! an ECDH + HKDF + ChaCha20-Poly1305 construction standing in for the
//! protocol's own pairwise `encrypt`/`decrypt` methods.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use secp256k1::{schnorr, Keypair, Secp256k1, SecretKey, XOnlyPublicKey};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::Error;

/// A key's plaintext material, held only in memory, never serialized.
pub struct PrivateKeyMaterial {
    secret: SecretKey,
}

impl Drop for PrivateKeyMaterial {
    fn drop(&mut self) {
        // SecretKey does not implement Zeroize directly; best effort via its
        // byte representation before the underlying memory is freed.
        let mut bytes = self.secret.secret_bytes();
        bytes.zeroize();
    }
}

impl PrivateKeyMaterial {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let secret = SecretKey::from_slice(bytes)
            .map_err(|e| Error::BadRequest(format!("invalid private key: {e}")))?;
        Ok(Self { secret })
    }

    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret, _pk) = secp.generate_keypair(&mut rand::thread_rng());
        Self { secret }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.secret_bytes()
    }

    /// x-only public key, hex-encoded, the way remote pubkeys are addressed
    /// throughout the RPC planes.
    pub fn public_key_hex(&self) -> String {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &self.secret);
        let (xonly, _parity) = XOnlyPublicKey::from_keypair(&keypair);
        hex::encode(xonly.serialize())
    }

    /// Sign an event's id (a 32-byte digest computed by the caller over the
    /// canonical event fields) with BIP-340 Schnorr.
    pub fn sign_event_id(&self, event_id: &[u8; 32]) -> Result<String, Error> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &self.secret);
        let msg = secp256k1::Message::from_digest(*event_id);
        let sig: schnorr::Signature =
            secp.sign_schnorr_with_rng(&msg, &keypair, &mut rand::thread_rng());
        Ok(hex::encode(sig.as_ref()))
    }

    /// ECDH shared secret with a remote x-only pubkey, used to derive the
    /// pairwise encryption key for `encrypt`/`decrypt`.
    fn shared_secret(&self, remote_pubkey_hex: &str) -> Result<[u8; 32], Error> {
        let xonly = parse_xonly(remote_pubkey_hex)?;
        // Even-parity full pubkey per BIP-340 convention.
        let full_pk = xonly
            .public_key(secp256k1::Parity::Even);
        let shared = secp256k1::ecdh::SharedSecret::new(&full_pk, &self.secret);
        Ok(shared.secret_bytes())
    }
}

pub fn pubkey_hex_from_secret(material: &PrivateKeyMaterial) -> String {
    material.public_key_hex()
}

fn parse_xonly(pubkey_hex: &str) -> Result<XOnlyPublicKey, Error> {
    let bytes = hex::decode(pubkey_hex)
        .map_err(|e| Error::BadRequest(format!("invalid pubkey hex: {e}")))?;
    XOnlyPublicKey::from_slice(&bytes)
        .map_err(|e| Error::BadRequest(format!("invalid pubkey: {e}")))
}

/// Derive a ChaCha20-Poly1305 key from a raw ECDH shared secret via HKDF-SHA256.
fn derive_aead_key(shared: &[u8; 32]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut out = [0u8; 32];
    hk.expand(b"bunkerd-pairwise-encryption", &mut out)
        .expect("32 is a valid HKDF output length");
    out
}

/// Pairwise-encrypt `plaintext` for `recipient_pubkey`, returning
/// `base64(nonce || ciphertext)`.
pub fn encrypt_pairwise(
    sender: &PrivateKeyMaterial,
    recipient_pubkey_hex: &str,
    plaintext: &[u8],
) -> Result<String, Error> {
    let shared = sender.shared_secret(recipient_pubkey_hex)?;
    let key = derive_aead_key(&shared);
    let cipher = ChaCha20Poly1305::new((&key).into());

    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::Internal(format!("encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(base64_encode(&out))
}

/// Pairwise-decrypt a `base64(nonce || ciphertext)` payload from `sender_pubkey`.
pub fn decrypt_pairwise(
    recipient: &PrivateKeyMaterial,
    sender_pubkey_hex: &str,
    payload_b64: &str,
) -> Result<Vec<u8>, Error> {
    let data = base64_decode(payload_b64)
        .map_err(|e| Error::BadRequest(format!("invalid base64 payload: {e}")))?;
    if data.len() < 12 {
        return Err(Error::BadRequest("ciphertext too short".into()));
    }
    let (nonce_bytes, ciphertext) = data.split_at(12);

    let shared = recipient.shared_secret(sender_pubkey_hex)?;
    let key = derive_aead_key(&shared);
    let cipher = ChaCha20Poly1305::new((&key).into());
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::BadPassphraseOrCorrupt)
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn base64_decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairwise_roundtrip() {
        let alice = PrivateKeyMaterial::generate();
        let bob = PrivateKeyMaterial::generate();

        let ct = encrypt_pairwise(&alice, &bob.public_key_hex(), b"hello bob").unwrap();
        let pt = decrypt_pairwise(&bob, &alice.public_key_hex(), &ct).unwrap();
        assert_eq!(pt, b"hello bob");
    }

    #[test]
    fn sign_event_id_produces_64_byte_hex_sig() {
        let key = PrivateKeyMaterial::generate();
        let id = [7u8; 32];
        let sig = key.sign_event_id(&id).unwrap();
        assert_eq!(sig.len(), 128);
    }
}
