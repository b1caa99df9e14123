use anyhow::{anyhow, Result};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 256-bit key for stored-credential encryption.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

pub fn generate_key() -> EncryptionKey {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    EncryptionKey(bytes)
}

/// Returns `None` unless exactly 32 bytes are supplied.
pub fn load_key(bytes: &[u8]) -> Option<EncryptionKey> {
    let arr: [u8; 32] = bytes.try_into().ok()?;
    Some(EncryptionKey(arr))
}

/// Derive a key from an operator-supplied passphrase.
pub fn derive_key(passphrase: &str) -> EncryptionKey {
    let digest = Sha256::digest(passphrase.as_bytes());
    EncryptionKey(digest.into())
}

pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; 12])> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| anyhow!("credential encryption failed"))?;
    Ok((ciphertext, nonce))
}

pub fn decrypt(key: &EncryptionKey, ciphertext: &[u8], nonce: &[u8; 12]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("credential decryption failed (wrong key?)"))
}
