//! Symmetric encryption primitives used for mailbox shard ciphertext.
//!
//! Gift-wrap/seal encryption (NIP-44 v2) is handled entirely by `nostr-sdk`;
//! this module only covers the service's own at-rest/on-relay encryption of
//! mailbox shard JSON under the per-user `mailboxKey`/`blobKey`.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

/// Encrypt `plaintext` under `key` (32 bytes). A fresh random 12-byte nonce
/// is generated and prepended to the ciphertext, matching the host's
/// internal ChaCha20Poly1305 envelope convention.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, String> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| "invalid key".to_string())?;

    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce: Nonce = nonce_bytes.into();

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| "encryption failed".to_string())?;

    let mut buffer = Vec::with_capacity(12 + ciphertext.len());
    buffer.extend_from_slice(&nonce_bytes);
    buffer.extend_from_slice(&ciphertext);
    Ok(buffer)
}

/// Inverse of [`encrypt`]. Fails if the envelope is too short or
/// authentication does not check out.
pub fn decrypt(key: &[u8; 32], envelope: &[u8]) -> Result<Vec<u8>, String> {
    if envelope.len() < 12 {
        return Err("ciphertext too short".to_string());
    }
    let (nonce_bytes, ciphertext) = envelope.split_at(12);
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| "invalid key".to_string())?;
    let nonce_arr: [u8; 12] = nonce_bytes.try_into().map_err(|_| "bad nonce".to_string())?;
    let nonce: Nonce = nonce_arr.into();
    cipher
        .decrypt(&nonce, ciphertext)
        .map_err(|_| "decryption failed".to_string())
}

/// Encrypt a `serde_json::Value` (or any `Serialize`) and hex-encode the
/// envelope for embedding as event content.
pub fn encrypt_json<T: serde::Serialize>(key: &[u8; 32], value: &T) -> Result<String, String> {
    let plaintext = serde_json::to_vec(value).map_err(|e| format!("serialize: {}", e))?;
    let envelope = encrypt(key, &plaintext)?;
    Ok(crate::util::bytes_to_hex(&envelope))
}

pub fn decrypt_json<T: serde::de::DeserializeOwned>(key: &[u8; 32], hex_envelope: &str) -> Result<T, String> {
    let envelope = crate::util::hex_to_bytes(hex_envelope)?;
    let plaintext = decrypt(key, &envelope)?;
    serde_json::from_slice(&plaintext).map_err(|e| format!("deserialize: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = [7u8; 32];
        let envelope = encrypt(&key, b"hello mailbox").unwrap();
        assert_eq!(decrypt(&key, &envelope).unwrap(), b"hello mailbox");
    }

    #[test]
    fn wrong_key_fails() {
        let key = [7u8; 32];
        let other = [9u8; 32];
        let envelope = encrypt(&key, b"hello mailbox").unwrap();
        assert!(decrypt(&other, &envelope).is_err());
    }

    #[test]
    fn json_roundtrip() {
        let key = [1u8; 32];
        let value = serde_json::json!({"rev": 3, "pending": []});
        let hex = encrypt_json(&key, &value).unwrap();
        let back: serde_json::Value = decrypt_json(&key, &hex).unwrap();
        assert_eq!(back, value);
    }
}
