//! Key-Derivation (KD): per-user secrets derived from an ECDH shared point
//! between the requester's pubkey and the DVM's secret key, via HKDF-SHA256.
//!
//! Every value is deterministic in `(userPubkey, dvmPubkey)` and is never
//! persisted — only cached in memory for the lifetime of the process.

use hkdf::Hkdf;
use lazy_static::lazy_static;
use nostr_sdk::prelude::*;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use zeroize::Zeroize;

const SALT: &[u8] = b"pidgeon:v3";

/// The four labeled sub-keys plus the root key and mailbox id derived for a
/// single user. Zeroized on drop since these are long-lived capability keys.
#[derive(Clone)]
pub struct DerivedSecrets {
    pub root_key: [u8; 32],
    pub mb: [u8; 16],
    pub mailbox_key: [u8; 32],
    pub submit_key: [u8; 32],
    pub dm_key: [u8; 32],
    pub blob_key: [u8; 32],
}

impl Drop for DerivedSecrets {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.mb.zeroize();
        self.mailbox_key.zeroize();
        self.submit_key.zeroize();
        self.dm_key.zeroize();
        self.blob_key.zeroize();
    }
}

lazy_static! {
    /// Per-user derived-secrets cache. Entries never expire — the value is a
    /// pure function of the two pubkeys, so staleness is not possible.
    static ref SECRETS_CACHE: Mutex<HashMap<PublicKey, DerivedSecrets>> = Mutex::new(HashMap::new());
}

fn hkdf_expand(prk_ikm: &[u8], salt: &[u8], info: &str, out: &mut [u8]) -> Result<(), String> {
    let hk = Hkdf::<Sha256>::new(Some(salt), prk_ikm);
    hk.expand(info.as_bytes(), out)
        .map_err(|_| "hkdf output too long".to_string())
}

/// Derive (or fetch from cache) the secrets shared between `user` and the
/// DVM identified by `dvm_keys`.
pub fn derive_for_user(user: &PublicKey, dvm_keys: &Keys) -> Result<DerivedSecrets, String> {
    let dvm_pubkey = dvm_keys.public_key();

    if let Some(cached) = SECRETS_CACHE.lock().unwrap().get(user) {
        return Ok(cached.clone());
    }

    // ECDH shared point between the DVM secret key and the user's pubkey.
    let shared = nip44::v2::generate_conversation_key(dvm_keys.secret_key(), user)
        .map_err(|e| format!("ecdh failed: {}", e))?;

    let root_info = format!("pidgeon:v3:root:{}", dvm_pubkey.to_hex());
    let mut root_key = [0u8; 32];
    hkdf_expand(shared.as_slice(), SALT, &root_info, &mut root_key)?;

    let mut mailbox_key = [0u8; 32];
    hkdf_expand(&root_key, b"", "pidgeon:v3:key:mailbox", &mut mailbox_key)?;
    let mut submit_key = [0u8; 32];
    hkdf_expand(&root_key, b"", "pidgeon:v3:key:submit", &mut submit_key)?;
    let mut dm_key = [0u8; 32];
    hkdf_expand(&root_key, b"", "pidgeon:v3:key:dm", &mut dm_key)?;
    let mut blob_key = [0u8; 32];
    hkdf_expand(&root_key, b"", "pidgeon:v3:key:blob", &mut blob_key)?;

    let mut mb = [0u8; 16];
    hkdf_expand(&root_key, b"", "pidgeon:v3:mailbox-id", &mut mb)?;

    let secrets = DerivedSecrets {
        root_key,
        mb,
        mailbox_key,
        submit_key,
        dm_key,
        blob_key,
    };

    SECRETS_CACHE
        .lock()
        .unwrap()
        .insert(*user, secrets.clone());
    Ok(secrets)
}

/// URL-safe base64, no padding — the wire form of `mb` used in `d`-tags.
pub fn mb_to_string(mb: &[u8; 16]) -> String {
    crate::util::b64url_encode(mb)
}

/// Drop any cached secrets (used in tests / on explicit key rotation).
pub fn clear_cache() {
    SECRETS_CACHE.lock().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_pair() {
        clear_cache();
        let dvm = Keys::generate();
        let user = Keys::generate();
        let a = derive_for_user(&user.public_key(), &dvm).unwrap();
        clear_cache();
        let b = derive_for_user(&user.public_key(), &dvm).unwrap();
        assert_eq!(a.root_key, b.root_key);
        assert_eq!(a.mb, b.mb);
    }

    #[test]
    fn differs_across_users() {
        clear_cache();
        let dvm = Keys::generate();
        let a = derive_for_user(&Keys::generate().public_key(), &dvm).unwrap();
        let b = derive_for_user(&Keys::generate().public_key(), &dvm).unwrap();
        assert_ne!(a.root_key, b.root_key);
        assert_ne!(a.mb, b.mb);
    }

    #[test]
    fn mb_encodes_url_safe_no_padding() {
        clear_cache();
        let dvm = Keys::generate();
        let user = Keys::generate();
        let secrets = derive_for_user(&user.public_key(), &dvm).unwrap();
        let encoded = mb_to_string(&secrets.mb);
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
    }
}
