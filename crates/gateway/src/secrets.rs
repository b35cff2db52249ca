//! Namespaced secret storage: OS keychain when usable, encrypted file
//! otherwise.
//!
//! File backend format: `{v:1, salt, nonce, ciphertext, tag}` (all base64).
//! The key is scrypt-derived (n=2^14, r=8, p=1, dklen=32) from a master key
//! taken from `COURIER_SECRETS_MASTER_KEY` or a per-install 0600 key file.
//! The cipher is an HMAC-SHA256 keystream (`HMAC(key, nonce || counter)`
//! blocks XORed into the plaintext) with an HMAC tag over nonce+ciphertext.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD as B64_URL};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use courier_domain::config::{SecretsBackend, SecretsConfig};
use courier_domain::error::{Error, Result};

pub const MASTER_KEY_ENV: &str = "COURIER_SECRETS_MASTER_KEY";

type HmacSha256 = Hmac<Sha256>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store facade
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Backend {
    Keychain(KeychainBackend),
    File(EncryptedFileBackend),
}

pub struct SecretStore {
    backend: parking_lot::Mutex<Backend>,
    auto_mode: bool,
    namespace: String,
    data_dir: PathBuf,
}

impl SecretStore {
    pub fn new(config: &SecretsConfig, data_dir: &Path) -> Result<Self> {
        let namespace = config.namespace.clone();
        let backend = match config.backend {
            SecretsBackend::Keychain => {
                let keychain = KeychainBackend::new(&namespace);
                if !keychain.is_usable() {
                    return Err(Error::Secrets(
                        "requested keychain backend but no keychain is usable".into(),
                    ));
                }
                Backend::Keychain(keychain)
            }
            SecretsBackend::File => {
                Backend::File(EncryptedFileBackend::new(data_dir, &namespace)?)
            }
            SecretsBackend::Auto => {
                let keychain = KeychainBackend::new(&namespace);
                if keychain.is_usable() {
                    Backend::Keychain(keychain)
                } else {
                    Backend::File(EncryptedFileBackend::new(data_dir, &namespace)?)
                }
            }
        };
        Ok(Self {
            backend: parking_lot::Mutex::new(backend),
            auto_mode: config.backend == SecretsBackend::Auto,
            namespace,
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        match &*self.backend.lock() {
            Backend::Keychain(_) => "keychain",
            Backend::File(_) => "encrypted_file",
        }
    }

    /// In auto mode, a keychain that stopped being usable fails over to the
    /// encrypted file. Returns true when a failover happened.
    fn maybe_fail_over(&self) -> bool {
        if !self.auto_mode {
            return false;
        }
        let mut backend = self.backend.lock();
        if let Backend::Keychain(keychain) = &*backend {
            if !keychain.is_usable() {
                match EncryptedFileBackend::new(&self.data_dir, &self.namespace) {
                    Ok(file) => {
                        tracing::warn!("keychain became unusable; failing over to encrypted file");
                        *backend = Backend::File(file);
                        return true;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "secret backend failover failed");
                    }
                }
            }
        }
        false
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let value = match &*self.backend.lock() {
            Backend::Keychain(b) => b.get(key),
            Backend::File(b) => b.get(key),
        };
        if value.is_none() && self.maybe_fail_over() {
            return match &*self.backend.lock() {
                Backend::Keychain(b) => b.get(key),
                Backend::File(b) => b.get(key),
            };
        }
        value
    }

    pub fn set(&self, key: &str, value: &str) -> bool {
        let ok = match &*self.backend.lock() {
            Backend::Keychain(b) => b.set(key, value),
            Backend::File(b) => b.set(key, value),
        };
        if !ok && self.maybe_fail_over() {
            return match &*self.backend.lock() {
                Backend::Keychain(b) => b.set(key, value),
                Backend::File(b) => b.set(key, value),
            };
        }
        ok
    }

    pub fn delete(&self, key: &str) -> bool {
        let ok = match &*self.backend.lock() {
            Backend::Keychain(b) => b.delete(key),
            Backend::File(b) => b.delete(key),
        };
        if !ok && self.maybe_fail_over() {
            return match &*self.backend.lock() {
                Backend::Keychain(b) => b.delete(key),
                Backend::File(b) => b.delete(key),
            };
        }
        ok
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).map(|v| !v.is_empty()).unwrap_or(false)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Keychain backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct KeychainBackend {
    namespace: String,
}

impl KeychainBackend {
    fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
        }
    }

    fn entry(&self, key: &str) -> Option<keyring::Entry> {
        keyring::Entry::new(&format!("{}:{key}", self.namespace), &self.namespace).ok()
    }

    /// A keychain is usable when a probe lookup either succeeds or reports a
    /// clean "no entry" (both imply the keychain is reachable).
    fn is_usable(&self) -> bool {
        match self.entry("__probe__") {
            Some(entry) => matches!(
                entry.get_password(),
                Ok(_) | Err(keyring::Error::NoEntry)
            ),
            None => false,
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entry(key)?.get_password().ok()
    }

    fn set(&self, key: &str, value: &str) -> bool {
        match self.entry(key) {
            Some(entry) => entry.set_password(value).is_ok(),
            None => false,
        }
    }

    fn delete(&self, key: &str) -> bool {
        match self.entry(key) {
            Some(entry) => entry.delete_credential().is_ok(),
            None => false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Encrypted file backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Serialize, Deserialize)]
struct EncryptedPayload {
    v: u32,
    salt: String,
    nonce: String,
    ciphertext: String,
    tag: String,
}

struct EncryptedFileBackend {
    secrets_file: PathBuf,
    master_key: Vec<u8>,
}

impl EncryptedFileBackend {
    fn new(data_dir: &Path, _namespace: &str) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let secrets_file = data_dir.join("secrets.enc.json");
        let key_file = data_dir.join("secrets.key");
        let master_key = Self::load_master_key(&key_file)?;
        Ok(Self {
            secrets_file,
            master_key,
        })
    }

    fn load_master_key(key_file: &Path) -> Result<Vec<u8>> {
        if let Ok(env_key) = std::env::var(MASTER_KEY_ENV) {
            let trimmed = env_key.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.as_bytes().to_vec());
            }
        }

        if key_file.exists() {
            let raw = fs::read(key_file)?;
            let trimmed: Vec<u8> = raw
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            return Ok(B64_URL.decode(&trimmed).unwrap_or(trimmed));
        }

        let mut key = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        fs::write(key_file, B64_URL.encode(&key))?;
        restrict_permissions(key_file);
        Ok(key)
    }

    fn get(&self, key: &str) -> Option<String> {
        self.read_data().remove(key)
    }

    fn set(&self, key: &str, value: &str) -> bool {
        let mut data = self.read_data();
        data.insert(key.to_owned(), value.to_owned());
        self.write_data(&data).is_ok()
    }

    fn delete(&self, key: &str) -> bool {
        let mut data = self.read_data();
        if data.remove(key).is_none() {
            return false;
        }
        self.write_data(&data).is_ok()
    }

    fn read_data(&self) -> BTreeMap<String, String> {
        let raw = match fs::read_to_string(&self.secrets_file) {
            Ok(raw) => raw,
            Err(_) => return BTreeMap::new(),
        };
        let payload: EncryptedPayload = match serde_json::from_str(&raw) {
            Ok(payload) => payload,
            Err(_) => return BTreeMap::new(),
        };
        self.decrypt(&payload).unwrap_or_default()
    }

    fn write_data(&self, data: &BTreeMap<String, String>) -> Result<()> {
        let payload = self.encrypt(data)?;
        fs::write(&self.secrets_file, serde_json::to_string_pretty(&payload)?)?;
        restrict_permissions(&self.secrets_file);
        Ok(())
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; 32]> {
        let params = scrypt::Params::new(14, 8, 1, 32)
            .map_err(|e| Error::Secrets(format!("scrypt params: {e}")))?;
        let mut key = [0u8; 32];
        scrypt::scrypt(&self.master_key, salt, &params, &mut key)
            .map_err(|e| Error::Secrets(format!("scrypt: {e}")))?;
        Ok(key)
    }

    fn encrypt(&self, data: &BTreeMap<String, String>) -> Result<EncryptedPayload> {
        let plaintext = serde_json::to_vec(data)?;
        let mut salt = [0u8; 16];
        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let key = self.derive_key(&salt)?;
        let ciphertext = xor_stream(&plaintext, &key, &nonce);
        let tag = hmac_tag(&key, &nonce, &ciphertext);

        Ok(EncryptedPayload {
            v: 1,
            salt: B64.encode(salt),
            nonce: B64.encode(nonce),
            ciphertext: B64.encode(&ciphertext),
            tag: B64.encode(tag),
        })
    }

    fn decrypt(&self, payload: &EncryptedPayload) -> Option<BTreeMap<String, String>> {
        if payload.v != 1 {
            return None;
        }
        let salt = B64.decode(&payload.salt).ok()?;
        let nonce = B64.decode(&payload.nonce).ok()?;
        let ciphertext = B64.decode(&payload.ciphertext).ok()?;
        let tag = B64.decode(&payload.tag).ok()?;

        let key = self.derive_key(&salt).ok()?;
        let expected = hmac_tag(&key, &nonce, &ciphertext);
        if expected.ct_eq(tag.as_slice()).unwrap_u8() != 1 {
            tracing::warn!("secret file integrity check failed");
            return None;
        }

        let plaintext = xor_stream(&ciphertext, &key, &nonce);
        serde_json::from_slice(&plaintext).ok()
    }
}

/// HMAC-SHA256 keystream cipher: block i = HMAC(key, nonce || i_u64_be).
fn xor_stream(data: &[u8], key: &[u8], nonce: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut counter: u64 = 0;
    let mut offset = 0;
    while offset < data.len() {
        let mut mac =
            HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(nonce);
        mac.update(&counter.to_be_bytes());
        let block = mac.finalize().into_bytes();
        let take = block.len().min(data.len() - offset);
        for i in 0..take {
            out.push(data[offset + i] ^ block[i]);
        }
        offset += take;
        counter += 1;
    }
    out
}

fn hmac_tag(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(nonce);
    mac.update(ciphertext);
    mac.finalize().into_bytes().into()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
