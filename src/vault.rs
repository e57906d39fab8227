use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use tracing::warn;

/// File-backed encrypted key-value store for small client-side secrets
/// (the bearer token between runs). Obfuscation at rest, not security:
/// the key is derived from a statically configured passphrase, so anyone
/// holding the binary's configuration can read the file.
pub struct Vault {
    path: PathBuf,
    cipher: Aes256Gcm,
    entries: BTreeMap<String, String>,
}

impl Vault {
    pub fn open(path: impl Into<PathBuf>, passphrase: &str) -> anyhow::Result<Self> {
        let path = path.into();
        let digest = Sha256::digest(passphrase.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        let cipher = Aes256Gcm::new(key);
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "vault file unreadable, starting empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Ok(Self { path, cipher, entries })
    }

    /// Data-directory default: `$XDG_DATA_HOME/calmchat/vault.json`.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".local").join("share")
        });
        let dir = base.join("calmchat");
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join("vault.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A value that fails to decrypt (wrong passphrase, truncated file) is
    /// treated as absent rather than an error.
    pub fn get(&self, key: &str) -> Option<String> {
        let stored = self.entries.get(key)?;
        let raw = BASE64.decode(stored).ok()?;
        if raw.len() <= 12 {
            return None;
        }
        let (nonce, ciphertext) = raw.split_at(12);
        let plaintext = self.cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()?;
        let text = String::from_utf8(plaintext).ok()?;
        // values are stored JSON-encoded; fall back to the raw text when an
        // older entry predates that
        serde_json::from_str::<String>(&text).ok().or(Some(text))
    }

    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let encoded = serde_json::to_string(value)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, encoded.as_bytes())
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;
        let mut raw = nonce.to_vec();
        raw.extend_from_slice(&ciphertext);
        self.entries.insert(key.to_string(), BASE64.encode(raw));
        self.persist()
    }

    pub fn remove(&mut self, key: &str) -> anyhow::Result<bool> {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    fn persist(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&self.entries)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}
