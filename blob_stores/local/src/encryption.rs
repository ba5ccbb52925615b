//! At-rest encryption of local blob files with XChaCha20-Poly1305.
//!
//! Files hold `nonce (24 bytes) || ciphertext`.

use std::{fmt, fs, path::Path};

use anyhow::anyhow;
use blobkeep_core::{BlobError, BlobResult};
use chacha20poly1305::{
    AeadCore, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, OsRng},
};
use data_encoding::HEXLOWER_PERMISSIVE;

const NONCE_LEN: usize = 24;
const PASSWORD_CONTEXT: &str = "blobkeep 2024-06 local store password key";

/// Keystore formats understood by [`Encryption::from_keystore`].
pub const KEYSTORE_TYPE_RAW: &str = "raw";

#[derive(Clone)]
pub struct Encryption {
    key: [u8; 32],
}

impl fmt::Debug for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encryption").finish_non_exhaustive()
    }
}

impl Encryption {
    pub fn from_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn from_password(password: &str) -> BlobResult<Self> {
        if password.is_empty() {
            return Err(BlobError::config("encryption password is empty"));
        }
        Ok(Self::from_key(blake3::derive_key(
            PASSWORD_CONTEXT,
            password.as_bytes(),
        )))
    }

    /// Loads the key `alias` from a keystore file.
    ///
    /// A `raw` keystore is a text file of `alias=<64 hex chars>` lines; `#`
    /// starts a comment.
    pub fn from_keystore(keystore_type: &str, file: &Path, alias: &str) -> BlobResult<Self> {
        if !keystore_type.eq_ignore_ascii_case(KEYSTORE_TYPE_RAW) {
            return Err(BlobError::config(format!(
                "unrecognized keystore type: {keystore_type}"
            )));
        }
        let content = fs::read_to_string(file).map_err(|e| {
            BlobError::config(format!("cannot read keystore {}: {e}", file.display()))
        })?;
        let hex = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .find(|(name, _)| name.trim() == alias)
            .map(|(_, value)| value.trim())
            .ok_or_else(|| {
                BlobError::config(format!(
                    "key alias {alias} not found in keystore {}",
                    file.display()
                ))
            })?;
        let bytes = HEXLOWER_PERMISSIVE
            .decode(hex.as_bytes())
            .map_err(|e| BlobError::config(format!("invalid key {alias}: {e}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            BlobError::config(format!("key {alias} must be 32 bytes"))
        })?;
        Ok(Self::from_key(key))
    }

    /// True if data sealed by one can be opened by the other.
    pub fn same_key(&self, other: &Encryption) -> bool {
        blake3::hash(&self.key) == blake3::hash(&other.key)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> BlobResult<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new(&self.key.into());
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| anyhow!("blob encryption failed"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> BlobResult<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(anyhow!("encrypted blob too short: {} bytes", data.len()).into());
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new(&self.key.into());
        Ok(cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("blob decryption failed: invalid ciphertext or wrong key"))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt() {
        let enc = Encryption::from_password("secret").unwrap();
        let sealed = enc.encrypt(b"hello").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 5 + 16);
        assert_eq!(enc.decrypt(&sealed).unwrap(), b"hello");

        let other = Encryption::from_password("other").unwrap();
        assert!(!enc.same_key(&other));
        assert!(other.decrypt(&sealed).is_err());
        assert!(enc.same_key(&Encryption::from_password("secret").unwrap()));
    }

    #[test]
    fn raw_keystore() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("keys");
        fs::write(
            &file,
            format!("# test keys\nother={}\nmain = {}\n", "00".repeat(32), "ab".repeat(32)),
        )
        .unwrap();
        let enc = Encryption::from_keystore("raw", &file, "main").unwrap();
        assert!(enc.same_key(&Encryption::from_key([0xab; 32])));

        let err = Encryption::from_keystore("raw", &file, "missing").unwrap_err();
        assert!(matches!(err, BlobError::Config(_)));
        let err = Encryption::from_keystore("PKCS12", &file, "main").unwrap_err();
        assert!(matches!(err, BlobError::Config(_)));
        assert!(Encryption::from_password("").is_err());
    }
}
