//! Content digests used by de-duplicating key strategies.

use std::{fmt, str::FromStr};

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::error::BlobError;

/// Digest algorithm used to derive content keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Sha1,
    Sha256,
    Sha512,
    Blake3,
}

impl DigestAlgorithm {
    /// Length in bytes of the raw digest.
    pub const fn output_len(self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 16,
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha512 => 64,
            DigestAlgorithm::Blake3 => 32,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha1 => "SHA-1",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha512 => "SHA-512",
            DigestAlgorithm::Blake3 => "BLAKE3",
        }
    }

    pub fn digester(self) -> Digester {
        Digester::new(self)
    }

    /// Hex digest of an in-memory buffer.
    pub fn hex_digest(self, buf: impl AsRef<[u8]>) -> String {
        let mut d = self.digester();
        d.update(buf.as_ref());
        d.finish_hex()
    }
}

impl FromStr for DigestAlgorithm {
    type Err = BlobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "MD5" => Ok(DigestAlgorithm::Md5),
            "SHA1" => Ok(DigestAlgorithm::Sha1),
            "SHA256" => Ok(DigestAlgorithm::Sha256),
            "SHA512" => Ok(DigestAlgorithm::Sha512),
            "BLAKE3" => Ok(DigestAlgorithm::Blake3),
            _ => Err(BlobError::config(format!("unknown digest algorithm: {s}"))),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Incremental hasher over one of the supported algorithms.
pub enum Digester {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Digester").field(&self.algorithm().name()).finish()
    }
}

impl Digester {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Md5 => Digester::Md5(Md5::new()),
            DigestAlgorithm::Sha1 => Digester::Sha1(Sha1::new()),
            DigestAlgorithm::Sha256 => Digester::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => Digester::Sha512(Sha512::new()),
            DigestAlgorithm::Blake3 => Digester::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        match self {
            Digester::Md5(_) => DigestAlgorithm::Md5,
            Digester::Sha1(_) => DigestAlgorithm::Sha1,
            Digester::Sha256(_) => DigestAlgorithm::Sha256,
            Digester::Sha512(_) => DigestAlgorithm::Sha512,
            Digester::Blake3(_) => DigestAlgorithm::Blake3,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Md5(h) => h.update(data),
            Digester::Sha1(h) => h.update(data),
            Digester::Sha256(h) => h.update(data),
            Digester::Sha512(h) => h.update(data),
            Digester::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Lowercase hex encoding of the final digest.
    pub fn finish_hex(self) -> String {
        let bytes: Vec<u8> = match self {
            Digester::Md5(h) => h.finalize().to_vec(),
            Digester::Sha1(h) => h.finalize().to_vec(),
            Digester::Sha256(h) => h.finalize().to_vec(),
            Digester::Sha512(h) => h.finalize().to_vec(),
            Digester::Blake3(h) => h.finalize().as_bytes().to_vec(),
        };
        data_encoding::HEXLOWER.encode(&bytes)
    }
}

/// Digest settings of a de-duplicating store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DigestConfiguration {
    pub algorithm: DigestAlgorithm,
}

impl DigestConfiguration {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Parses an algorithm name; an unknown name is a configuration error.
    pub fn from_name(name: &str) -> Result<Self, BlobError> {
        Ok(Self::new(name.parse()?))
    }

    /// True if `key` looks like a digest produced by this configuration:
    /// lowercase hex of exactly the algorithm's length.
    pub fn is_valid_digest(&self, key: &str) -> bool {
        key.len() == self.algorithm.output_len() * 2
            && key
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_values() {
        assert_eq!(
            DigestAlgorithm::Md5.hex_digest(b"hello"),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            DigestAlgorithm::Sha256.hex_digest(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(
            DigestAlgorithm::Blake3.hex_digest(b"hello"),
            "ea8f163db38682925e4491c5e58d4bb3506ef8c14eb78a86e908c5624a67200f"
        );
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut d = Digester::new(DigestAlgorithm::Sha512);
        d.update(b"hel");
        d.update(b"lo");
        assert_eq!(d.finish_hex(), DigestAlgorithm::Sha512.hex_digest(b"hello"));
    }

    #[test]
    fn parse_names() {
        assert_eq!("SHA-256".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha256);
        assert_eq!("sha256".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha256);
        assert_eq!("md5".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Md5);
        assert_eq!("SHA-1".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha1);
        let err = "WHIRLPOOL".parse::<DigestAlgorithm>().unwrap_err();
        assert!(matches!(err, BlobError::Config(_)));
    }

    #[test]
    fn digest_validation() {
        let config = DigestConfiguration::new(DigestAlgorithm::Md5);
        assert!(config.is_valid_digest("5d41402abc4b2a76b9719d911017c592"));
        assert!(!config.is_valid_digest("5D41402ABC4B2A76B9719D911017C592"));
        assert!(!config.is_valid_digest("5d41402abc4b2a76"));
        assert!(!config.is_valid_digest("bin_123.tmp"));
    }
}
