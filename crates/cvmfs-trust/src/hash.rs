//! Hash algorithms, content digests and certificate fingerprints.
//!
//! Content digests are rendered as `{algorithm}:{hex}` (e.g. `sha256:1e2e...`) wherever they
//! appear in a signed document.  Fingerprints identify a certificate by the SHA-1 of its DER
//! encoding and are rendered the way `openssl x509 -fingerprint` prints them: uppercase,
//! colon-separated hex.

use std::fmt;

use openssl::hash::MessageDigest;
use sha2::{Digest, Sha256, Sha512};

/// A hash algorithm usable for letters and whitelist signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// SHA-256 (the default)
    #[default]
    Sha256,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// The algorithm name, as used in digest strings and on the command line.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// The digest size in bytes.
    pub const fn digest_size(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    /// The matching openssl digest, for signing and verifying.
    pub fn message_digest(&self) -> MessageDigest {
        match self {
            Self::Sha256 => MessageDigest::sha256(),
            Self::Sha512 => MessageDigest::sha512(),
        }
    }

    /// Computes the digest of `data`.
    pub fn digest(&self, data: &[u8]) -> ContentDigest {
        let bytes = match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        };
        ContentDigest {
            algorithm: *self,
            bytes,
        }
    }

    /// Parses an algorithm name.  Names are matched case-insensitively.
    pub fn parse(s: &str) -> Result<Self, ParseHashError> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => Err(ParseHashError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Errors from parsing algorithm names, digests and fingerprints.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseHashError {
    /// Unknown hash algorithm name.
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),
    /// Digest string is not of the form `algorithm:hex`.
    #[error("invalid digest format (expected 'algorithm:hex'): {0}")]
    Format(String),
    /// Hex payload could not be decoded.
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    /// Decoded value has the wrong length.
    #[error("expected {expected} bytes, got {actual}")]
    Length {
        /// Required length in bytes.
        expected: usize,
        /// Length actually decoded.
        actual: usize,
    },
}

/// A digest together with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest {
    algorithm: HashAlgorithm,
    bytes: Vec<u8>,
}

impl ContentDigest {
    /// The algorithm this digest was computed with.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Parses a digest in `algorithm:hex` form.
    pub fn parse(s: &str) -> Result<Self, ParseHashError> {
        let (name, hex_str) = s
            .split_once(':')
            .ok_or_else(|| ParseHashError::Format(s.to_string()))?;
        let algorithm = HashAlgorithm::parse(name)?;
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != algorithm.digest_size() {
            return Err(ParseHashError::Length {
                expected: algorithm.digest_size(),
                actual: bytes.len(),
            });
        }
        Ok(Self { algorithm, bytes })
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, hex::encode(&self.bytes))
    }
}

/// Number of bytes in a certificate fingerprint (SHA-1).
pub const FINGERPRINT_SIZE: usize = 20;

/// The SHA-1 fingerprint of a DER-encoded certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    /// Wraps raw fingerprint bytes.
    pub const fn from_bytes(bytes: [u8; FINGERPRINT_SIZE]) -> Self {
        Self(bytes)
    }

    /// The raw fingerprint bytes.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    /// Parses a fingerprint from hex, with or without colon separators, in any case.
    ///
    /// Surrounding whitespace is ignored; anything else that isn't part of the fingerprint is
    /// an error.
    pub fn parse(s: &str) -> Result<Self, ParseHashError> {
        let compact: String = s.trim().chars().filter(|c| *c != ':').collect();
        if compact.len() != 2 * FINGERPRINT_SIZE {
            return Err(ParseHashError::Length {
                expected: FINGERPRINT_SIZE,
                actual: compact.len() / 2,
            });
        }
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        hex::decode_to_slice(&compact, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
