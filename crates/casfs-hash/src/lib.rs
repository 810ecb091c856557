//! # casfs-hash
//!
//! Content hashes for casfs objects.
//!
//! Every object in a casfs repository is addressed by the cryptographic hash
//! of its (uncompressed) content plus a one-letter suffix that distinguishes
//! object classes (file catalogs, certificates, ...).  A hash maps to a
//! canonical relative path used both on mirrors and in the local cache:
//!
//! ```text
//! data/
//! └── ab/
//!     └── cdef0123...89C     # first two hex chars / remainder + suffix
//! ```

use std::fmt;

use sha2::{Digest, Sha256};

/// Digest width in bytes, shared by all supported algorithms.
pub const DIGEST_SIZE: usize = 32;

/// Supported digest algorithms.
///
/// `Any` is the algorithm of the null (unset) hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Algorithm {
    #[default]
    Any,
    Sha256,
    Blake3,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Any => "any",
            Algorithm::Sha256 => "sha256",
            Algorithm::Blake3 => "blake3",
        }
    }
}

/// Object class, encoded as a single trailing character in canonical paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Suffix {
    /// Regular data object, no suffix character.
    #[default]
    Data,
    /// File catalog.
    Catalog,
    /// Signing certificate.
    Certificate,
    /// Revision history.
    History,
    /// Repository meta information.
    MetaInfo,
}

impl Suffix {
    pub fn as_char(&self) -> Option<char> {
        match self {
            Suffix::Data => None,
            Suffix::Catalog => Some('C'),
            Suffix::Certificate => Some('X'),
            Suffix::History => Some('H'),
            Suffix::MetaInfo => Some('M'),
        }
    }
}

/// Content-addressed object identifier: algorithm, digest, object class.
///
/// Null-constructible; `ObjectId::null()` is the "unset" sentinel used where
/// a hash field may legitimately be absent.  Equality and ordering are
/// structural, so identifiers can serve as map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId {
    pub algorithm: Algorithm,
    pub digest: [u8; DIGEST_SIZE],
    pub suffix: Suffix,
}

impl ObjectId {
    pub fn new(algorithm: Algorithm, digest: [u8; DIGEST_SIZE], suffix: Suffix) -> Self {
        Self {
            algorithm,
            digest,
            suffix,
        }
    }

    /// The unset sentinel value.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.algorithm == Algorithm::Any
    }

    /// Hash `data` with `algorithm` and tag the result with `suffix`.
    pub fn from_digest(algorithm: Algorithm, data: &[u8], suffix: Suffix) -> Self {
        let digest = match algorithm {
            Algorithm::Any => [0u8; DIGEST_SIZE],
            Algorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                hasher.finalize().into()
            }
            Algorithm::Blake3 => *blake3::hash(data).as_bytes(),
        };
        Self {
            algorithm,
            digest,
            suffix,
        }
    }

    /// Lowercase hex form of the digest.
    pub fn to_hex(&self) -> String {
        self.digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse a 64-character lowercase hex string.
    pub fn from_hex(algorithm: Algorithm, hex: &str, suffix: Suffix) -> Option<Self> {
        if hex.len() != 2 * DIGEST_SIZE {
            return None;
        }
        let mut digest = [0u8; DIGEST_SIZE];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).ok()?;
            digest[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(Self {
            algorithm,
            digest,
            suffix,
        })
    }

    /// Canonical relative path: two-character fan-out directory, remainder,
    /// suffix character.
    pub fn path(&self) -> String {
        let hex = self.to_hex();
        match self.suffix.as_char() {
            Some(c) => format!("{}/{}{}", &hex[..2], &hex[2..], c),
            None => format!("{}/{}", &hex[..2], &hex[2..]),
        }
    }

    /// Canonical path under the `data/` namespace of a repository.
    pub fn url(&self) -> String {
        format!("data/{}", self.path())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())?;
        if let Some(c) = self.suffix.as_char() {
            write!(f, "-{}", c)?;
        }
        Ok(())
    }
}
