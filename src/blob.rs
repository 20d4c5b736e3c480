//! Content-addressed blob references, `<hash>-<hex digest>`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BlobError {
    #[error("blob: invalid blob ref {0:?}")]
    InvalidRef(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashKind {
    Sha1,
    Sha224,
}

impl HashKind {
    pub fn name(self) -> &'static str {
        match self {
            HashKind::Sha1 => "sha1",
            HashKind::Sha224 => "sha224",
        }
    }

    /// Length of the digest in hex characters.
    pub fn hex_len(self) -> usize {
        match self {
            HashKind::Sha1 => 40,
            HashKind::Sha224 => 56,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(HashKind::Sha1),
            "sha224" => Some(HashKind::Sha224),
            _ => None,
        }
    }
}

/// A validated reference. The digest is kept as lowercase hex, so the
/// `Display` form is canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobRef {
    kind: HashKind,
    digest: String,
}

impl BlobRef {
    pub fn new(kind: HashKind, hex_digest: &str) -> Result<Self, BlobError> {
        let valid = hex_digest.len() == kind.hex_len()
            && hex_digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(BlobError::InvalidRef(format!(
                "{}-{hex_digest}",
                kind.name()
            )));
        }
        Ok(Self {
            kind,
            digest: hex_digest.to_owned(),
        })
    }

    /// Parses `s`, returning `None` if it is not a valid reference.
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    pub fn kind(&self) -> HashKind {
        self.kind
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl FromStr for BlobRef {
    type Err = BlobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, hex) = s
            .split_once('-')
            .ok_or_else(|| BlobError::InvalidRef(s.to_owned()))?;
        let kind = HashKind::from_name(name).ok_or_else(|| BlobError::InvalidRef(s.to_owned()))?;
        BlobRef::new(kind, hex).map_err(|_| BlobError::InvalidRef(s.to_owned()))
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind.name(), self.digest)
    }
}
