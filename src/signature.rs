//! Stable signatures over structured inputs and files.
//!
//! All build decisions reduce to comparing [`Signature`]s: an opaque byte
//! string summarizing an input at a point in time. Structured signatures are
//! produced by [`SignatureHasher`], which frames every part with its length so
//! two different part sequences can never collide by concatenation. File
//! signatures come in two flavors: a content digest and a cheap
//! `(mtime, size)` encoding.

use md5::{Digest, Md5};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt, fs,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
    time::UNIX_EPOCH,
};

/// An opaque byte string identifying the content of a value.
///
/// Equality of signatures implies equivalence for build purposes. Signatures
/// are ordered so lists of them can be sorted deterministically before
/// hashing.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Signature(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl From<&[u8]> for Signature {
    fn from(bytes: &[u8]) -> Self {
        Signature(bytes.to_vec())
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map(Signature).map_err(de::Error::custom)
    }
}

/// Incremental hasher producing [`Signature`]s from structured parts.
///
/// Cloning a hasher captures its state, so a hasher seeded with a builder's
/// identity can be reused as the common prefix for many per-source
/// derivations.
#[derive(Clone)]
pub struct SignatureHasher {
    hasher: Md5,
}

impl SignatureHasher {
    pub fn new() -> Self {
        Self { hasher: Md5::new() }
    }

    /// Feeds one part, framed with its length.
    pub fn update(&mut self, part: impl AsRef<[u8]>) {
        let part = part.as_ref();
        self.hasher.update((part.len() as u64).to_le_bytes());
        self.hasher.update(part);
    }

    /// Feeds an optional part; absence hashes differently from any content.
    pub fn update_opt(&mut self, part: Option<&Signature>) {
        match part {
            Some(signature) => {
                self.hasher.update([1u8]);
                self.update(signature.as_bytes());
            }
            None => self.hasher.update([0u8]),
        }
    }

    pub fn finish(self) -> Signature {
        Signature(self.hasher.finalize().to_vec())
    }
}

impl Default for SignatureHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hashes a single byte string into a signature.
pub fn stable_hash(part: impl AsRef<[u8]>) -> Signature {
    let mut hasher = SignatureHasher::new();
    hasher.update(part);
    hasher.finish()
}

/// Hashes a sequence of byte strings into a signature.
pub fn stable_hash_parts<I, P>(parts: I) -> Signature
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = SignatureHasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finish()
}

/// Returns the content digest of the file at `path`, starting at `offset`.
pub fn file_content_signature(path: impl AsRef<Path>, offset: u64) -> io::Result<Signature> {
    let mut file = fs::File::open(path)?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))?;
    }
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Signature(hasher.finalize().to_vec()))
}

/// Returns a signature encoding the file's `(mtime, size)` pair.
///
/// The modification time is taken with millisecond precision, matching the
/// granularity persisted by common build caches.
pub fn file_time_signature(path: impl AsRef<Path>) -> io::Result<Signature> {
    let metadata = fs::metadata(path)?;
    let mtime = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
        .as_millis() as u64;
    let mut bytes = Vec::with_capacity(16);
    bytes.extend_from_slice(&mtime.to_le_bytes());
    bytes.extend_from_slice(&metadata.len().to_le_bytes());
    Ok(Signature(bytes))
}

/// Computes a file signature with the documented fallback chain:
/// content digest, then `(mtime, size)`, then absent.
pub fn file_signature(path: impl AsRef<Path>, offset: u64) -> Option<Signature> {
    let path = path.as_ref();
    match file_content_signature(path, offset) {
        Ok(signature) => Some(signature),
        Err(err) => {
            trace!(path = %path.display(), %err, "content signature failed, trying timestamp");
            file_time_signature(path).ok()
        }
    }
}
