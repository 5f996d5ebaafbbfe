//! The entity model: content-addressed values tracked by the build.
//!
//! An [`Entity`] is one indivisible value (a file on disk or an opaque blob)
//! with an identity, a recorded signature and a notion of *actuality*: whether
//! the recorded signature still matches the source of truth. Entities form a
//! closed set of variants; all operations dispatch on the variant tag.
//!
//! Entities are immutable. Refreshing a stale entity goes through
//! [`Entity::get_actual`], which returns a new value with the same identity
//! and tags but a recomputed signature.

use crate::{
    error::{KilnError, Result},
    signature::{self, stable_hash, Signature},
    utils,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt, fs,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
};

/// Labels attached to target entities, matched by downstream tag filters.
pub type Tags = BTreeSet<String>;

/// The concrete variant of an entity. Part of its identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityClass {
    Null,
    Simple,
    Signature,
    FileChecksum,
    FilePartChecksum,
    FileTimestamp,
    Dir,
}

impl EntityClass {
    /// Stable tag used when dumping ids; never renamed once persisted.
    pub fn tag(&self) -> &'static str {
        match self {
            EntityClass::Null => "null",
            EntityClass::Simple => "simple",
            EntityClass::Signature => "signature",
            EntityClass::FileChecksum => "file-checksum",
            EntityClass::FilePartChecksum => "file-part-checksum",
            EntityClass::FileTimestamp => "file-timestamp",
            EntityClass::Dir => "dir",
        }
    }
}

/// The identity of an entity: its class and its domain-unique name.
///
/// Two entities are the same value iff their ids match; their signatures may
/// still disagree (one of them is stale).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub class: EntityClass,
    pub name: String,
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class.tag(), self.name)
    }
}

/// One value tracked by the build.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Entity {
    /// The placeholder value: fixed name, no signature, never actual.
    Null,
    /// An opaque in-memory datum, signed by hashing the datum.
    Simple {
        name: String,
        signature: Option<Signature>,
        data: Option<Vec<u8>>,
        tags: Option<Tags>,
    },
    /// A raw byte string used directly as the signature. Embeds foreign
    /// checksums without rehashing them.
    Signature { name: String, signature: Option<Signature> },
    /// A file signed by a content digest of the whole file.
    FileChecksum { path: PathBuf, signature: Option<Signature>, tags: Option<Tags> },
    /// A file signed by a content digest from `offset` onward. Archives whose
    /// prefix is rewritten by tooling keep the authoritative tail here.
    FilePartChecksum {
        path: PathBuf,
        offset: u64,
        signature: Option<Signature>,
        tags: Option<Tags>,
    },
    /// A file signed by its `(mtime, size)` pair.
    FileTimestamp { path: PathBuf, signature: Option<Signature>, tags: Option<Tags> },
    /// Like `FileTimestamp`, but `remove` deletes the (empty) directory.
    Dir { path: PathBuf, signature: Option<Signature>, tags: Option<Tags> },
}

/// Name of the null entity.
const NULL_NAME: &str = "N";

impl Entity {
    /// A simple entity wrapping `data`, signed by hashing it.
    pub fn simple(data: impl Into<Vec<u8>>) -> Result<Self> {
        Self::simple_with(Some(data.into()), None, None, None)
    }

    /// Full simple-entity constructor.
    ///
    /// Without data the signature is absent; without an explicit name the
    /// signature's hex form is used. A nameless entity without data fails
    /// with [`KilnError::EmptyName`].
    pub fn simple_with(
        data: Option<Vec<u8>>,
        name: Option<String>,
        signature: Option<Signature>,
        tags: Option<Tags>,
    ) -> Result<Self> {
        let signature = match &data {
            None => None,
            Some(data) => Some(signature.unwrap_or_else(|| stable_hash(data))),
        };
        let name = match name {
            Some(name) if !name.is_empty() => name,
            _ => signature.as_ref().map(Signature::to_hex).ok_or(KilnError::EmptyName)?,
        };
        Ok(Entity::Simple { name, signature, data, tags })
    }

    /// A signature entity: the datum *is* the signature.
    pub fn signature_value(data: impl Into<Vec<u8>>) -> Result<Self> {
        Self::signature_value_with(data, None)
    }

    /// Signature entity with an explicit name.
    pub fn signature_value_with(data: impl Into<Vec<u8>>, name: Option<String>) -> Result<Self> {
        let signature = Signature::new(data.into());
        let name = match name {
            Some(name) if !name.is_empty() => name,
            _ => signature.to_hex(),
        };
        if name.is_empty() {
            return Err(KilnError::EmptyName);
        }
        Ok(Entity::Signature { name, signature: Some(signature) })
    }

    /// A whole-file checksum entity with a freshly computed signature.
    pub fn file_checksum(path: impl AsRef<Path>) -> Result<Self> {
        Self::file_checksum_in(path, None, None)
    }

    /// Whole-file checksum entity, resolving relative paths against `base`.
    pub fn file_checksum_in(
        path: impl AsRef<Path>,
        base: Option<&Path>,
        tags: Option<Tags>,
    ) -> Result<Self> {
        let path = utils::normalize_path(path, base)?;
        let signature = signature::file_signature(&path, 0);
        Ok(Entity::FileChecksum { path, signature, tags })
    }

    /// Checksum entity restored from a recorded signature, without disk I/O.
    pub fn file_checksum_with(
        path: impl AsRef<Path>,
        signature: Option<Signature>,
        tags: Option<Tags>,
    ) -> Result<Self> {
        let path = utils::normalize_path(path, None)?;
        Ok(Entity::FileChecksum { path, signature, tags })
    }

    /// A partial-file checksum entity hashing from `offset` onward.
    pub fn file_part_checksum(
        path: impl AsRef<Path>,
        offset: u64,
        base: Option<&Path>,
        tags: Option<Tags>,
    ) -> Result<Self> {
        let path = utils::normalize_path(path, base)?;
        let signature = signature::file_signature(&path, offset);
        Ok(Entity::FilePartChecksum { path, offset, signature, tags })
    }

    /// A timestamp entity with a freshly computed `(mtime, size)` signature.
    pub fn file_timestamp(path: impl AsRef<Path>) -> Result<Self> {
        Self::file_timestamp_in(path, None, None)
    }

    /// Timestamp entity, resolving relative paths against `base`.
    pub fn file_timestamp_in(
        path: impl AsRef<Path>,
        base: Option<&Path>,
        tags: Option<Tags>,
    ) -> Result<Self> {
        let path = utils::normalize_path(path, base)?;
        let signature = signature::file_time_signature(&path).ok();
        Ok(Entity::FileTimestamp { path, signature, tags })
    }

    /// A directory entity.
    pub fn dir(path: impl AsRef<Path>, base: Option<&Path>, tags: Option<Tags>) -> Result<Self> {
        let path = utils::normalize_path(path, base)?;
        let signature = signature::file_time_signature(&path).ok();
        Ok(Entity::Dir { path, signature, tags })
    }

    pub fn class(&self) -> EntityClass {
        match self {
            Entity::Null => EntityClass::Null,
            Entity::Simple { .. } => EntityClass::Simple,
            Entity::Signature { .. } => EntityClass::Signature,
            Entity::FileChecksum { .. } => EntityClass::FileChecksum,
            Entity::FilePartChecksum { .. } => EntityClass::FilePartChecksum,
            Entity::FileTimestamp { .. } => EntityClass::FileTimestamp,
            Entity::Dir { .. } => EntityClass::Dir,
        }
    }

    /// The domain-unique name within the entity's class.
    pub fn name(&self) -> String {
        match self {
            Entity::Null => NULL_NAME.to_string(),
            Entity::Simple { name, .. } | Entity::Signature { name, .. } => name.clone(),
            Entity::FileChecksum { path, .. }
            | Entity::FilePartChecksum { path, .. }
            | Entity::FileTimestamp { path, .. }
            | Entity::Dir { path, .. } => path.to_string_lossy().into_owned(),
        }
    }

    pub fn id(&self) -> EntityId {
        EntityId { class: self.class(), name: self.name() }
    }

    /// Stable serialization of the identity, used for keying the value file.
    pub fn dump_id(&self) -> (Signature, &'static str) {
        (stable_hash(self.name()), self.class().tag())
    }

    /// The signature recorded when this entity was last observed.
    pub fn signature(&self) -> Option<&Signature> {
        match self {
            Entity::Null => None,
            Entity::Simple { signature, .. }
            | Entity::Signature { signature, .. }
            | Entity::FileChecksum { signature, .. }
            | Entity::FilePartChecksum { signature, .. }
            | Entity::FileTimestamp { signature, .. }
            | Entity::Dir { signature, .. } => signature.as_ref(),
        }
    }

    pub fn tags(&self) -> Option<&Tags> {
        match self {
            Entity::Null | Entity::Signature { .. } => None,
            Entity::Simple { tags, .. }
            | Entity::FileChecksum { tags, .. }
            | Entity::FilePartChecksum { tags, .. }
            | Entity::FileTimestamp { tags, .. }
            | Entity::Dir { tags, .. } => tags.as_ref(),
        }
    }

    /// Replaces the tag set, preserving everything else.
    pub fn with_tags(mut self, new_tags: Option<Tags>) -> Self {
        match &mut self {
            Entity::Null | Entity::Signature { .. } => {}
            Entity::Simple { tags, .. }
            | Entity::FileChecksum { tags, .. }
            | Entity::FilePartChecksum { tags, .. }
            | Entity::FileTimestamp { tags, .. }
            | Entity::Dir { tags, .. } => *tags = new_tags,
        }
        self
    }

    /// The file path, for file-backed variants.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Entity::FileChecksum { path, .. }
            | Entity::FilePartChecksum { path, .. }
            | Entity::FileTimestamp { path, .. }
            | Entity::Dir { path, .. } => Some(path),
            _ => None,
        }
    }

    /// The in-memory datum, for blob variants.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Entity::Simple { data, .. } => data.as_deref(),
            Entity::Signature { signature, .. } => signature.as_ref().map(Signature::as_bytes),
            _ => None,
        }
    }

    /// A freshly recomputed signature from the source of truth.
    ///
    /// For blob variants the stored signature is the truth; for file variants
    /// the disk is consulted with the content → timestamp → absent fallback.
    pub fn signature_of_truth(&self) -> Option<Signature> {
        match self {
            Entity::Null => None,
            Entity::Simple { signature, .. } | Entity::Signature { signature, .. } => {
                signature.clone()
            }
            Entity::FileChecksum { path, .. } => signature::file_signature(path, 0),
            Entity::FilePartChecksum { path, offset, .. } => {
                signature::file_signature(path, *offset)
            }
            Entity::FileTimestamp { path, .. } | Entity::Dir { path, .. } => {
                signature::file_time_signature(path).ok()
            }
        }
    }

    /// Whether the recorded signature still matches the source of truth.
    pub fn is_actual(&self) -> bool {
        match self {
            Entity::Null => false,
            Entity::Simple { signature, .. } | Entity::Signature { signature, .. } => {
                signature.is_some()
            }
            Entity::FileChecksum { signature, .. }
            | Entity::FilePartChecksum { signature, .. }
            | Entity::FileTimestamp { signature, .. }
            | Entity::Dir { signature, .. } => {
                signature.is_some() && *signature == self.signature_of_truth()
            }
        }
    }

    /// Returns `self` if actual, otherwise a clone with a refreshed signature.
    ///
    /// Identity and tags are preserved; only the signature may differ.
    pub fn get_actual(&self) -> Entity {
        if self.is_actual() {
            return self.clone();
        }
        let fresh = self.signature_of_truth();
        let mut refreshed = self.clone();
        match &mut refreshed {
            Entity::Null => {}
            Entity::Simple { signature, .. }
            | Entity::Signature { signature, .. }
            | Entity::FileChecksum { signature, .. }
            | Entity::FilePartChecksum { signature, .. }
            | Entity::FileTimestamp { signature, .. }
            | Entity::Dir { signature, .. } => *signature = fresh,
        }
        refreshed
    }

    /// Removes the value from its backing store. Errors are swallowed; a
    /// directory is deleted only when empty.
    pub fn remove(&self) {
        match self {
            Entity::FileChecksum { path, .. }
            | Entity::FilePartChecksum { path, .. }
            | Entity::FileTimestamp { path, .. } => {
                if let Err(err) = fs::remove_file(path) {
                    trace!(path = %path.display(), %err, "failed to remove target file");
                }
            }
            Entity::Dir { path, .. } => {
                if let Err(err) = fs::remove_dir(path) {
                    trace!(path = %path.display(), %err, "failed to remove target dir");
                }
            }
            _ => {}
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        if let (
            Entity::FilePartChecksum { offset: a, .. },
            Entity::FilePartChecksum { offset: b, .. },
        ) = (self, other)
        {
            if a != b {
                return false;
            }
        }
        self.class() == other.class()
            && self.name() == other.name()
            && self.signature() == other.signature()
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // hashed by identity so that equal entities always collide
        self.id().hash(state);
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
