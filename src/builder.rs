//! The boundary between the core and concrete build actions.
//!
//! A [`Builder`] provides the action a node runs, contributes to the node's
//! identity and input fingerprint, and canonicalizes raw user inputs into
//! entities. Only `name`, `signature` and `build` are mandatory; every other
//! hook has a sensible default.

use crate::{
    entity::{Entity, EntityClass, EntityId, Tags},
    error::{KilnError, Result},
    node::{BatchNode, Node, Source},
    report::{BuildStrArgs, StrArg},
    signature::Signature,
};
use once_cell::sync::Lazy;
use std::{
    any::Any,
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

/// A raw user-supplied input, not yet canonicalized into an entity.
#[derive(Clone, Debug)]
pub enum RawValue {
    /// A file path, resolved relative to the node's working directory.
    Path(PathBuf),
    /// An opaque in-memory datum.
    Bytes(Vec<u8>),
    /// A textual datum.
    Str(String),
    /// An already-canonical entity, passed through unchanged.
    Entity(Arc<Entity>),
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Str(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Str(s)
    }
}

impl From<&Path> for RawValue {
    fn from(p: &Path) -> Self {
        RawValue::Path(p.to_path_buf())
    }
}

impl From<PathBuf> for RawValue {
    fn from(p: PathBuf) -> Self {
        RawValue::Path(p)
    }
}

impl From<Vec<u8>> for RawValue {
    fn from(b: Vec<u8>) -> Self {
        RawValue::Bytes(b)
    }
}

impl From<Arc<Entity>> for RawValue {
    fn from(e: Arc<Entity>) -> Self {
        RawValue::Entity(e)
    }
}

impl RawValue {
    pub fn path(p: impl Into<PathBuf>) -> Self {
        RawValue::Path(p.into())
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            RawValue::Path(p) => p.display().to_string(),
            RawValue::Bytes(b) => format!("<{} bytes>", b.len()),
            RawValue::Str(s) => s.clone(),
            RawValue::Entity(e) => e.name(),
        }
    }
}

/// Options for [`Builder::make_value`].
#[derive(Clone, Debug, Default)]
pub struct MakeValue {
    /// Reuse an already-constructed entity for the same file, if one exists.
    /// Used for implicit deps, which are commonly shared across many nodes.
    pub use_cache: bool,
    /// Tags to attach to the produced entity.
    pub tags: Option<Tags>,
}

impl MakeValue {
    pub fn cached() -> Self {
        Self { use_cache: true, tags: None }
    }

    pub fn tagged(tags: Option<Tags>) -> Self {
        Self { use_cache: false, tags }
    }
}

/// Either kind of node, for hooks shared by both.
#[derive(Clone, Copy)]
pub enum AnyNode<'a> {
    Single(&'a Node),
    Batch(&'a BatchNode),
}

impl<'a> AnyNode<'a> {
    pub fn cwd(&self) -> &Path {
        match self {
            AnyNode::Single(node) => node.cwd(),
            AnyNode::Batch(node) => node.cwd(),
        }
    }

    /// Resolved sources, if resolution already happened. Never triggers I/O.
    pub fn peek_source_values(&self) -> Vec<Arc<Entity>> {
        match self {
            AnyNode::Single(node) => node.peek_source_values(),
            AnyNode::Batch(node) => node.peek_source_values(),
        }
    }

    /// Built or adopted targets, if any. Never triggers I/O.
    pub fn peek_target_values(&self) -> Vec<Arc<Entity>> {
        match self {
            AnyNode::Single(node) => node.peek_target_values(),
            AnyNode::Batch(node) => node.peek_target_values(),
        }
    }
}

/// Provider of one build action.
///
/// Builders are shared between nodes and possibly between threads, so all
/// hooks take `&self`.
pub trait Builder: Send + Sync {
    /// Contributes to the identity of every node using this builder.
    fn name(&self) -> &str;

    /// Fingerprint of the action itself (tool version, relevant options).
    /// Changing it invalidates every cached result of this builder.
    fn signature(&self) -> Signature;

    /// Opaque configuration carried along with the builder. The core never
    /// interprets it; anything feeding the action should be reflected in
    /// [`Builder::signature`].
    fn options(&self) -> Option<&(dyn Any + Send + Sync)> {
        None
    }

    /// Pre-build hook; may return a specialized builder to replace this one.
    fn initiate(&self, _cwd: &Path) -> Result<Option<Arc<dyn Builder>>> {
        Ok(None)
    }

    /// Canonicalizes a raw source into an entity.
    fn make_value(&self, raw: &RawValue, options: &MakeValue, cwd: &Path) -> Result<Arc<Entity>> {
        default_make_value(raw, options, cwd)
    }

    /// Like [`Builder::make_value`], but the result must be file-backed.
    fn make_file_value(
        &self,
        raw: &RawValue,
        options: &MakeValue,
        cwd: &Path,
    ) -> Result<Arc<Entity>> {
        let value = self.make_value(raw, options, cwd)?;
        if value.path().is_none() {
            return Err(KilnError::msg(format!("'{}' is not a file value", raw.describe())));
        }
        Ok(value)
    }

    /// Targets known before the build runs. Enables naming the node by its
    /// targets and lets downstream nodes resolve against it early.
    fn declared_targets(&self, _node: &Node) -> Option<Vec<Arc<Entity>>> {
        None
    }

    /// Runs the action. Must register outputs through
    /// [`Node::add_targets`](crate::Node::add_targets) (or
    /// [`Node::set_no_targets`](crate::Node::set_no_targets)).
    fn build(&self, node: &Node) -> Result<()>;

    /// Per-source variant for batch nodes; must call
    /// [`BatchNode::add_source_targets`](crate::BatchNode::add_source_targets)
    /// for every changed source.
    fn build_batch(&self, _node: &BatchNode) -> Result<()> {
        Err(KilnError::msg(format!("builder '{}' does not support batch builds", self.name())))
    }

    /// Extra dependencies to inject before the input fingerprint is taken.
    fn depends(&self, _node: &Node) -> Option<Vec<Arc<Entity>>> {
        None
    }

    /// Last-chance rewrite of the node's sources.
    fn replace(&self, _node: &Node) -> Option<Vec<Source>> {
        None
    }

    /// Optional decomposition into sub-nodes.
    fn split(&self, _node: &Node) -> Option<Vec<Node>> {
        None
    }

    /// Custom cleanup when a node is cleared.
    fn clear(&self, _node: AnyNode<'_>) -> Result<()> {
        Ok(())
    }

    /// The three parts of the human-readable status line.
    fn build_str_args(&self, node: AnyNode<'_>, _brief: bool) -> BuildStrArgs {
        BuildStrArgs {
            name: vec![StrArg::Text(self.name().to_string())],
            sources: node
                .peek_source_values()
                .iter()
                .filter_map(|e| StrArg::from_entity(e))
                .collect(),
            targets: node
                .peek_target_values()
                .iter()
                .filter_map(|e| StrArg::from_entity(e))
                .collect(),
        }
    }
}

/// Shared file entities, so checksums of headers pulled in by many nodes are
/// computed once per run. Only untagged file values are cached.
static VALUE_CACHE: Lazy<Mutex<HashMap<EntityId, Arc<Entity>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Drops all cached file entities. Long-running processes call this between
/// build runs so a later run re-reads the disk.
pub fn clear_value_cache() {
    VALUE_CACHE.lock().unwrap_or_else(PoisonError::into_inner).clear();
}

/// The default canonicalization: paths become whole-file checksum entities,
/// byte and string data become simple entities, entities pass through.
pub fn default_make_value(
    raw: &RawValue,
    options: &MakeValue,
    cwd: &Path,
) -> Result<Arc<Entity>> {
    match raw {
        RawValue::Entity(entity) => Ok(entity.clone()),
        RawValue::Path(path) => {
            let cacheable = options.use_cache && options.tags.is_none();
            if cacheable {
                let id = EntityId {
                    class: EntityClass::FileChecksum,
                    name: crate::utils::normalize_path(path, Some(cwd))?
                        .to_string_lossy()
                        .into_owned(),
                };
                let mut cache = VALUE_CACHE.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(entity) = cache.get(&id) {
                    return Ok(entity.clone());
                }
                let entity =
                    Arc::new(Entity::file_checksum_in(path, Some(cwd), None)?);
                cache.insert(id, entity.clone());
                return Ok(entity);
            }
            Ok(Arc::new(Entity::file_checksum_in(path, Some(cwd), options.tags.clone())?))
        }
        RawValue::Bytes(bytes) => Ok(Arc::new(
            Entity::simple_with(Some(bytes.clone()), None, None, options.tags.clone())?,
        )),
        RawValue::Str(text) => Ok(Arc::new(Entity::simple_with(
            Some(text.clone().into_bytes()),
            None,
            None,
            options.tags.clone(),
        )?)),
    }
}

/// Canonicalizes a raw byte string into a signature entity; anything that is
/// not a byte string is rejected.
pub fn make_signature_value(raw: &RawValue) -> Result<Arc<Entity>> {
    match raw {
        RawValue::Bytes(bytes) => Ok(Arc::new(Entity::signature_value(bytes.clone())?)),
        RawValue::Path(_) => Err(KilnError::InvalidSignatureData("path")),
        RawValue::Str(_) => Err(KilnError::InvalidSignatureData("string")),
        RawValue::Entity(_) => Err(KilnError::InvalidSignatureData("entity")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn raw_path_resolves_relative_to_cwd() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.c"), b"int a;").unwrap();

        let value =
            default_make_value(&RawValue::path("a.c"), &MakeValue::default(), dir.path()).unwrap();
        assert_eq!(value.path().unwrap(), crate::utils::normalize_path("a.c", Some(dir.path())).unwrap());
        assert!(value.is_actual());
    }

    #[test]
    fn cached_values_are_shared() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.h"), b"#define A 1").unwrap();

        clear_value_cache();
        let first =
            default_make_value(&RawValue::path("a.h"), &MakeValue::cached(), dir.path()).unwrap();
        let second =
            default_make_value(&RawValue::path("a.h"), &MakeValue::cached(), dir.path()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        clear_value_cache();
    }

    #[test]
    fn tagged_values_bypass_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.h"), b"#define A 1").unwrap();

        let tags: Tags = ["public".to_string()].into_iter().collect();
        let options = MakeValue { use_cache: true, tags: Some(tags.clone()) };
        let value = default_make_value(&RawValue::path("a.h"), &options, dir.path()).unwrap();
        assert_eq!(value.tags(), Some(&tags));
    }

    #[test]
    fn signature_values_require_bytes() {
        assert!(make_signature_value(&RawValue::Bytes(b"ok".to_vec())).is_ok());
        assert!(matches!(
            make_signature_value(&RawValue::Str("nope".into())),
            Err(KilnError::InvalidSignatureData("string"))
        ));
    }
}
