//! The node model: units of build work over entities.
//!
//! A [`Node`] couples a [`Builder`] with declared sources and produces target
//! entities. Its derived identity (`name`) and input fingerprint
//! (`signature`) are computed lazily and memoized. A [`BatchNode`] runs the
//! same action per source with per-source cached state.
//!
//! Nodes are shared across the dependency graph behind `Arc`; all methods
//! take `&self` and guard mutable state internally. The scheduler still owns
//! the ordering: a node must not start until its source nodes and dep nodes
//! have finished building or been confirmed actual.

mod batch;
mod value;

pub use batch::BatchNode;
pub use value::NodeValue;

use crate::{
    builder::{AnyNode, Builder, MakeValue, RawValue},
    entity::{Entity, Tags},
    error::{KilnError, Result},
    events, report,
    signature::{Signature, SignatureHasher},
    vfile::VFile,
};
use once_cell::sync::OnceCell;
use std::{
    collections::HashSet,
    env,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A reference to either kind of node, usable as a source or dependency.
#[derive(Clone)]
pub enum NodeRef {
    Single(Arc<Node>),
    Batch(Arc<BatchNode>),
}

impl NodeRef {
    /// The finalized targets of the referenced node.
    pub fn target_values(&self) -> Result<Vec<Arc<Entity>>> {
        match self {
            NodeRef::Single(node) => node.target_values(),
            NodeRef::Batch(node) => node.target_values(),
        }
    }
}

impl From<Arc<Node>> for NodeRef {
    fn from(node: Arc<Node>) -> Self {
        NodeRef::Single(node)
    }
}

impl From<Arc<BatchNode>> for NodeRef {
    fn from(node: Arc<BatchNode>) -> Self {
        NodeRef::Batch(node)
    }
}

/// A declared input of a node.
#[derive(Clone)]
pub enum Source {
    /// All targets of another node.
    Node(NodeRef),
    /// A tag-filtered subset of another node's targets.
    Filter(NodeTargetsFilter),
    /// An entity used as-is.
    Entity(Arc<Entity>),
    /// A raw value the builder canonicalizes during resolution.
    Raw(RawValue),
}

impl From<NodeRef> for Source {
    fn from(node: NodeRef) -> Self {
        Source::Node(node)
    }
}

impl From<Arc<Node>> for Source {
    fn from(node: Arc<Node>) -> Self {
        Source::Node(node.into())
    }
}

impl From<Arc<BatchNode>> for Source {
    fn from(node: Arc<BatchNode>) -> Self {
        Source::Node(node.into())
    }
}

impl From<NodeTargetsFilter> for Source {
    fn from(filter: NodeTargetsFilter) -> Self {
        Source::Filter(filter)
    }
}

impl From<Arc<Entity>> for Source {
    fn from(entity: Arc<Entity>) -> Self {
        Source::Entity(entity)
    }
}

impl From<RawValue> for Source {
    fn from(raw: RawValue) -> Self {
        Source::Raw(raw)
    }
}

impl Source {
    /// A raw file path source.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Source::Raw(RawValue::Path(path.into()))
    }
}

/// Restricts a node's contribution to targets whose tags intersect `tags`.
#[derive(Clone)]
pub struct NodeTargetsFilter {
    node: NodeRef,
    tags: Tags,
}

impl NodeTargetsFilter {
    pub fn new(node: impl Into<NodeRef>, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { node: node.into(), tags: tags.into_iter().map(Into::into).collect() }
    }

    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// The filtered targets of the underlying node.
    pub fn get(&self) -> Result<Vec<Arc<Entity>>> {
        Ok(self
            .node
            .target_values()?
            .into_iter()
            .filter(|value| {
                value.tags().is_some_and(|tags| tags.intersection(&self.tags).next().is_some())
            })
            .collect())
    }
}

/// Outputs registered by a builder during one build call.
#[derive(Default)]
pub struct TargetUpdate {
    /// Entities the action produces for downstream consumption.
    pub targets: Vec<RawValue>,
    /// Real outputs invisible to downstream sources (map files, debug info).
    pub side_effects: Vec<RawValue>,
    /// Dependencies discovered while building (scanned includes).
    pub implicit_deps: Vec<RawValue>,
    /// Tags attached to the registered targets.
    pub tags: Option<Tags>,
}

impl TargetUpdate {
    pub fn targets(targets: impl IntoIterator<Item = impl Into<RawValue>>) -> Self {
        Self { targets: targets.into_iter().map(Into::into).collect(), ..Default::default() }
    }

    pub fn with_side_effects(
        mut self,
        side_effects: impl IntoIterator<Item = impl Into<RawValue>>,
    ) -> Self {
        self.side_effects = side_effects.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_implicit_deps(
        mut self,
        implicit_deps: impl IntoIterator<Item = impl Into<RawValue>>,
    ) -> Self {
        self.implicit_deps = implicit_deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }
}

/// State shared by single and batch nodes: the builder handle, the working
/// directory, declared sources and explicit dependencies.
pub(crate) struct NodeCore {
    builder: Mutex<Arc<dyn Builder>>,
    cwd: PathBuf,
    sources: Mutex<Vec<Source>>,
    dep_nodes: Mutex<Vec<NodeRef>>,
    dep_values: Mutex<Vec<Arc<Entity>>>,
    source_values: Mutex<Option<Vec<Arc<Entity>>>>,
}

impl NodeCore {
    fn new(builder: Arc<dyn Builder>, sources: Vec<Source>, cwd: PathBuf) -> Self {
        Self {
            builder: Mutex::new(builder),
            cwd,
            sources: Mutex::new(sources),
            dep_nodes: Mutex::new(Vec::new()),
            dep_values: Mutex::new(Vec::new()),
            source_values: Mutex::new(None),
        }
    }

    pub(crate) fn builder(&self) -> Arc<dyn Builder> {
        lock(&self.builder).clone()
    }

    pub(crate) fn cwd(&self) -> &Path {
        &self.cwd
    }

    fn initiate(&self) -> Result<()> {
        let builder = self.builder();
        if let Some(specialized) = builder.initiate(&self.cwd)? {
            *lock(&self.builder) = specialized;
        }
        Ok(())
    }

    fn depends(&self, dependencies: impl IntoIterator<Item = Source>) -> Result<()> {
        for dependency in dependencies {
            match dependency {
                Source::Node(node) => lock(&self.dep_nodes).push(node),
                Source::Filter(filter) => lock(&self.dep_nodes).push(filter.node.clone()),
                Source::Entity(entity) => lock(&self.dep_values).push(entity),
                Source::Raw(raw) => {
                    return Err(KilnError::InvalidDependency(raw.describe()));
                }
            }
        }
        lock(&self.dep_values).sort_by_key(|value| value.name());
        Ok(())
    }

    /// Folds finalized dep-node targets into the dep values and drops the
    /// node references. Must run before the fingerprint is taken.
    fn update_dep_values(&self) -> Result<()> {
        let nodes = std::mem::take(&mut *lock(&self.dep_nodes));
        if nodes.is_empty() {
            return Ok(());
        }
        let mut extra = Vec::new();
        for node in &nodes {
            extra.extend(node.target_values()?);
        }
        let mut values = lock(&self.dep_values);
        values.extend(extra);
        values.sort_by_key(|value| value.name());
        Ok(())
    }

    fn dep_values(&self) -> Result<Vec<Arc<Entity>>> {
        self.update_dep_values()?;
        Ok(lock(&self.dep_values).clone())
    }

    /// Resolves declared sources into entities, memoized. Source nodes expand
    /// to their targets, filters to the tagged subset, raw values go through
    /// the builder with the node's working directory.
    fn source_values(&self) -> Result<Vec<Arc<Entity>>> {
        if let Some(values) = &*lock(&self.source_values) {
            return Ok(values.clone());
        }
        let sources = lock(&self.sources).clone();
        let builder = self.builder();
        let mut values = Vec::new();
        for source in &sources {
            match source {
                Source::Node(node) => values.extend(node.target_values()?),
                Source::Filter(filter) => values.extend(filter.get()?),
                Source::Entity(entity) => values.push(entity.clone()),
                Source::Raw(raw) => {
                    values.push(builder.make_value(raw, &MakeValue::cached(), &self.cwd)?)
                }
            }
        }
        *lock(&self.source_values) = Some(values.clone());
        Ok(values)
    }

    fn peek_source_values(&self) -> Vec<Arc<Entity>> {
        lock(&self.source_values).clone().unwrap_or_default()
    }

    fn replace_sources(&self, sources: Vec<Source>) {
        *lock(&self.sources) = sources;
        *lock(&self.source_values) = None;
    }

    fn source_nodes(&self) -> Vec<NodeRef> {
        lock(&self.sources)
            .iter()
            .filter_map(|source| match source {
                Source::Node(node) => Some(node.clone()),
                Source::Filter(filter) => Some(filter.node.clone()),
                _ => None,
            })
            .collect()
    }

    /// A hasher seeded with the builder identity; per-name derivations extend
    /// clones of it.
    fn name_hasher(&self) -> SignatureHasher {
        let mut hasher = SignatureHasher::new();
        hasher.update(self.builder().name());
        hasher
    }

    /// A hasher seeded with the builder fingerprint and the explicit dep
    /// values. `None` when any dep value has no signature: inputs we cannot
    /// fingerprint force a rebuild.
    fn signature_hasher(&self) -> Result<Option<SignatureHasher>> {
        let mut hasher = SignatureHasher::new();
        hasher.update(self.builder().signature().as_bytes());
        for dep in self.dep_values()? {
            let Some(signature) = dep.signature() else {
                return Ok(None);
            };
            hasher.update(dep.name());
            hasher.update(signature.as_bytes());
        }
        Ok(Some(hasher))
    }
}

#[derive(Default)]
struct BuildState {
    targets: Option<Vec<Arc<Entity>>>,
    itargets: Option<Vec<Arc<Entity>>>,
    ideps: Option<Vec<Arc<Entity>>>,
}

/// One unit of build work.
pub struct Node {
    core: NodeCore,
    name: OnceCell<Signature>,
    signature: OnceCell<Option<Signature>>,
    state: Mutex<BuildState>,
}

impl Node {
    /// Creates a node running in the process working directory.
    pub fn new(
        builder: Arc<dyn Builder>,
        sources: impl IntoIterator<Item = impl Into<Source>>,
    ) -> Result<Self> {
        let cwd = env::current_dir().map_err(|err| KilnError::io(err, "."))?;
        Ok(Self::with_cwd(builder, sources, cwd))
    }

    /// Creates a node whose source resolution and build run under `cwd`.
    pub fn with_cwd(
        builder: Arc<dyn Builder>,
        sources: impl IntoIterator<Item = impl Into<Source>>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        let sources = sources.into_iter().map(Into::into).collect();
        Self {
            core: NodeCore::new(builder, sources, cwd.into()),
            name: OnceCell::new(),
            signature: OnceCell::new(),
            state: Mutex::new(BuildState::default()),
        }
    }

    /// A node with the same builder, working directory and explicit deps,
    /// re-targeted at different sources.
    pub fn copy_with_sources(
        &self,
        sources: impl IntoIterator<Item = impl Into<Source>>,
    ) -> Self {
        let node = Self::with_cwd(self.core.builder(), sources, self.core.cwd.clone());
        *lock(&node.core.dep_nodes) = lock(&self.core.dep_nodes).clone();
        *lock(&node.core.dep_values) = lock(&self.core.dep_values).clone();
        node
    }

    pub fn builder(&self) -> Arc<dyn Builder> {
        self.core.builder()
    }

    pub fn cwd(&self) -> &Path {
        self.core.cwd()
    }

    /// Runs the builder's pre-build hook, possibly specializing the builder.
    pub fn initiate(&self) -> Result<()> {
        self.core.initiate()
    }

    /// Declares extra dependencies: nodes whose outputs must precede this
    /// node, or entities the action also consumes.
    pub fn depends(&self, dependencies: impl IntoIterator<Item = Source>) -> Result<()> {
        self.core.depends(dependencies)
    }

    /// See [`NodeCore::update_dep_values`]; exposed for schedulers that
    /// finalize deps before fingerprinting a wave of nodes.
    pub fn update_dep_values(&self) -> Result<()> {
        self.core.update_dep_values()
    }

    pub fn dep_values(&self) -> Result<Vec<Arc<Entity>>> {
        self.core.dep_values()
    }

    /// Nodes referenced by the declared sources.
    pub fn source_nodes(&self) -> Vec<NodeRef> {
        self.core.source_nodes()
    }

    /// The declared sources resolved to entities.
    pub fn source_values(&self) -> Result<Vec<Arc<Entity>>> {
        self.core.source_values()
    }

    /// The identity of this node.
    ///
    /// When the builder can declare its targets up front the name is derived
    /// from the target ids; otherwise from the builder identity and the
    /// sorted source names.
    pub fn name(&self) -> Result<Signature> {
        self.name
            .get_or_try_init(|| {
                if let Some(targets) = self.core.builder().declared_targets(self) {
                    let mut state = lock(&self.state);
                    if state.targets.is_none() {
                        state.targets = Some(targets.clone());
                    }
                    drop(state);

                    let mut ids: Vec<_> = targets
                        .iter()
                        .map(|target| {
                            let (name_hash, class) = target.dump_id();
                            let mut hasher = SignatureHasher::new();
                            hasher.update(name_hash.as_bytes());
                            hasher.update(class);
                            hasher.finish()
                        })
                        .collect();
                    ids.sort();

                    let mut hasher = SignatureHasher::new();
                    for id in ids {
                        hasher.update(id.as_bytes());
                    }
                    return Ok(hasher.finish());
                }

                let mut hasher = self.core.name_hasher();
                let mut names: Vec<_> =
                    self.core.source_values()?.iter().map(|value| value.name()).collect();
                names.sort();
                for name in names {
                    hasher.update(name);
                }
                Ok(hasher.finish())
            })
            .cloned()
    }

    /// The input fingerprint: builder signature, explicit dep values and the
    /// sorted source signatures. Absent when any dep value has no signature.
    pub fn signature(&self) -> Result<Option<Signature>> {
        self.signature
            .get_or_try_init(|| {
                let Some(mut hasher) = self.core.signature_hasher()? else {
                    return Ok(None);
                };
                let values = self.core.source_values()?;
                let mut signatures: Vec<_> =
                    values.iter().map(|value| value.signature().cloned()).collect();
                signatures.sort();
                for signature in &signatures {
                    hasher.update_opt(signature.as_ref());
                }
                Ok(Some(hasher.finish()))
            })
            .cloned()
    }

    /// All node keys this node contributes to the cache; a single node has
    /// exactly one.
    pub fn names(&self) -> Result<Vec<Signature>> {
        Ok(vec![self.name()?])
    }

    /// Injects the builder's extra dependencies, pre-fingerprint.
    pub fn build_depends(&self) -> Result<()> {
        if let Some(values) = self.core.builder().depends(self) {
            self.core.depends(values.into_iter().map(Source::Entity))?;
        }
        Ok(())
    }

    /// Applies the builder's last-chance source rewrite. Returns whether the
    /// sources changed.
    pub fn build_replace(&self) -> Result<bool> {
        match self.core.builder().replace(self) {
            Some(sources) => {
                self.core.replace_sources(sources);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Asks the builder to decompose this node into sub-nodes.
    pub fn build_split(&self) -> Result<Option<Vec<Node>>> {
        self.core.update_dep_values()?;
        Ok(self.core.builder().split(self))
    }

    /// Runs the build action. Outputs are reset first; the builder must
    /// register targets (or declare there are none) before returning.
    pub fn build(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.targets = None;
            state.itargets = Some(Vec::new());
            state.ideps = Some(Vec::new());
        }

        self.core.builder().build(self)?;

        if lock(&self.state).targets.is_none() {
            return Err(KilnError::NoTargets(self.build_str(false)));
        }
        Ok(())
    }

    /// Marks the node as built with an intentionally empty target list.
    pub fn set_no_targets(&self) {
        lock(&self.state).targets = Some(Vec::new());
    }

    /// Registers outputs; the builder's callback during `build`.
    pub fn add_targets(&self, update: TargetUpdate) -> Result<()> {
        let builder = self.core.builder();
        let cwd = self.core.cwd();

        let mut targets = Vec::with_capacity(update.targets.len());
        for raw in &update.targets {
            targets.push(builder.make_value(raw, &MakeValue::tagged(update.tags.clone()), cwd)?);
        }
        let mut side_effects = Vec::with_capacity(update.side_effects.len());
        for raw in &update.side_effects {
            side_effects.push(builder.make_value(raw, &MakeValue::default(), cwd)?);
        }
        let mut implicit_deps = Vec::with_capacity(update.implicit_deps.len());
        for raw in &update.implicit_deps {
            implicit_deps.push(builder.make_value(raw, &MakeValue::cached(), cwd)?);
        }

        let mut state = lock(&self.state);
        state.targets.get_or_insert_with(Vec::new).extend(targets);
        state.itargets.get_or_insert_with(Vec::new).extend(side_effects);
        state.ideps.get_or_insert_with(Vec::new).extend(implicit_deps);
        Ok(())
    }

    /// The entities produced by the action.
    pub fn target_values(&self) -> Result<Vec<Arc<Entity>>> {
        let targets = lock(&self.state).targets.clone();
        targets.ok_or_else(|| KilnError::NoTargets(self.build_str(false)))
    }

    /// Side-effect targets of the last build or adopted cached result.
    pub fn itarget_values(&self) -> Result<Vec<Arc<Entity>>> {
        let itargets = lock(&self.state).itargets.clone();
        itargets.ok_or_else(|| KilnError::NoTargets(self.build_str(false)))
    }

    /// Implicit deps discovered by the last build.
    pub fn idep_values(&self) -> Result<Vec<Arc<Entity>>> {
        let ideps = lock(&self.state).ideps.clone();
        ideps.ok_or_else(|| KilnError::NoTargets(self.build_str(false)))
    }

    pub(crate) fn peek_source_values(&self) -> Vec<Arc<Entity>> {
        self.core.peek_source_values()
    }

    pub(crate) fn peek_target_values(&self) -> Vec<Arc<Entity>> {
        lock(&self.state).targets.clone().unwrap_or_default()
    }

    /// Persists the build result: implicit deps become store entries, then a
    /// [`NodeValue`] with their keys is written under this node's name.
    pub fn save(&self, vfile: &mut VFile) -> Result<()> {
        let name = self.name()?;
        let signature = self.signature()?;

        let (targets, itargets, ideps) = {
            let state = lock(&self.state);
            let targets = state
                .targets
                .clone()
                .ok_or_else(|| KilnError::NoTargets(self.build_str(false)))?;
            (targets, state.itargets.clone().unwrap_or_default(), state.ideps.clone().unwrap_or_default())
        };

        if cfg!(debug_assertions) {
            value::ensure_actual_values(&targets)?;
            value::ensure_actual_values(&ideps)?;
        }

        let idep_keys = vfile.add_values(&ideps)?;
        let node_value = NodeValue {
            name,
            signature,
            targets: Some(targets),
            itargets: Some(itargets),
            idep_keys,
        };
        vfile.add_node(node_value)?;
        Ok(())
    }

    /// Adopts the stored targets (so they can be removed), drops the cache
    /// record and runs the builder's cleanup.
    pub fn clear(&self, vfile: &mut VFile) -> Result<()> {
        let name = self.name()?;
        let stored = vfile.find_node(&name)?;

        {
            let mut state = lock(&self.state);
            match stored {
                Some(value) if value.targets.is_some() => {
                    state.targets = value.targets;
                    state.itargets = Some(value.itargets.unwrap_or_default());
                }
                _ => {
                    state.targets = Some(Vec::new());
                    state.itargets = Some(Vec::new());
                }
            }
        }

        vfile.remove_nodes(&[name])?;

        if let Err(err) = self.core.builder().clear(AnyNode::Single(self)) {
            trace!(node = %self.build_str(true), %err, "builder clear failed");
        }
        Ok(())
    }

    /// Deletes the produced targets and side effects from disk.
    pub fn remove_targets(&self) -> Result<()> {
        for value in self.target_values()? {
            value.remove();
        }
        for value in self.itarget_values()? {
            value.remove();
        }
        Ok(())
    }

    /// Decides whether the cached result is still valid, adopting its targets
    /// on success so downstream nodes see them.
    ///
    /// `built_set` optionally restricts "actual" to node keys known to have
    /// been produced in the current run.
    pub fn is_actual(
        &self,
        vfile: &mut VFile,
        built_set: Option<&HashSet<Signature>>,
    ) -> Result<bool> {
        let name = self.name()?;
        let signature = self.signature()?;

        let mut probe = NodeValue::probe(name.clone(), signature);
        let mut actual = probe.refresh_actual(vfile)?;
        if actual {
            if let Some(built) = built_set {
                actual = built.contains(&name);
            }
        }

        if !actual {
            events::sink().outdated_node(&self.build_str(true));
            return Ok(false);
        }

        let mut state = lock(&self.state);
        state.targets = probe.targets;
        state.itargets = Some(probe.itargets.unwrap_or_default());
        Ok(true)
    }

    /// A tag-filtered view of this node's targets.
    pub fn at(
        self: &Arc<Self>,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> NodeTargetsFilter {
        NodeTargetsFilter::new(self.clone(), tags)
    }

    /// The `name << sources >> targets` status line.
    pub fn build_str(&self, brief: bool) -> String {
        let args = self.core.builder().build_str_args(AnyNode::Single(self), brief);
        report::build_str(&args, brief)
    }

    /// The targets-only status line used when cleaning.
    pub fn clear_str(&self, brief: bool) -> String {
        let args = self.core.builder().build_str_args(AnyNode::Single(self), brief);
        report::clear_str(&args, brief)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("builder", &self.core.builder().name())
            .field("cwd", &self.core.cwd)
            .field("name", &self.name.get())
            .finish()
    }
}

/// Derives a per-source node key from the seeded name hasher.
pub(crate) fn derive_name(seed: &SignatureHasher, source_name: &str) -> Signature {
    let mut hasher = seed.clone();
    hasher.update(source_name);
    hasher.finish()
}

/// Derives a per-source fingerprint; absent when either the node-level seed
/// or the source signature is absent.
pub(crate) fn derive_signature(
    seed: Option<&SignatureHasher>,
    source_signature: Option<&Signature>,
) -> Option<Signature> {
    match (seed, source_signature) {
        (Some(seed), Some(signature)) => {
            let mut hasher = seed.clone();
            hasher.update(signature.as_bytes());
            Some(hasher.finish())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct NoopBuilder {
        name: String,
        signature: Vec<u8>,
    }

    impl NoopBuilder {
        fn shared(name: &str, signature: &[u8]) -> Arc<dyn Builder> {
            Arc::new(Self { name: name.to_string(), signature: signature.to_vec() })
        }
    }

    impl Builder for NoopBuilder {
        fn name(&self) -> &str {
            &self.name
        }

        fn signature(&self) -> Signature {
            Signature::new(self.signature.clone())
        }

        fn build(&self, node: &Node) -> Result<()> {
            node.set_no_targets();
            Ok(())
        }
    }

    fn entity(data: &str) -> Arc<Entity> {
        Arc::new(Entity::simple(data.as_bytes().to_vec()).unwrap())
    }

    #[test]
    fn name_is_stable_and_source_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.c"), b"a").unwrap();
        fs::write(dir.path().join("b.c"), b"b").unwrap();

        let builder = NoopBuilder::shared("cc", b"v1");
        let forward = Node::with_cwd(
            builder.clone(),
            [Source::path("a.c"), Source::path("b.c")],
            dir.path(),
        );
        let reversed = Node::with_cwd(
            builder.clone(),
            [Source::path("b.c"), Source::path("a.c")],
            dir.path(),
        );
        assert_eq!(forward.name().unwrap(), reversed.name().unwrap());

        let other_builder = Node::with_cwd(
            NoopBuilder::shared("link", b"v1"),
            [Source::path("a.c"), Source::path("b.c")],
            dir.path(),
        );
        assert_ne!(forward.name().unwrap(), other_builder.name().unwrap());
    }

    #[test]
    fn signature_tracks_builder_and_sources() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.c"), b"a").unwrap();

        let v1 = Node::with_cwd(NoopBuilder::shared("cc", b"v1"), [Source::path("a.c")], dir.path());
        let v2 = Node::with_cwd(NoopBuilder::shared("cc", b"v2"), [Source::path("a.c")], dir.path());
        assert_ne!(v1.signature().unwrap(), v2.signature().unwrap());
        assert!(v1.signature().unwrap().is_some());
    }

    #[test]
    fn signature_is_absent_with_unsigned_dep_values() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.c"), b"a").unwrap();

        let node =
            Node::with_cwd(NoopBuilder::shared("cc", b"v1"), [Source::path("a.c")], dir.path());
        let unsigned = Arc::new(
            Entity::simple_with(None, Some("opaque".into()), None, None).unwrap(),
        );
        node.depends([Source::Entity(unsigned)]).unwrap();
        assert_eq!(node.signature().unwrap(), None);
    }

    #[test]
    fn raw_dependency_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::with_cwd(NoopBuilder::shared("cc", b"v1"), [] as [Source; 0], dir.path());
        let err = node.depends([Source::Raw(RawValue::from("loose"))]).unwrap_err();
        assert!(matches!(err, KilnError::InvalidDependency(_)));
    }

    #[test]
    fn dep_values_stay_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::with_cwd(NoopBuilder::shared("cc", b"v1"), [] as [Source; 0], dir.path());
        let z = Arc::new(
            Entity::simple_with(Some(b"1".to_vec()), Some("zz".into()), None, None).unwrap(),
        );
        let a = Arc::new(
            Entity::simple_with(Some(b"2".to_vec()), Some("aa".into()), None, None).unwrap(),
        );
        node.depends([Source::Entity(z), Source::Entity(a)]).unwrap();
        let names: Vec<_> = node.dep_values().unwrap().iter().map(|v| v.name()).collect();
        assert_eq!(names, vec!["aa".to_string(), "zz".to_string()]);
    }

    #[test]
    fn targets_are_unreadable_before_build() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::with_cwd(NoopBuilder::shared("cc", b"v1"), [] as [Source; 0], dir.path());
        assert!(matches!(node.target_values(), Err(KilnError::NoTargets(_))));
    }

    #[test]
    fn entity_sources_pass_through_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let blob = entity("blob");
        let node = Node::with_cwd(
            NoopBuilder::shared("cc", b"v1"),
            [Source::Entity(blob.clone())],
            dir.path(),
        );
        assert_eq!(node.source_values().unwrap(), vec![blob]);
    }

    #[test]
    fn make_value_uses_node_cwd() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.c"), b"a").unwrap();
        let node =
            Node::with_cwd(NoopBuilder::shared("cc", b"v1"), [Source::path("a.c")], dir.path());
        let values = node.source_values().unwrap();
        assert!(values[0].path().unwrap().starts_with(dir.path()));
    }

    #[test]
    fn filter_selects_intersecting_tags() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(Node::with_cwd(
            NoopBuilder::shared("gen", b"v1"),
            [] as [Source; 0],
            dir.path(),
        ));
        // simulate a finished build with tagged targets
        node.set_no_targets();
        node.add_targets(
            TargetUpdate::targets([RawValue::from("public-blob")]).with_tags(["public"]),
        )
        .unwrap();
        node.add_targets(
            TargetUpdate::targets([RawValue::from("private-blob")]).with_tags(["private"]),
        )
        .unwrap();

        let filtered = node.at(["public"]).get().unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].data().unwrap(), b"public-blob");
    }

    #[test]
    fn copy_with_sources_shares_builder_and_deps() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.c"), b"a").unwrap();
        fs::write(dir.path().join("b.c"), b"b").unwrap();

        let node =
            Node::with_cwd(NoopBuilder::shared("cc", b"v1"), [Source::path("a.c")], dir.path());
        node.depends([Source::Entity(entity("dep"))]).unwrap();

        let copy = node.copy_with_sources([Source::path("b.c")]);
        assert_eq!(copy.dep_values().unwrap(), node.dep_values().unwrap());
        assert_ne!(copy.name().unwrap(), node.name().unwrap());
    }

    #[test]
    fn builder_make_file_value_rejects_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let builder = NoopBuilder::shared("cc", b"v1");
        let err = builder
            .make_file_value(&RawValue::from(b"bytes".to_vec()), &MakeValue::default(), dir.path())
            .unwrap_err();
        assert!(matches!(err, KilnError::Message(_)));
    }
}
