//! Batch nodes: the same action applied to each source independently.
//!
//! Instead of one cached record, a batch node keeps one [`NodeValue`] per
//! source, each keyed by a digest derived from the builder-seeded hashes and
//! the source's name and signature. Checking actuality partitions the sources
//! into cached and changed; only the changed subset is handed back to the
//! builder.

use super::{
    derive_name, derive_signature, lock, value, NodeCore, NodeRef, NodeTargetsFilter, NodeValue,
    Source, TargetUpdate,
};
use crate::{
    builder::{AnyNode, Builder, MakeValue},
    entity::{Entity, EntityId},
    error::{KilnError, Result},
    events,
    signature::Signature,
    vfile::VFile,
};
use std::{
    collections::HashSet,
    env,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

struct BatchSlot {
    source: Arc<Entity>,
    value: NodeValue,
    ideps: Vec<Arc<Entity>>,
}

#[derive(Default)]
struct BatchState {
    targets: Option<Vec<Arc<Entity>>>,
    itargets: Option<Vec<Arc<Entity>>>,
}

/// A node performing the same action on each source, with per-source cached
/// state. Has no whole-node name or signature.
pub struct BatchNode {
    core: NodeCore,
    slots: Mutex<Option<Vec<BatchSlot>>>,
    changed: Mutex<Option<Vec<Arc<Entity>>>>,
    state: Mutex<BatchState>,
}

impl BatchNode {
    pub fn new(
        builder: Arc<dyn Builder>,
        sources: impl IntoIterator<Item = impl Into<Source>>,
    ) -> Result<Self> {
        let cwd = env::current_dir().map_err(|err| KilnError::io(err, "."))?;
        Ok(Self::with_cwd(builder, sources, cwd))
    }

    pub fn with_cwd(
        builder: Arc<dyn Builder>,
        sources: impl IntoIterator<Item = impl Into<Source>>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        let sources = sources.into_iter().map(Into::into).collect();
        Self {
            core: NodeCore::new(builder, sources, cwd.into()),
            slots: Mutex::new(None),
            changed: Mutex::new(None),
            state: Mutex::new(BatchState::default()),
        }
    }

    pub fn builder(&self) -> Arc<dyn Builder> {
        self.core.builder()
    }

    pub fn cwd(&self) -> &Path {
        self.core.cwd()
    }

    pub fn initiate(&self) -> Result<()> {
        self.core.initiate()
    }

    pub fn depends(&self, dependencies: impl IntoIterator<Item = Source>) -> Result<()> {
        self.core.depends(dependencies)
    }

    pub fn update_dep_values(&self) -> Result<()> {
        self.core.update_dep_values()
    }

    pub fn dep_values(&self) -> Result<Vec<Arc<Entity>>> {
        self.core.dep_values()
    }

    /// A batch node has no single name; per-source keys are in [`Self::names`].
    pub fn name(&self) -> Result<Signature> {
        Err(KilnError::BatchNodeName)
    }

    /// A batch node has no single signature.
    pub fn signature(&self) -> Result<Option<Signature>> {
        Err(KilnError::BatchNodeName)
    }

    /// The per-source node keys, in source order.
    pub fn names(&self) -> Result<Vec<Signature>> {
        self.ensure_slots()?;
        Ok(lock(&self.slots)
            .iter()
            .flatten()
            .map(|slot| slot.value.name.clone())
            .collect())
    }

    /// Every resolved source, regardless of cache state.
    pub fn all_source_values(&self) -> Result<Vec<Arc<Entity>>> {
        self.core.source_values()
    }

    /// The sources the builder must (re)process: everything whose cached
    /// result is not actual, or everything on a fresh node.
    pub fn changed_source_values(&self) -> Result<Vec<Arc<Entity>>> {
        self.ensure_slots()?;
        if let Some(changed) = &*lock(&self.changed) {
            return Ok(changed.clone());
        }
        let all = self.core.source_values()?;
        *lock(&self.changed) = Some(all.clone());
        Ok(all)
    }

    /// Alias for [`Self::changed_source_values`]; the batch counterpart of
    /// [`Node::source_values`](super::Node::source_values).
    pub fn source_values(&self) -> Result<Vec<Arc<Entity>>> {
        self.changed_source_values()
    }

    /// Runs the batch action and aggregates the per-source targets.
    pub fn build(&self) -> Result<()> {
        self.changed_source_values()?;
        self.core.builder().build_batch(self)?;

        let mut targets = Vec::new();
        let mut itargets = Vec::new();
        {
            let slots = lock(&self.slots);
            for slot in slots.iter().flatten() {
                let Some(slot_targets) = &slot.value.targets else {
                    return Err(KilnError::NoSourceTargets {
                        source_name: slot.source.name(),
                        node: self.build_str(false),
                    });
                };
                targets.extend(slot_targets.iter().cloned());
                itargets.extend(slot.value.itargets.clone().unwrap_or_default());
            }
        }

        let mut state = lock(&self.state);
        state.targets = Some(targets);
        state.itargets = Some(itargets);
        Ok(())
    }

    /// Registering whole-node targets is a programmer error on a batch node.
    pub fn add_targets(&self, _update: TargetUpdate) -> Result<()> {
        Err(KilnError::BatchNodeTargets)
    }

    /// Registers outputs for one source; the builder's callback during
    /// `build_batch`.
    pub fn add_source_targets(&self, source: &Arc<Entity>, update: TargetUpdate) -> Result<()> {
        self.ensure_slots()?;

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

        let source_id = source.id();
        let mut slots = lock(&self.slots);
        let slot = slots
            .iter_mut()
            .flatten()
            .find(|slot| slot.source.id() == source_id)
            .ok_or_else(|| KilnError::UnknownSource(source.name()))?;

        slot.value.targets.get_or_insert_with(Vec::new).extend(targets);
        slot.value.itargets.get_or_insert_with(Vec::new).extend(side_effects);
        slot.ideps.extend(implicit_deps);
        Ok(())
    }

    /// Marks every changed source as built with an empty target list.
    pub fn set_no_targets(&self) -> Result<()> {
        let changed = self.changed_source_values()?;
        let changed_ids: HashSet<EntityId> = changed.iter().map(|value| value.id()).collect();
        let mut slots = lock(&self.slots);
        for slot in slots.iter_mut().flatten() {
            if changed_ids.contains(&slot.source.id()) && slot.value.targets.is_none() {
                slot.value.targets = Some(Vec::new());
            }
        }
        Ok(())
    }

    /// The aggregated targets of all sources.
    pub fn target_values(&self) -> Result<Vec<Arc<Entity>>> {
        let targets = lock(&self.state).targets.clone();
        targets.ok_or_else(|| KilnError::NoTargets(self.build_str(false)))
    }

    /// The aggregated side-effect targets.
    pub fn itarget_values(&self) -> Result<Vec<Arc<Entity>>> {
        let itargets = lock(&self.state).itargets.clone();
        itargets.ok_or_else(|| KilnError::NoTargets(self.build_str(false)))
    }

    /// Persists the per-source results of every changed source that was
    /// actually built.
    pub fn save(&self, vfile: &mut VFile) -> Result<()> {
        let changed = self.changed_source_values()?;
        let changed_ids: HashSet<EntityId> = changed.iter().map(|value| value.id()).collect();

        let mut slots = lock(&self.slots);
        for slot in slots.iter_mut().flatten() {
            if !changed_ids.contains(&slot.source.id()) {
                continue;
            }
            // a source whose build was skipped or failed has nothing to save
            if slot.value.targets.is_none() {
                continue;
            }

            if cfg!(debug_assertions) {
                value::ensure_actual_values(slot.value.targets.iter().flatten())?;
                value::ensure_actual_values(&slot.ideps)?;
            }

            slot.value.idep_keys = vfile.add_values(&slot.ideps)?;
            if slot.value.itargets.is_none() {
                slot.value.itargets = Some(Vec::new());
            }
            vfile.add_node(slot.value.clone())?;
        }
        Ok(())
    }

    /// Adopts all stored targets so they can be removed, then drops every
    /// per-source record and runs the builder's cleanup.
    pub fn clear(&self, vfile: &mut VFile) -> Result<()> {
        let names = self.names()?;

        let mut targets = Vec::new();
        let mut itargets = Vec::new();
        for name in &names {
            if let Some(stored) = vfile.find_node(name)? {
                if let Some(stored_targets) = stored.targets {
                    targets.extend(stored_targets);
                    itargets.extend(stored.itargets.unwrap_or_default());
                }
            }
        }

        {
            let mut state = lock(&self.state);
            state.targets = Some(targets);
            state.itargets = Some(itargets);
        }

        vfile.remove_nodes(&names)?;

        if let Err(err) = self.core.builder().clear(AnyNode::Batch(self)) {
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

    /// Partitions the sources into cached and changed. Returns `true` only
    /// when every per-source record is valid; otherwise the changed subset is
    /// remembered for [`Self::changed_source_values`].
    pub fn is_actual(
        &self,
        vfile: &mut VFile,
        built_set: Option<&HashSet<Signature>>,
    ) -> Result<bool> {
        self.ensure_slots()?;

        let mut changed = Vec::new();
        let mut targets = Vec::new();
        let mut itargets = Vec::new();
        {
            let mut slots = lock(&self.slots);
            for slot in slots.iter_mut().flatten() {
                let mut actual = slot.value.refresh_actual(vfile)?;
                if actual {
                    if let Some(built) = built_set {
                        actual = built.contains(&slot.value.name);
                    }
                }

                if !actual {
                    changed.push(slot.source.clone());
                } else if changed.is_empty() {
                    targets.extend(slot.value.targets.clone().unwrap_or_default());
                    itargets.extend(slot.value.itargets.clone().unwrap_or_default());
                }
            }
        }

        if !changed.is_empty() {
            *lock(&self.changed) = Some(changed);
            events::sink().outdated_node(&self.build_str(true));
            return Ok(false);
        }

        let mut state = lock(&self.state);
        state.targets = Some(targets);
        state.itargets = Some(itargets);
        Ok(true)
    }

    /// A tag-filtered view of the aggregated targets.
    pub fn at(
        self: &Arc<Self>,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> NodeTargetsFilter {
        NodeTargetsFilter::new(NodeRef::Batch(self.clone()), tags)
    }

    pub fn build_str(&self, brief: bool) -> String {
        let args = self.core.builder().build_str_args(AnyNode::Batch(self), brief);
        crate::report::build_str(&args, brief)
    }

    pub fn clear_str(&self, brief: bool) -> String {
        let args = self.core.builder().build_str_args(AnyNode::Batch(self), brief);
        crate::report::clear_str(&args, brief)
    }

    pub(crate) fn peek_source_values(&self) -> Vec<Arc<Entity>> {
        if let Some(changed) = &*lock(&self.changed) {
            return changed.clone();
        }
        self.core.peek_source_values()
    }

    pub(crate) fn peek_target_values(&self) -> Vec<Arc<Entity>> {
        lock(&self.state).targets.clone().unwrap_or_default()
    }

    /// Lazily derives the per-source keys from the seeded hashes.
    fn ensure_slots(&self) -> Result<()> {
        if lock(&self.slots).is_some() {
            return Ok(());
        }

        let sources = self.core.source_values()?;
        let name_seed = self.core.name_hasher();
        let signature_seed = self.core.signature_hasher()?;

        let slots: Vec<BatchSlot> = sources
            .iter()
            .map(|source| BatchSlot {
                source: source.clone(),
                value: NodeValue::probe(
                    derive_name(&name_seed, &source.name()),
                    derive_signature(signature_seed.as_ref(), source.signature()),
                ),
                ideps: Vec::new(),
            })
            .collect();

        let mut guard = lock(&self.slots);
        if guard.is_none() {
            *guard = Some(slots);
        }
        Ok(())
    }
}

impl std::fmt::Debug for BatchNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchNode")
            .field("builder", &self.core.builder().name())
            .field("cwd", &self.core.cwd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{builder::RawValue, node::Node};
    use std::fs;

    struct TouchBuilder;

    impl Builder for TouchBuilder {
        fn name(&self) -> &str {
            "touch"
        }

        fn signature(&self) -> Signature {
            Signature::new(b"touch-v1".to_vec())
        }

        fn build(&self, _node: &Node) -> Result<()> {
            Ok(())
        }

        fn build_batch(&self, node: &BatchNode) -> Result<()> {
            for source in node.changed_source_values()? {
                let target = format!("{}.out", source.name());
                fs::write(&target, b"touched").map_err(|err| KilnError::io(err, &target))?;
                node.add_source_targets(
                    &source,
                    TargetUpdate::targets([RawValue::path(target)]),
                )?;
            }
            Ok(())
        }
    }

    fn setup(dir: &Path, names: &[&str]) -> Arc<BatchNode> {
        for name in names {
            fs::write(dir.join(name), name.as_bytes()).unwrap();
        }
        let sources: Vec<Source> = names.iter().map(|n| Source::path(*n)).collect();
        Arc::new(BatchNode::with_cwd(Arc::new(TouchBuilder), sources, dir))
    }

    #[test]
    fn whole_node_identity_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let node = setup(dir.path(), &["x.c"]);
        assert!(matches!(node.name(), Err(KilnError::BatchNodeName)));
        assert!(matches!(node.signature(), Err(KilnError::BatchNodeName)));
    }

    #[test]
    fn per_source_names_are_distinct_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let node = setup(dir.path(), &["x.c", "y.c"]);
        let names = node.names().unwrap();
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);

        let again = setup(dir.path(), &["x.c", "y.c"]);
        assert_eq!(again.names().unwrap(), names);
    }

    #[test]
    fn add_targets_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let node = setup(dir.path(), &["x.c"]);
        assert!(matches!(
            node.add_targets(TargetUpdate::default()),
            Err(KilnError::BatchNodeTargets)
        ));
    }

    #[test]
    fn unknown_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let node = setup(dir.path(), &["x.c"]);
        let stranger = Arc::new(Entity::simple(b"stranger".to_vec()).unwrap());
        let err = node
            .add_source_targets(&stranger, TargetUpdate::default())
            .unwrap_err();
        assert!(matches!(err, KilnError::UnknownSource(_)));
    }

    #[test]
    fn build_aggregates_per_source_targets() {
        let dir = tempfile::tempdir().unwrap();
        let node = setup(dir.path(), &["x.c", "y.c"]);
        node.build().unwrap();
        let targets = node.target_values().unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.is_actual()));
    }
}
