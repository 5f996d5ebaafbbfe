//! The persistent cache record for a node and the decision procedure that
//! answers "is this cached result still valid?".

use crate::{
    entity::Entity,
    error::{KilnError, Result},
    signature::Signature,
    vfile::VFile,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The record persisted per node (or per source of a batch node).
///
/// A value is *complete* iff its signature and its targets are present. An
/// intentionally empty target list still counts as built: `Some(vec![])` is
/// complete, `None` is not.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeValue {
    /// The node key: a digest of the builder identity and the source names,
    /// or of the declared target ids.
    pub name: Signature,
    /// The input fingerprint the targets were produced from.
    pub signature: Option<Signature>,
    /// Target entities, with the signatures recorded at save time.
    pub targets: Option<Vec<Arc<Entity>>>,
    /// Side-effect targets: tracked for staleness and cleanup, invisible to
    /// downstream sources.
    pub itargets: Option<Vec<Arc<Entity>>>,
    /// Handles into the value file naming the implicit deps last observed.
    pub idep_keys: Vec<u64>,
}

impl NodeValue {
    /// A probe carrying only the identity and fingerprint of a node.
    pub fn probe(name: Signature, signature: Option<Signature>) -> Self {
        Self { name, signature, targets: None, itargets: None, idep_keys: Vec::new() }
    }

    /// Whether this record represents a finished build.
    pub fn is_complete(&self) -> bool {
        self.signature.is_some() && self.targets.is_some()
    }

    /// Decides whether the cached result for this probe is still valid and,
    /// if so, adopts the stored targets into the probe.
    ///
    /// Implicit deps are validated before targets: a changed header
    /// invalidates an object file whose own bytes are unchanged, so the
    /// cheaper content check on targets must not short-circuit that.
    pub fn refresh_actual(&mut self, vfile: &mut VFile) -> Result<bool> {
        let Some(signature) = self.signature.clone() else {
            trace!(name = %self.name, "no input fingerprint");
            return Ok(false);
        };

        let Some(stored) = vfile.find_node(&self.name)? else {
            trace!(name = %self.name, "no cached result");
            return Ok(false);
        };

        if stored.signature.as_ref() != Some(&signature) {
            trace!(name = %self.name, "input fingerprint changed");
            return Ok(false);
        }

        if !implicit_deps_actual(vfile, &stored.idep_keys)? {
            trace!(name = %self.name, "implicit deps changed");
            return Ok(false);
        }

        let Some(targets) = &stored.targets else {
            trace!(name = %self.name, "cached result has no targets");
            return Ok(false);
        };

        if !targets.iter().all(|target| target.is_actual()) {
            trace!(name = %self.name, "targets are not actual");
            return Ok(false);
        }

        if !stored.itargets.iter().flatten().all(|target| target.is_actual()) {
            trace!(name = %self.name, "side-effect targets are not actual");
            return Ok(false);
        }

        self.targets = stored.targets;
        self.itargets = stored.itargets;
        Ok(true)
    }
}

/// Checks every implicit dep behind `keys`.
///
/// A dep whose fresh signature differs from the stored one is replaced in
/// place before reporting stale: the node rebuilds either way, but the store
/// now reflects reality without another round of discovery.
fn implicit_deps_actual(vfile: &mut VFile, keys: &[u64]) -> Result<bool> {
    if keys.is_empty() {
        return Ok(true);
    }

    let Some(values) = vfile.get_values(keys)? else {
        return Ok(false);
    };

    for (key, value) in keys.iter().zip(values) {
        if value.signature().is_none() {
            return Ok(false);
        }
        let actual = value.get_actual();
        if actual != *value {
            trace!(dep = %value, "implicit dep changed, repairing stored record");
            vfile.replace_value(*key, Arc::new(actual))?;
            return Ok(false);
        }
    }

    Ok(true)
}

/// Fails with [`KilnError::UnactualValue`] if any value disagrees with its
/// source of truth. Run before persisting a build result.
pub(crate) fn ensure_actual_values<'a>(
    values: impl IntoIterator<Item = &'a Arc<Entity>>,
) -> Result<()> {
    for value in values {
        if !value.is_actual() {
            return Err(KilnError::UnactualValue(value.name()));
        }
    }
    Ok(())
}
