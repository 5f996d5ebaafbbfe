//! The persistent value file: a durable, crash-safe store mapping entity ids
//! to entity records and node keys to cached build results.
//!
//! One keyed space holds both record kinds. Every record gets a stable `u64`
//! key when first added; keys are persisted with the records, so handles
//! stored inside [`NodeValue::idep_keys`](crate::NodeValue) stay valid across
//! processes. All mutators hold the exclusive file lock for the duration of a
//! logical update and replace the file atomically; readers re-read the
//! committed snapshot under the shared lock.

use crate::{
    entity::{Entity, EntityId},
    error::Result,
    events,
    lock::FileLock,
    node::NodeValue,
    signature::Signature,
    utils,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

/// Format marker; bumping it invalidates every existing value file.
const VFILE_FORMAT: &str = "kiln-values-1";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
enum RecordId {
    Entity(EntityId),
    Node(Signature),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum Record {
    Entity(Arc<Entity>),
    Node(NodeValue),
}

impl Record {
    fn id(&self) -> RecordId {
        match self {
            Record::Entity(entity) => RecordId::Entity(entity.id()),
            Record::Node(value) => RecordId::Node(value.name.clone()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct VFileData {
    #[serde(rename = "_format")]
    format: String,
    next_key: u64,
    records: BTreeMap<u64, Record>,
}

impl Default for VFileData {
    fn default() -> Self {
        Self { format: VFILE_FORMAT.to_string(), next_key: 1, records: BTreeMap::new() }
    }
}

/// Durable store of entities and cached node results.
pub struct VFile {
    path: PathBuf,
    lock: FileLock,
    data: VFileData,
    index: HashMap<RecordId, u64>,
}

impl VFile {
    /// Opens (or creates) the value file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        utils::create_parent_dir_all(&path)?;
        let lock = FileLock::sidecar(&path)?;
        let mut vfile =
            Self { path, lock, data: VFileData::default(), index: HashMap::new() };
        vfile.refresh_shared()?;
        Ok(vfile)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.data.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.records.is_empty()
    }

    /// Looks up the stored entity with the probe's id (class + name).
    pub fn find(&mut self, probe: &Entity) -> Result<Option<Arc<Entity>>> {
        self.refresh_shared()?;
        let id = RecordId::Entity(probe.id());
        Ok(match self.index.get(&id).and_then(|key| self.data.records.get(key)) {
            Some(Record::Entity(entity)) => Some(entity.clone()),
            _ => None,
        })
    }

    /// Looks up the cached result for the node key `name`.
    pub fn find_node(&mut self, name: &Signature) -> Result<Option<NodeValue>> {
        self.refresh_shared()?;
        let id = RecordId::Node(name.clone());
        Ok(match self.index.get(&id).and_then(|key| self.data.records.get(key)) {
            Some(Record::Node(value)) => Some(value.clone()),
            _ => None,
        })
    }

    /// Batch fetch by key. Returns `None` if any key is missing.
    pub fn get_values(&mut self, keys: &[u64]) -> Result<Option<Vec<Arc<Entity>>>> {
        self.refresh_shared()?;
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            match self.data.records.get(key) {
                Some(Record::Entity(entity)) => values.push(entity.clone()),
                _ => return Ok(None),
            }
        }
        Ok(Some(values))
    }

    /// Inserts or updates the entity, returning its stable key.
    pub fn add_value(&mut self, entity: Arc<Entity>) -> Result<u64> {
        self.with_exclusive(|data, index| Ok(Self::put(data, index, Record::Entity(entity))))
    }

    /// Batch insert-or-update; one lock acquisition, one atomic write.
    pub fn add_values(&mut self, entities: &[Arc<Entity>]) -> Result<Vec<u64>> {
        self.with_exclusive(|data, index| {
            Ok(entities
                .iter()
                .map(|entity| Self::put(data, index, Record::Entity(entity.clone())))
                .collect())
        })
    }

    /// Inserts or updates the cached result for a node.
    pub fn add_node(&mut self, value: NodeValue) -> Result<u64> {
        self.with_exclusive(|data, index| Ok(Self::put(data, index, Record::Node(value))))
    }

    /// Overwrites the record at `key` in place. The id of the new entity is
    /// expected to match the replaced one; the key stays stable either way.
    pub fn replace_value(&mut self, key: u64, entity: Arc<Entity>) -> Result<()> {
        self.with_exclusive(|data, index| {
            let record = Record::Entity(entity);
            if let Some(old) = data.records.insert(key, record.clone()) {
                index.remove(&old.id());
            }
            index.insert(record.id(), key);
            Ok(())
        })
    }

    /// Removes the given entities by id. Missing records are ignored.
    pub fn remove_values(&mut self, entities: &[Arc<Entity>]) -> Result<()> {
        let ids: Vec<_> = entities.iter().map(|e| RecordId::Entity(e.id())).collect();
        self.remove_ids(&ids)
    }

    /// Removes the cached results for the given node keys. Idempotent.
    pub fn remove_nodes(&mut self, names: &[Signature]) -> Result<()> {
        let ids: Vec<_> = names.iter().cloned().map(RecordId::Node).collect();
        self.remove_ids(&ids)
    }

    fn remove_ids(&mut self, ids: &[RecordId]) -> Result<()> {
        self.with_exclusive(|data, index| {
            for id in ids {
                if let Some(key) = index.remove(id) {
                    data.records.remove(&key);
                }
            }
            Ok(())
        })
    }

    fn put(data: &mut VFileData, index: &mut HashMap<RecordId, u64>, record: Record) -> u64 {
        let id = record.id();
        let key = match index.get(&id) {
            Some(key) => *key,
            None => {
                let key = data.next_key;
                data.next_key += 1;
                index.insert(id, key);
                key
            }
        };
        data.records.insert(key, record);
        key
    }

    /// Re-reads the committed snapshot under the shared lock.
    fn refresh_shared(&mut self) -> Result<()> {
        let guard = self.lock.read()?;
        self.data = Self::load(&self.path);
        self.index = build_index(&self.data);
        drop(guard);
        Ok(())
    }

    /// Runs one logical update under the exclusive lock: reload, mutate,
    /// persist atomically.
    fn with_exclusive<T>(
        &mut self,
        f: impl FnOnce(&mut VFileData, &mut HashMap<RecordId, u64>) -> Result<T>,
    ) -> Result<T> {
        let guard = self.lock.write()?;
        self.data = Self::load(&self.path);
        self.index = build_index(&self.data);
        let result = f(&mut self.data, &mut self.index)?;
        utils::write_json_file(&self.data, &self.path)?;
        drop(guard);
        Ok(result)
    }

    fn load(path: &Path) -> VFileData {
        if !path.exists() {
            return VFileData::default();
        }
        match utils::read_json_file::<VFileData>(path) {
            Ok(data) if data.format == VFILE_FORMAT => data,
            Ok(data) => {
                trace!(path = %path.display(), format = %data.format, "value file format mismatch");
                events::sink().data_file_out_of_sync(path);
                VFileData::default()
            }
            Err(err) => {
                trace!(path = %path.display(), %err, "failed to read value file");
                events::sink().data_file_out_of_sync(path);
                VFileData::default()
            }
        }
    }

}

fn build_index(data: &VFileData) -> HashMap<RecordId, u64> {
    data.records.iter().map(|(key, record)| (record.id(), *key)).collect()
}

impl std::fmt::Debug for VFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VFile")
            .field("path", &self.path)
            .field("records", &self.data.records.len())
            .finish()
    }
}
