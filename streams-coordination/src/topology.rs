use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::TaskId;

/// Broker-side metadata for an input topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub name: String,
    pub partition_count: u32,
    pub replication_factor: u16,
}

/// A state store attached to one or more subtopologies.
///
/// Only `logging_enabled` matters here: a store without a changelog cannot be
/// rebuilt on another worker, so it can never back a standby.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSpec {
    pub name: String,
    pub logging_enabled: bool,
}

impl StoreSpec {
    pub fn logged(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logging_enabled: true,
        }
    }

    pub fn unlogged(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logging_enabled: false,
        }
    }
}

/// A group of processors reading the same source topics and sharing stores.
/// Stores are referenced by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtopology {
    pub id: u32,
    pub source_topics: Vec<String>,
    #[serde(default)]
    pub stores: Vec<String>,
}

/// One unit of work: a partition of a subtopology together with its stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub id: TaskId,
    pub stores: Vec<StoreSpec>,
}

impl SubtaskSpec {
    pub fn is_stateful(&self) -> bool {
        !self.stores.is_empty()
    }

    /// Standbys only make sense when there is state to copy and all of it is
    /// backed by a changelog. A single unlogged store disqualifies the task.
    pub fn is_replicable(&self) -> bool {
        self.is_stateful() && self.stores.iter().all(|s| s.logging_enabled)
    }
}

/// Serialized form of a topology, as read from a topology file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyDefinition {
    pub topics: Vec<TopicMetadata>,
    #[serde(default)]
    pub stores: Vec<StoreSpec>,
    pub subtopologies: Vec<Subtopology>,
}

/// Immutable description of every subtask the cluster has to run.
///
/// Built once, validated up front, then shared behind an `Arc` by every
/// epoch that uses it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopologyDescriptor {
    subtasks: BTreeMap<TaskId, SubtaskSpec>,
}

impl TopologyDescriptor {
    pub fn new(
        topics: &[TopicMetadata],
        stores: &[StoreSpec],
        subtopologies: &[Subtopology],
    ) -> Result<Self> {
        let mut store_index: HashMap<&str, &StoreSpec> = HashMap::with_capacity(stores.len());
        for store in stores {
            if store_index.insert(store.name.as_str(), store).is_some() {
                return Err(Error::configuration(format!(
                    "store {} is defined more than once",
                    store.name
                )));
            }
        }

        let topic_index: HashMap<&str, &TopicMetadata> =
            topics.iter().map(|t| (t.name.as_str(), t)).collect();

        let mut seen_ids = HashSet::new();
        let mut subtasks = BTreeMap::new();

        for sub in subtopologies {
            if !seen_ids.insert(sub.id) {
                return Err(Error::configuration(format!(
                    "subtopology {} is defined more than once",
                    sub.id
                )));
            }
            if sub.source_topics.is_empty() {
                return Err(Error::configuration(format!(
                    "subtopology {} has no source topics",
                    sub.id
                )));
            }

            let attached: Vec<StoreSpec> = sub
                .stores
                .iter()
                .map(|name| {
                    store_index
                        .get(name.as_str())
                        .map(|s| (*s).clone())
                        .ok_or_else(|| {
                            Error::configuration(format!(
                                "subtopology {} references undefined store {name}",
                                sub.id
                            ))
                        })
                })
                .collect::<Result<_>>()?;

            let mut partitions = 0;
            for topic in &sub.source_topics {
                let meta = topic_index.get(topic.as_str()).ok_or_else(|| {
                    Error::configuration(format!(
                        "subtopology {} reads from unknown topic {topic}",
                        sub.id
                    ))
                })?;
                partitions = partitions.max(meta.partition_count);
            }

            for partition in 0..partitions {
                let id = TaskId::new(sub.id, partition);
                subtasks.insert(
                    id,
                    SubtaskSpec {
                        id,
                        stores: attached.clone(),
                    },
                );
            }
        }

        Ok(Self { subtasks })
    }

    pub fn from_definition(def: &TopologyDefinition) -> Result<Self> {
        Self::new(&def.topics, &def.stores, &def.subtopologies)
    }

    /// Build directly from already-derived subtasks.
    pub fn from_subtasks(specs: impl IntoIterator<Item = SubtaskSpec>) -> Result<Self> {
        let mut subtasks = BTreeMap::new();
        for spec in specs {
            let id = spec.id;
            if subtasks.insert(id, spec).is_some() {
                return Err(Error::configuration(format!(
                    "subtask {id} is defined more than once"
                )));
            }
        }
        Ok(Self { subtasks })
    }

    /// Subtasks in `TaskId` order.
    pub fn subtasks(&self) -> impl Iterator<Item = &SubtaskSpec> {
        self.subtasks.values()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.subtasks.keys()
    }

    pub fn subtask(&self, id: &TaskId) -> Option<&SubtaskSpec> {
        self.subtasks.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.subtasks.contains_key(id)
    }

    pub fn is_replicable(&self, id: &TaskId) -> bool {
        self.subtasks.get(id).is_some_and(SubtaskSpec::is_replicable)
    }

    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }
}
