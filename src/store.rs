//! Run-scoped, write-once result storage.
//!
//! Every `(producer, key)` slot a graph declares is allocated up front, so the
//! store itself never changes shape during a run. A slot is a [`OnceLock`]:
//! the first publish wins, any later one is refused, and readers never take a
//! lock once the value is there. Reads are checked against the consumer's
//! input bindings, which keeps one task from peeking at results it never
//! declared.

use std::any::type_name;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::core::Dynamic;
use crate::error::StoreError;
use crate::graph::{Graph, ResultKey, TaskId};

#[derive(Debug, Default)]
struct Slots {
    keys: HashMap<ResultKey, OnceLock<Dynamic>>,
}

/// Results published by the nodes of one run.
#[derive(Debug)]
pub struct ResultStore {
    slots: HashMap<TaskId, Slots>,
    /// For each consumer, the producers its bindings may read.
    readable: HashMap<TaskId, HashSet<TaskId>>,
}

impl ResultStore {
    /// Allocates an empty slot for every result `graph` declares.
    pub fn for_graph(graph: &Graph) -> Self {
        let mut slots = HashMap::new();
        let mut readable = HashMap::new();

        for node in graph.nodes() {
            let keys = node
                .outputs()
                .iter()
                .map(|key| (key.clone(), OnceLock::new()))
                .collect();
            slots.insert(node.id(), Slots { keys });

            let producers = node
                .bindings()
                .values()
                .flat_map(|binding| binding.producers().iter().copied())
                .collect();
            readable.insert(node.id(), producers);
        }

        Self { slots, readable }
    }

    fn slot(&self, producer: TaskId, key: &ResultKey) -> Result<&OnceLock<Dynamic>, StoreError> {
        self.slots
            .get(&producer)
            .ok_or(StoreError::UnknownTask(producer))?
            .keys
            .get(key)
            .ok_or_else(|| StoreError::UndeclaredKey {
                producer,
                key: key.clone(),
            })
    }

    /// Publishes `value` under `(producer, key)`. Succeeds at most once per
    /// slot.
    pub fn publish(&self, producer: TaskId, key: &ResultKey, value: Dynamic) -> Result<(), StoreError> {
        self.slot(producer, key)?
            .set(value)
            .map_err(|_| StoreError::AlreadyPublished {
                producer,
                key: key.clone(),
            })
    }

    pub fn is_published(&self, producer: TaskId, key: &ResultKey) -> bool {
        self.slot(producer, key)
            .is_ok_and(|slot| slot.get().is_some())
    }

    /// Reads `(producer, key)` on behalf of `consumer`.
    pub fn fetch(&self, consumer: TaskId, producer: TaskId, key: &ResultKey) -> Result<Dynamic, StoreError> {
        let bound = self
            .readable
            .get(&consumer)
            .ok_or(StoreError::UnknownTask(consumer))?;

        if !bound.contains(&producer) {
            return Err(StoreError::NotBound { consumer, producer });
        }

        self.slot(producer, key)?
            .get()
            .cloned()
            .ok_or_else(|| StoreError::NotPublished {
                producer,
                key: key.clone(),
            })
    }

    /// Reads `key` from several producers, keeping their order.
    pub fn fetch_all(
        &self,
        consumer: TaskId,
        producers: &[TaskId],
        key: &ResultKey,
    ) -> Result<Vec<Dynamic>, StoreError> {
        producers
            .iter()
            .map(|&producer| self.fetch(consumer, producer, key))
            .collect()
    }

    /// Reads `(producer, key)` as a `T` without binding checks.
    ///
    /// Reserved for the owner of the run, which needs to look at a result to
    /// decide what happens next.
    pub(crate) fn peek<T: 'static>(&self, producer: TaskId, key: &ResultKey) -> Result<&T, StoreError> {
        let value = self
            .slot(producer, key)?
            .get()
            .ok_or_else(|| StoreError::NotPublished {
                producer,
                key: key.clone(),
            })?;

        value.downcast_ref::<T>().ok_or_else(|| StoreError::TypeMismatch {
            producer,
            key: key.clone(),
            expected: type_name::<T>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;

    use super::*;
    use crate::area::{AreaConfig, DateRange};
    use crate::blueprint::build;
    use crate::config::ProcessingOptions;
    use crate::graph::Role;

    fn graph() -> Graph {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        );
        let area = AreaConfig::new("store", [(37, 17)], [4, 5], range);
        build(&area, &ProcessingOptions::default()).unwrap()
    }

    #[test]
    fn test_publish_then_fetch() {
        let graph = graph();
        let store = ResultStore::for_graph(&graph);
        let search = graph.entry();
        let fetch = graph.find(Role::FetchBand, Some(4)).unwrap().id();

        store
            .publish(search, &ResultKey::RESULT, Arc::new(vec![1_u32, 2, 3]))
            .unwrap();

        let value = store.fetch(fetch, search, &ResultKey::RESULT).unwrap();
        assert_eq!(value.downcast_ref::<Vec<u32>>(), Some(&vec![1, 2, 3]));
        assert!(store.is_published(search, &ResultKey::RESULT));
    }

    #[test]
    fn test_second_publish_is_refused() {
        let graph = graph();
        let store = ResultStore::for_graph(&graph);
        let search = graph.entry();

        store.publish(search, &ResultKey::RESULT, Arc::new(1_u8)).unwrap();
        let err = store
            .publish(search, &ResultKey::RESULT, Arc::new(2_u8))
            .unwrap_err();

        assert!(matches!(err, StoreError::AlreadyPublished { .. }));
        assert_eq!(store.peek::<u8>(search, &ResultKey::RESULT).unwrap(), &1);
    }

    #[test]
    fn test_fetch_requires_binding() {
        let graph = graph();
        let store = ResultStore::for_graph(&graph);
        let fetch4 = graph.find(Role::FetchBand, Some(4)).unwrap().id();
        let translate5 = graph.find(Role::TranslateBand, Some(5)).unwrap().id();

        store.publish(fetch4, &ResultKey::RESULT, Arc::new(())).unwrap();
        let err = store.fetch(translate5, fetch4, &ResultKey::RESULT).unwrap_err();

        assert!(matches!(err, StoreError::NotBound { .. }));
    }

    #[test]
    fn test_fetch_before_publish() {
        let graph = graph();
        let store = ResultStore::for_graph(&graph);
        let search = graph.entry();
        let thumb = graph.find(Role::FetchThumbnail, None).unwrap().id();

        let err = store.fetch(thumb, search, &ResultKey::RESULT).unwrap_err();
        assert!(matches!(err, StoreError::NotPublished { .. }));
    }

    #[test]
    fn test_join_declares_no_result() {
        let graph = graph();
        let store = ResultStore::for_graph(&graph);
        let join = graph.find(Role::Join, None).unwrap().id();

        let err = store.publish(join, &ResultKey::RESULT, Arc::new(())).unwrap_err();
        assert!(matches!(err, StoreError::UndeclaredKey { .. }));
    }

    #[test]
    fn test_fetch_all_keeps_binding_order() {
        let graph = graph();
        let store = ResultStore::for_graph(&graph);
        let uploads: Vec<TaskId> = [5, 4]
            .into_iter()
            .map(|band| graph.find(Role::UploadBand, Some(band)).unwrap().id())
            .collect();
        let assemble = graph.find(Role::AssembleMetadata, None).unwrap().id();

        store.publish(uploads[0], &ResultKey::RESULT, Arc::new(5_u8)).unwrap();
        store.publish(uploads[1], &ResultKey::RESULT, Arc::new(4_u8)).unwrap();

        let values = store.fetch_all(assemble, &uploads, &ResultKey::RESULT).unwrap();
        let bands: Vec<u8> = values
            .iter()
            .map(|v| *v.downcast_ref::<u8>().unwrap())
            .collect();
        assert_eq!(bands, vec![5, 4]);
    }

    #[test]
    fn test_peek_checks_type() {
        let graph = graph();
        let store = ResultStore::for_graph(&graph);
        let search = graph.entry();

        store.publish(search, &ResultKey::RESULT, Arc::new(1_u8)).unwrap();
        assert!(matches!(
            store.peek::<String>(search, &ResultKey::RESULT),
            Err(StoreError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_concurrent_publish_has_single_winner() {
        let graph = graph();
        let store = ResultStore::for_graph(&graph);
        let search = graph.entry();

        let wins = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8_u8)
                .map(|i| {
                    let store = &store;
                    s.spawn(move || store.publish(search, &ResultKey::RESULT, Arc::new(i)).is_ok())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|&won| won)
                .count()
        });

        assert_eq!(wins, 1);
    }
}
