//! The pre-reduce stage of one worker: local aggregation, then fingerprint
//! exchange, then delivery of every partition to its writer.

use std::fmt;
use std::hash::Hash;

use tracing::debug;

use crate::config::ReduceConfig;
use crate::data::{BlockWriter, Item};
use crate::dedup::{find_global_duplicates, DuplicateSet};
use crate::emitter::PartitionEmitter;
use crate::error::{Error, Result};
use crate::net::Comm;
use crate::table::PartitionedHashTable;
use crate::{key_hash, Range};

/// Callback receiving the global duplicate set once it is known.
pub type DuplicateSink = Box<dyn FnMut(&DuplicateSet) + Send>;

pub struct ReducePreStage<K, V, KE, RF, W> {
    emitter: PartitionEmitter<W>,
    table: PartitionedHashTable<K, V, KE, RF>,
    config: ReduceConfig,
    /// Hash of every key that was new to the table when inserted.
    hashes: Vec<u64>,
    total_inserts: usize,
    unique_inserts: usize,
    duplicates: Option<DuplicateSet>,
    duplicate_sink: Option<DuplicateSink>,
}

impl<K, V, KE, RF, W> ReducePreStage<K, V, KE, RF, W>
where
    K: Item + Hash + Eq,
    V: Item,
    KE: Fn(&V) -> K,
    RF: Fn(&V, &V) -> V,
    W: BlockWriter,
{
    /// A stage with one partition per writer.
    pub fn new(
        key_extractor: KE,
        reduce_function: RF,
        writers: Vec<W>,
        config: ReduceConfig,
    ) -> Result<Self> {
        if writers.is_empty() {
            return Err(Error::InvalidParameter("stage needs at least one writer".into()));
        }
        debug!(emitters = writers.len(), key_mode = ?config.key_mode, "creating reduce pre-stage");
        let table = PartitionedHashTable::new(
            writers.len(),
            key_extractor,
            reduce_function,
            config.clone(),
        )?;
        Ok(Self {
            emitter: PartitionEmitter::new(writers, config.key_mode),
            table,
            config,
            hashes: Vec::new(),
            total_inserts: 0,
            unique_inserts: 0,
            duplicates: None,
            duplicate_sink: None,
        })
    }

    /// Hand the duplicate set to `sink` whenever `flush_all` produces one.
    pub fn with_duplicate_sink(mut self, sink: impl FnMut(&DuplicateSet) + Send + 'static) -> Self {
        self.duplicate_sink = Some(Box::new(sink));
        self
    }

    pub fn initialize(&mut self, limit_memory_bytes: usize) -> Result<()> {
        self.table.initialize(limit_memory_bytes)
    }

    pub fn insert(&mut self, value: V) -> Result<bool> {
        let key = self.table.key_of(&value);
        self.insert_pair((key, value))
    }

    pub fn insert_pair(&mut self, (key, value): (K, V)) -> Result<bool> {
        self.total_inserts += 1;
        let hash = key_hash(&key);
        let new_key = self.table.insert_pair((key, value))?;
        if new_key {
            self.unique_inserts += 1;
            self.hashes.push(hash);
        }
        Ok(new_key)
    }

    /// Find the keys shared with other workers, then flush every partition.
    /// Every worker of the cluster has to call this.
    pub async fn flush_all<C: Comm + ?Sized>(&mut self, comm: &C) -> Result<()> {
        let mut hashes = std::mem::take(&mut self.hashes);
        if self.config.detect_duplicates {
            // a key re-inserted after its partition spilled was recorded twice
            hashes.sort_unstable();
            hashes.dedup();
            let duplicates = find_global_duplicates(
                comm,
                &hashes,
                self.config.fpr_parameter,
                self.config.debug,
            )
            .await?;
            debug!(
                worker = comm.worker_id(),
                uniques = hashes.len(),
                duplicates = duplicates.len(),
                "fingerprint exchange done"
            );
            if let Some(sink) = &mut self.duplicate_sink {
                sink(&duplicates);
            }
            self.duplicates = Some(duplicates);
        }

        for id in 0..self.table.num_partitions() {
            self.flush_partition(id, true)?;
        }
        Ok(())
    }

    /// Emit a partition's items and push them to its writer.
    pub fn flush_partition(&mut self, partition_id: usize, consume: bool) -> Result<()> {
        self.table
            .flush_partition(partition_id, consume, &mut self.emitter)?;
        self.emitter.flush(partition_id)
    }

    /// Close every writer and release the table.
    pub fn close_all(&mut self) -> Result<()> {
        self.emitter.close_all()?;
        self.table.dispose()
    }

    /// Items currently held in memory.
    pub fn num_items(&self) -> usize {
        self.table.num_items()
    }

    pub fn num_partitions(&self) -> usize {
        self.table.num_partitions()
    }

    pub fn key_range(&self, partition_id: usize) -> Range {
        self.table.key_range(partition_id)
    }

    /// The duplicate set of the last `flush_all`, if detection ran.
    pub fn duplicates(&self) -> Option<&DuplicateSet> {
        self.duplicates.as_ref()
    }

    /// Whether a key may also be held by another worker. `None` until the
    /// fingerprint exchange has run.
    pub fn is_possible_duplicate(&self, key: &K) -> Option<bool> {
        self.duplicates
            .as_ref()
            .map(|set| set.is_duplicate_hash(key_hash(key)))
    }

    pub fn emit_stats(&self) -> &[usize] {
        self.emitter.stats()
    }

    pub fn total_inserts(&self) -> usize {
        self.total_inserts
    }

    pub fn unique_inserts(&self) -> usize {
        self.unique_inserts
    }

    pub fn table(&self) -> &PartitionedHashTable<K, V, KE, RF> {
        &self.table
    }
}

impl<K, V, KE, RF, W> fmt::Debug for ReducePreStage<K, V, KE, RF, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReducePreStage")
            .field("total_inserts", &self.total_inserts)
            .field("unique_inserts", &self.unique_inserts)
            .field("duplicates", &self.duplicates.as_ref().map(DuplicateSet::len))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyMode;
    use crate::data::{MemorySink, MemoryWriter};
    use crate::net::LocalComm;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn sinks(n: usize) -> (Vec<MemorySink>, Vec<MemoryWriter>) {
        let sinks: Vec<MemorySink> = (0..n).map(|_| MemorySink::new()).collect();
        let writers = sinks.iter().map(MemorySink::writer).collect();
        (sinks, writers)
    }

    fn drain(sinks: &[MemorySink]) -> Vec<(u64, u64)> {
        let mut all = Vec::new();
        for sink in sinks {
            all.extend(sink.reader().collect::<(u64, u64)>().unwrap());
        }
        all.sort_unstable();
        all
    }

    #[tokio::test]
    async fn end_to_end_sum() {
        let (sinks, writers) = sinks(2);
        let mut stage = ReducePreStage::new(
            |v: &u64| *v,
            |a: &u64, b: &u64| a + b,
            writers,
            ReduceConfig::default(),
        )
        .unwrap();
        stage.initialize(1 << 16).unwrap();

        for (k, v) in [(1, 1), (2, 1), (3, 1), (2, 1)] {
            stage.insert_pair((k, v)).unwrap();
        }
        assert_eq!(stage.num_items(), 3);
        assert_eq!(stage.total_inserts(), 4);
        assert_eq!(stage.unique_inserts(), 3);

        let comm = LocalComm::cluster(1).pop().unwrap();
        stage.flush_all(&comm).await.unwrap();
        assert_eq!(stage.num_items(), 0);
        assert_eq!(drain(&sinks), vec![(1, 1), (2, 2), (3, 1)]);

        // one worker, three distinct keys: only fingerprint collisions count
        let duplicates = stage.duplicates().unwrap();
        assert_eq!(duplicates.params.upper_bound_uniques, 3);
        assert_eq!(stage.emit_stats().iter().sum::<usize>(), 3);

        stage.close_all().unwrap();
        assert!(sinks.iter().all(MemorySink::is_closed));
    }

    #[tokio::test]
    async fn spilled_keys_are_fingerprinted_once() {
        let dir = tempfile::tempdir().unwrap();
        let (sinks, writers) = sinks(1);
        let seen = Arc::new(Mutex::new(None));
        let seen_in_sink = Arc::clone(&seen);
        let mut stage = ReducePreStage::new(
            |v: &u64| *v,
            |a: &u64, b: &u64| a + b,
            writers,
            ReduceConfig::default().with_spill_dir(dir.path()),
        )
        .unwrap()
        .with_duplicate_sink(move |set| {
            *seen_in_sink.lock().unwrap() = Some(set.params.upper_bound_uniques);
        });
        stage.initialize(8 * std::mem::size_of::<Option<(u64, u64)>>()).unwrap();

        for round in 0..4 {
            for k in 0..20u64 {
                stage.insert_pair((k, round)).unwrap();
            }
        }
        assert!(stage.table().num_spills() > 0);
        assert!(stage.unique_inserts() > 20);

        let comm = LocalComm::cluster(1).pop().unwrap();
        stage.flush_all(&comm).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(20));
        assert!(stage.duplicates().unwrap().len() <= 20);

        let mut totals: HashMap<u64, u64> = HashMap::new();
        for (k, v) in drain(&sinks) {
            *totals.entry(k).or_default() += v;
        }
        assert_eq!(totals.len(), 20);
        assert!(totals.values().all(|&v| v == 6));
        stage.close_all().unwrap();
    }

    #[tokio::test]
    async fn robust_keys_emit_values() {
        let (sinks, writers) = sinks(1);
        let mut stage = ReducePreStage::new(
            |v: &(String, u64)| v.0.clone(),
            |a: &(String, u64), b: &(String, u64)| (a.0.clone(), a.1 + b.1),
            writers,
            ReduceConfig::default()
                .with_key_mode(KeyMode::Robust)
                .with_duplicate_detection(false),
        )
        .unwrap();
        stage.initialize(1 << 14).unwrap();
        stage.insert(("a".to_string(), 1)).unwrap();
        stage.insert(("b".to_string(), 1)).unwrap();
        stage.insert(("a".to_string(), 4)).unwrap();

        let comm = LocalComm::cluster(1).pop().unwrap();
        stage.flush_all(&comm).await.unwrap();
        assert!(stage.duplicates().is_none());
        assert_eq!(stage.is_possible_duplicate(&"a".to_string()), None);

        let mut values = sinks[0].reader().collect::<(String, u64)>().unwrap();
        values.sort();
        assert_eq!(values, vec![("a".into(), 5), ("b".into(), 1)]);
    }

    #[test]
    fn writers_required() {
        let result = ReducePreStage::new(
            |v: &u64| *v,
            |a: &u64, b: &u64| a + b,
            Vec::<MemoryWriter>::new(),
            ReduceConfig::default(),
        );
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn partition_flush_without_consume() {
        let (sinks, writers) = sinks(1);
        let mut stage = ReducePreStage::new(
            |v: &u64| *v,
            |a: &u64, b: &u64| a + b,
            writers,
            ReduceConfig::default(),
        )
        .unwrap();
        stage.initialize(1 << 12).unwrap();
        stage.insert_pair((4, 4)).unwrap();
        stage.flush_partition(0, false).unwrap();
        assert_eq!(drain(&sinks), vec![(4, 4)]);
        assert_eq!(stage.num_items(), 0);
        assert_eq!(sinks[0].num_flushes(), 1);
    }
}
