//! Partitioned linear-probing hash table with reduce and spill.
//!
//! The slot array is allocated once by [`PartitionedHashTable::initialize`]
//! from a byte budget and split into `num_partitions` equally sized,
//! contiguous slot ranges. A key's hash picks a global slot index; the
//! range containing that index is the key's partition, and probing wraps
//! around inside that range only. Inserting an existing key combines the
//! stored value with the new one through the reduce function.
//!
//! The table never grows. When a new key finds its partition's range full,
//! that partition is written to its spill file. When the table as a whole
//! holds `max_fill_rate` of its slots, the largest partition is spilled.
//! Spilled items come back when the partition is flushed with `consume`.

use std::hash::Hash;
use std::mem::size_of;

use tracing::debug;

use crate::config::ReduceConfig;
use crate::data::Item;
use crate::emitter::Emitter;
use crate::error::{Error, Result};
use crate::spill::SpillFile;
use crate::{calculate_local_range, key_hash, Range};

pub struct PartitionedHashTable<K, V, KE, RF> {
    key_extractor: KE,
    reduce_function: RF,
    config: ReduceConfig,
    num_partitions: usize,

    slots: Vec<Option<(K, V)>>,
    slots_per_partition: usize,
    /// Items held in memory per partition.
    items_per_partition: Vec<usize>,
    num_items: usize,
    /// Items the table may hold before it spills its largest partition.
    limit_items: usize,

    spill_files: Vec<SpillFile>,
    num_spills: usize,
}

/// Where a probe sequence ended.
enum Probe {
    Found(usize),
    Empty(usize),
    Full,
}

impl<K, V, KE, RF> PartitionedHashTable<K, V, KE, RF>
where
    K: Item + Hash + Eq,
    V: Item,
    KE: Fn(&V) -> K,
    RF: Fn(&V, &V) -> V,
{
    pub fn new(
        num_partitions: usize,
        key_extractor: KE,
        reduce_function: RF,
        config: ReduceConfig,
    ) -> Result<Self> {
        if num_partitions == 0 {
            return Err(Error::InvalidParameter("table needs at least one partition".into()));
        }
        config.validate()?;
        Ok(Self {
            key_extractor,
            reduce_function,
            config,
            num_partitions,
            slots: Vec::new(),
            slots_per_partition: 0,
            items_per_partition: vec![0; num_partitions],
            num_items: 0,
            limit_items: 0,
            spill_files: Vec::new(),
            num_spills: 0,
        })
    }

    /// Allocate the slot array for a working set of `limit_memory_bytes`.
    /// Every partition gets at least one slot.
    pub fn initialize(&mut self, limit_memory_bytes: usize) -> Result<()> {
        if self.num_items > 0 || self.spill_files.iter().any(|f| !f.is_empty()) {
            return Err(Error::InvalidParameter(
                "cannot re-initialize a table that holds data".into(),
            ));
        }
        let slot_size = size_of::<Option<(K, V)>>().max(1);
        let num_slots = (limit_memory_bytes / slot_size).max(self.num_partitions);
        self.slots_per_partition = num_slots / self.num_partitions;

        let total_slots = self.slots_per_partition * self.num_partitions;
        self.slots = std::iter::repeat_with(|| None).take(total_slots).collect();
        self.limit_items = ((total_slots as f64 * self.config.max_fill_rate) as usize).max(1);
        self.spill_files = (0..self.num_partitions)
            .map(|id| SpillFile::new(&self.config.spill_dir, id))
            .collect();

        debug!(
            limit_memory_bytes,
            total_slots,
            slots_per_partition = self.slots_per_partition,
            limit_items = self.limit_items,
            "initialized reduce table"
        );
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Key of a value according to the table's key extractor.
    pub fn key_of(&self, value: &V) -> K {
        (self.key_extractor)(value)
    }

    /// Insert a value, keyed by the key extractor. Returns whether the key
    /// was new to the table.
    pub fn insert(&mut self, value: V) -> Result<bool> {
        let key = self.key_of(&value);
        self.insert_pair((key, value))
    }

    /// Insert a pair, reducing into the stored value if the key is present.
    /// Returns whether the key was new to the table.
    pub fn insert_pair(&mut self, (key, value): (K, V)) -> Result<bool> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        let home = self.home_slot(&key);
        let partition_id = home / self.slots_per_partition;

        let mut slot = match self.probe(home, &key) {
            Probe::Found(i) => {
                if let Some((_, stored)) = &mut self.slots[i] {
                    *stored = (self.reduce_function)(&*stored, &value);
                }
                return Ok(false);
            }
            Probe::Empty(i) => Some(i),
            Probe::Full => None,
        };

        if slot.is_none() {
            self.make_room(partition_id)?;
            self.spill_partition(partition_id)?;
        } else if self.num_items >= self.limit_items {
            self.make_room(partition_id)?;
            let victim = self.largest_partition();
            self.spill_partition(victim)?;
            if victim == partition_id {
                slot = None;
            }
        }
        // after spilling this key's own partition its range is empty, and
        // the home slot is the first one a later probe looks at
        let slot = slot.unwrap_or(home);

        self.slots[slot] = Some((key, value));
        self.items_per_partition[partition_id] += 1;
        self.num_items += 1;
        Ok(true)
    }

    fn make_room(&self, partition_id: usize) -> Result<()> {
        if self.config.spill_enabled {
            Ok(())
        } else {
            Err(Error::TableFull {
                partition: partition_id,
            })
        }
    }

    fn home_slot(&self, key: &K) -> usize {
        (key_hash(key) % self.slots.len() as u64) as usize
    }

    fn probe(&self, home: usize, key: &K) -> Probe {
        let partition_id = home / self.slots_per_partition;
        let begin = partition_id * self.slots_per_partition;
        let end = begin + self.slots_per_partition;

        let mut i = home;
        loop {
            match &self.slots[i] {
                Some((k, _)) if k == key => return Probe::Found(i),
                Some(_) => {}
                None => return Probe::Empty(i),
            }
            i += 1;
            if i == end {
                i = begin;
            }
            if i == home {
                return Probe::Full;
            }
        }
    }

    /// Partition holding the most in-memory items; ties go to the lowest id.
    fn largest_partition(&self) -> usize {
        let mut best = 0;
        for (id, &n) in self.items_per_partition.iter().enumerate() {
            if n > self.items_per_partition[best] {
                best = id;
            }
        }
        best
    }

    fn slot_range(&self, partition_id: usize) -> std::ops::Range<usize> {
        let begin = partition_id * self.slots_per_partition;
        begin..begin + self.slots_per_partition
    }

    /// Write a partition's in-memory items to its spill file and free its
    /// slots.
    pub fn spill_partition(&mut self, partition_id: usize) -> Result<()> {
        self.check_partition(partition_id)?;
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        let range = self.slot_range(partition_id);
        let items: Vec<(K, V)> = self.slots[range].iter_mut().filter_map(Option::take).collect();
        self.num_items -= items.len();
        self.items_per_partition[partition_id] = 0;
        self.spill_files[partition_id].append(&items)?;
        self.num_spills += 1;
        debug!(partition = partition_id, items = items.len(), "spilled partition");
        Ok(())
    }

    /// Emit every in-memory item of a partition in slot order and free the
    /// slots. With `consume`, the partition's spilled items follow in spill
    /// order and the spill file is deleted; otherwise they stay on storage.
    pub fn flush_partition<E: Emitter<K, V>>(
        &mut self,
        partition_id: usize,
        consume: bool,
        emitter: &mut E,
    ) -> Result<()> {
        self.check_partition(partition_id)?;
        if !self.is_initialized() {
            return Ok(());
        }
        let range = self.slot_range(partition_id);
        for slot in &mut self.slots[range] {
            if let Some(kv) = slot.take() {
                emitter.emit(partition_id, &kv)?;
            }
        }
        self.num_items -= self.items_per_partition[partition_id];
        self.items_per_partition[partition_id] = 0;

        if consume && self.has_spilled_data_on_partition(partition_id) {
            self.spill_files[partition_id].read(true, |kv: (K, V)| emitter.emit(partition_id, &kv))?;
        }
        Ok(())
    }

    /// Consuming flush of every partition.
    pub fn flush<E: Emitter<K, V>>(&mut self, emitter: &mut E) -> Result<()> {
        for id in 0..self.num_partitions {
            self.flush_partition(id, true, emitter)?;
        }
        Ok(())
    }

    /// Release the slot array and every spill file.
    pub fn dispose(&mut self) -> Result<()> {
        self.slots = Vec::new();
        self.slots_per_partition = 0;
        self.items_per_partition.iter_mut().for_each(|n| *n = 0);
        self.num_items = 0;
        self.limit_items = 0;
        for file in &mut self.spill_files {
            file.remove()?;
        }
        self.spill_files.clear();
        Ok(())
    }

    fn check_partition(&self, partition_id: usize) -> Result<()> {
        if partition_id >= self.num_partitions {
            return Err(Error::InvalidParameter(format!(
                "partition {partition_id} out of {}",
                self.num_partitions
            )));
        }
        Ok(())
    }

    /// Items currently held in memory.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn num_items_in(&self, partition_id: usize) -> usize {
        self.items_per_partition[partition_id]
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn limit_items(&self) -> usize {
        self.limit_items
    }

    /// Number of spills performed since construction.
    pub fn num_spills(&self) -> usize {
        self.num_spills
    }

    pub fn has_spilled_data_on_partition(&self, partition_id: usize) -> bool {
        self.spill_files
            .get(partition_id)
            .is_some_and(|f| !f.is_empty())
    }

    /// Items of a partition waiting on storage.
    pub fn spilled_items(&self, partition_id: usize) -> usize {
        self.spill_files.get(partition_id).map_or(0, SpillFile::num_items)
    }

    /// Interval of global slot indices owned by a partition. A key whose
    /// hash modulo `num_slots` falls in it belongs to the partition.
    pub fn key_range(&self, partition_id: usize) -> Range {
        calculate_local_range(self.slots.len() as u64, self.num_partitions, partition_id)
    }

    /// Partition a key is routed to, once the table is initialized.
    pub fn partition_of_key(&self, key: &K) -> Option<usize> {
        self.is_initialized()
            .then(|| self.home_slot(key) / self.slots_per_partition)
    }

    pub fn config(&self) -> &ReduceConfig {
        &self.config
    }
}
