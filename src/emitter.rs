//! Delivery of reduced pairs to per-partition writers.

use tracing::{debug, info};

use crate::config::KeyMode;
use crate::data::{BlockWriter, Item};
use crate::error::{Error, Result};

/// Receives the pairs a table flushes, tagged with their partition.
pub trait Emitter<K, V> {
    fn emit(&mut self, partition_id: usize, pair: &(K, V)) -> Result<()>;
}

impl<K, V, E: Emitter<K, V> + ?Sized> Emitter<K, V> for &mut E {
    fn emit(&mut self, partition_id: usize, pair: &(K, V)) -> Result<()> {
        (**self).emit(partition_id, pair)
    }
}

/// One writer per partition. Depending on the [`KeyMode`] each pair is
/// written whole or as its value alone.
#[derive(Debug)]
pub struct PartitionEmitter<W> {
    writers: Vec<W>,
    stats: Vec<usize>,
    key_mode: KeyMode,
    closed: bool,
}

impl<W: BlockWriter> PartitionEmitter<W> {
    pub fn new(writers: Vec<W>, key_mode: KeyMode) -> Self {
        let stats = vec![0; writers.len()];
        Self {
            writers,
            stats,
            key_mode,
            closed: false,
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.writers.len()
    }

    pub fn key_mode(&self) -> KeyMode {
        self.key_mode
    }

    /// Items emitted per partition so far.
    pub fn stats(&self) -> &[usize] {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn writer(&mut self, partition_id: usize) -> Result<&mut W> {
        if self.closed {
            return Err(Error::EmitterClosed);
        }
        let num_partitions = self.writers.len();
        self.writers.get_mut(partition_id).ok_or_else(|| {
            Error::InvalidParameter(format!(
                "partition {partition_id} out of {num_partitions}"
            ))
        })
    }

    /// Serialize one pair into its partition's writer.
    pub fn emit_pair<K: Item, V: Item>(&mut self, partition_id: usize, pair: &(K, V)) -> Result<()> {
        let key_mode = self.key_mode;
        let writer = self.writer(partition_id)?;
        match key_mode {
            KeyMode::Volatile => writer.put(pair)?,
            KeyMode::Robust => writer.put(&pair.1)?,
        }
        self.stats[partition_id] += 1;
        Ok(())
    }

    /// Push a partition's buffered bytes to its stream.
    pub fn flush(&mut self, partition_id: usize) -> Result<()> {
        self.writer(partition_id)?.flush()
    }

    /// Close every writer. Emitting afterwards is an error.
    pub fn close_all(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::EmitterClosed);
        }
        self.closed = true;
        for (i, writer) in self.writers.iter_mut().enumerate() {
            writer.close()?;
            debug!(partition = i, pushed = self.stats[i], "closed partition writer");
        }
        info!(
            partitions = self.writers.len(),
            emitted = self.stats.iter().sum::<usize>(),
            "emit stats: {:?}",
            self.stats
        );
        Ok(())
    }
}

impl<K: Item, V: Item, W: BlockWriter> Emitter<K, V> for PartitionEmitter<W> {
    fn emit(&mut self, partition_id: usize, pair: &(K, V)) -> Result<()> {
        self.emit_pair(partition_id, pair)
    }
}

/// Forwards every pair to each of its emitters in turn.
#[derive(Debug, Default)]
pub struct FanOut<E> {
    emitters: Vec<E>,
}

impl<E> FanOut<E> {
    pub fn new(emitters: Vec<E>) -> Self {
        Self { emitters }
    }

    pub fn emitters(&self) -> &[E] {
        &self.emitters
    }

    pub fn into_inner(self) -> Vec<E> {
        self.emitters
    }
}

impl<K, V, E: Emitter<K, V>> Emitter<K, V> for FanOut<E> {
    fn emit(&mut self, partition_id: usize, pair: &(K, V)) -> Result<()> {
        for emitter in &mut self.emitters {
            emitter.emit(partition_id, pair)?;
        }
        Ok(())
    }
}

/// Keeps every emitted pair in memory.
#[derive(Debug)]
pub struct CollectEmitter<K, V> {
    pub items: Vec<(usize, (K, V))>,
}

impl<K, V> Default for CollectEmitter<K, V> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<K, V> CollectEmitter<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Emitted pairs without their partition ids.
    pub fn pairs(&self) -> impl Iterator<Item = &(K, V)> {
        self.items.iter().map(|(_, kv)| kv)
    }
}

impl<K: Clone, V: Clone> Emitter<K, V> for CollectEmitter<K, V> {
    fn emit(&mut self, partition_id: usize, pair: &(K, V)) -> Result<()> {
        self.items.push((partition_id, pair.clone()));
        Ok(())
    }
}
