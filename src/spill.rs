//! Spill storage for a single table partition.
//!
//! Every spill of a partition becomes one parquet segment with a binary
//! `key` column and a binary `value` column holding the serialized items.
//! Segments are read back in the order they were written, so a partition's
//! spilled items come back in insertion order.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BinaryArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::data::{to_bytes, Item};
use crate::error::{Error, Result};

fn spill_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Binary, false),
        Field::new("value", DataType::Binary, false),
    ]))
}

fn binary_column(values: &[Bytes]) -> ArrayRef {
    let slices: Vec<&[u8]> = values.iter().map(|b| b.as_ref()).collect();
    Arc::new(BinaryArray::from(slices))
}

fn column<'a>(batch: &'a RecordBatch, index: usize) -> Result<&'a BinaryArray> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<BinaryArray>()
        .ok_or_else(|| Error::Decode(format!("spill column {index} is not binary")))
}

/// Append-only spill file of one partition, created lazily on first append.
#[derive(Debug)]
pub struct SpillFile {
    dir: PathBuf,
    partition_id: usize,
    segments: Vec<PathBuf>,
    num_items: usize,
}

impl SpillFile {
    pub fn new(dir: impl AsRef<Path>, partition_id: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            partition_id,
            segments: Vec::new(),
            num_items: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_items == 0
    }

    /// Items currently on storage.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[PathBuf] {
        &self.segments
    }

    /// Write `items` as a new segment.
    pub fn append<K: Item, V: Item>(&mut self, items: &[(K, V)]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let keys: Vec<Bytes> = items.iter().map(|(k, _)| to_bytes(k)).collect();
        let values: Vec<Bytes> = items.iter().map(|(_, v)| to_bytes(v)).collect();
        let batch = RecordBatch::try_new(
            spill_schema(),
            vec![binary_column(&keys), binary_column(&values)],
        )?;

        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!(
            "prereduce-p{}-{}.parquet",
            self.partition_id,
            Uuid::new_v4()
        ));
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(File::create(&path)?, batch.schema(), Some(props))?;
        writer.write(&batch)?;
        // the footer is only written on close
        writer.close()?;

        debug!(
            partition = self.partition_id,
            items = items.len(),
            path = %path.display(),
            "spilled partition segment"
        );
        self.segments.push(path);
        self.num_items += items.len();
        Ok(())
    }

    /// Hand every stored item to `sink` in write order. With `consume` the
    /// segments are deleted once all of them have been read.
    pub fn read<K, V, F>(&mut self, consume: bool, mut sink: F) -> Result<()>
    where
        K: Item,
        V: Item,
        F: FnMut((K, V)) -> Result<()>,
    {
        for path in &self.segments {
            let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?.build()?;
            for batch in reader {
                let batch = batch?;
                let keys = column(&batch, 0)?;
                let values = column(&batch, 1)?;
                for i in 0..batch.num_rows() {
                    let key = K::decode(&mut keys.value(i))?;
                    let value = V::decode(&mut values.value(i))?;
                    sink((key, value))?;
                }
            }
        }
        if consume {
            self.remove()?;
        }
        Ok(())
    }

    /// Collect every stored item without consuming.
    pub fn read_all<K: Item, V: Item>(&mut self) -> Result<Vec<(K, V)>> {
        let mut out = Vec::with_capacity(self.num_items);
        self.read(false, |kv| {
            out.push(kv);
            Ok(())
        })?;
        Ok(out)
    }

    /// Delete every segment.
    pub fn remove(&mut self) -> Result<()> {
        for path in self.segments.drain(..) {
            fs::remove_file(&path)?;
        }
        self.num_items = 0;
        Ok(())
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        for path in &self.segments {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove spill segment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_read_back_in_write_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = SpillFile::new(dir.path(), 3);
        assert!(file.is_empty());

        file.append(&[(1u64, String::from("one")), (2, "two".into())]).unwrap();
        file.append::<u64, String>(&[]).unwrap();
        file.append(&[(3u64, String::from("three"))]).unwrap();
        assert_eq!(file.num_segments(), 2);
        assert_eq!(file.num_items(), 3);

        let items: Vec<(u64, String)> = file.read_all().unwrap();
        assert_eq!(
            items,
            vec![(1, "one".into()), (2, "two".into()), (3, "three".into())]
        );
        assert_eq!(file.num_items(), 3, "non-consuming read keeps data");
    }

    #[test]
    fn consuming_read_deletes_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = SpillFile::new(dir.path(), 0);
        file.append(&[(7i64, 70i64)]).unwrap();
        let paths = file.segments().to_vec();
        assert!(paths.iter().all(|p| p.exists()));

        let mut seen = Vec::new();
        file.read(true, |kv: (i64, i64)| {
            seen.push(kv);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(7, 70)]);
        assert!(file.is_empty());
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[test]
    fn drop_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let paths = {
            let mut file = SpillFile::new(dir.path(), 1);
            file.append(&[(1u32, 1u32)]).unwrap();
            file.segments().to_vec()
        };
        assert!(paths.iter().all(|p| !p.exists()));
    }
}
