//! The transport boundary: an all-reduce and all-to-all byte streams.
//!
//! A [`CatStream`] gives every worker one [`StreamWriter`] per destination
//! and a single [`CatReader`] that yields what every source sent to it,
//! source by source in worker order. A source's data ends when its writer
//! is closed (or dropped). Streams are matched up across workers by
//! creation order, so all workers must create their streams in the same
//! sequence.
//!
//! [`LocalComm`] wires workers of one process together over tokio
//! channels. A network transport plugs in by feeding received chunks into
//! the same channel ends.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Barrier;
use tracing::trace;

use crate::data::{BlockWriter, Item};
use crate::error::{Error, Result};

/// Collective operations a worker can perform with its peers.
#[async_trait]
pub trait Comm: Send + Sync {
    fn worker_id(&self) -> usize;

    fn num_workers(&self) -> usize;

    /// Sum `value` over all workers. Every worker receives the same result.
    async fn all_reduce(&self, value: u64) -> Result<u64>;

    /// Open the next all-to-all stream.
    fn new_cat_stream(&self) -> Result<CatStream>;
}

/// One worker's end of an all-to-all stream.
#[derive(Debug)]
pub struct CatStream {
    id: usize,
    writers: Vec<StreamWriter>,
    sources: Vec<UnboundedReceiver<Bytes>>,
}

impl CatStream {
    /// Assemble a stream from one sender per destination and one receiver
    /// per source, both indexed by worker id.
    pub fn new(
        id: usize,
        destinations: Vec<UnboundedSender<Bytes>>,
        sources: Vec<UnboundedReceiver<Bytes>>,
    ) -> Self {
        Self {
            id,
            writers: destinations.into_iter().map(StreamWriter::new).collect(),
            sources,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The writers, one per destination worker. Can only be taken once.
    pub fn writers(&mut self) -> Vec<StreamWriter> {
        std::mem::take(&mut self.writers)
    }

    /// The merged reader over every source. Can only be taken once.
    pub fn cat_reader(&mut self) -> CatReader {
        CatReader {
            sources: std::mem::take(&mut self.sources).into(),
            current: Bytes::new(),
        }
    }
}

/// Buffered writer towards one destination.
#[derive(Debug)]
pub struct StreamWriter {
    sender: Option<UnboundedSender<Bytes>>,
    buffer: BytesMut,
    bytes_sent: usize,
}

impl StreamWriter {
    fn new(sender: UnboundedSender<Bytes>) -> Self {
        Self {
            sender: Some(sender),
            buffer: BytesMut::new(),
            bytes_sent: 0,
        }
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_none()
    }
}

impl BlockWriter for StreamWriter {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.sender.is_none() {
            return Err(Error::WriterClosed);
        }
        self.buffer.put_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(Error::WriterClosed)?;
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = self.buffer.split().freeze();
        self.bytes_sent += chunk.len();
        sender
            .send(chunk)
            .map_err(|_| Error::Other(anyhow::anyhow!("stream receiver dropped")))
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.sender = None;
        Ok(())
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if self.sender.is_some() {
            // receivers may be gone already during teardown
            let _ = self.flush();
        }
    }
}

/// Reads the concatenation of all sources of a stream.
#[derive(Debug)]
pub struct CatReader {
    sources: VecDeque<UnboundedReceiver<Bytes>>,
    current: Bytes,
}

impl CatReader {
    /// Append the next chunk of the current source to the unread bytes.
    /// A source that ends between items is skipped; one that ends with
    /// unread bytes pending broke off in the middle of an item.
    async fn pull(&mut self) -> Result<bool> {
        loop {
            let Some(source) = self.sources.front_mut() else {
                return Ok(false);
            };
            match source.recv().await {
                Some(chunk) if self.current.is_empty() => {
                    self.current = chunk;
                    return Ok(true);
                }
                Some(chunk) => {
                    let mut merged = BytesMut::with_capacity(self.current.len() + chunk.len());
                    merged.put(self.current.split_off(0));
                    merged.put(chunk);
                    self.current = merged.freeze();
                    return Ok(true);
                }
                None if self.current.is_empty() => {
                    self.sources.pop_front();
                }
                None => {
                    return Err(Error::StreamClosed {
                        missing: self.current.len(),
                    })
                }
            }
        }
    }

    /// Whether another item can be read.
    pub async fn has_next(&mut self) -> Result<bool> {
        while self.current.is_empty() {
            if !self.pull().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Read and decode the next item, waiting for more data as needed.
    pub async fn next<T: Item>(&mut self) -> Result<T> {
        loop {
            if !self.current.is_empty() {
                let mut view = self.current.clone();
                match T::decode(&mut view) {
                    Ok(item) => {
                        let used = self.current.len() - view.remaining();
                        self.current.advance(used);
                        return Ok(item);
                    }
                    Err(Error::Truncated { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            if !self.pull().await? {
                return Err(Error::StreamClosed {
                    missing: T::FIXED_SIZE.unwrap_or(1),
                });
            }
        }
    }

    /// Read exactly `len` raw bytes.
    pub async fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        while self.current.len() < len {
            if !self.pull().await? {
                return Err(Error::StreamClosed {
                    missing: len - self.current.len(),
                });
            }
        }
        Ok(self.current.split_to(len))
    }
}

/////////////////////////////////////////////////////////////////////////////
// In-process cluster
/////////////////////////////////////////////////////////////////////////////

struct StreamSlots {
    /// `senders[src][dst]`
    senders: Vec<Vec<Option<UnboundedSender<Bytes>>>>,
    /// `receivers[dst][src]`
    receivers: Vec<Vec<Option<UnboundedReceiver<Bytes>>>>,
    claimed: usize,
}

impl StreamSlots {
    fn new(num_workers: usize) -> Self {
        let mut senders: Vec<Vec<_>> = (0..num_workers).map(|_| Vec::new()).collect();
        let mut receivers: Vec<Vec<_>> = (0..num_workers)
            .map(|_| (0..num_workers).map(|_| None).collect())
            .collect();
        for (src, row) in senders.iter_mut().enumerate() {
            for receiver_row in receivers.iter_mut() {
                let (tx, rx) = unbounded_channel();
                row.push(Some(tx));
                receiver_row[src] = Some(rx);
            }
        }
        Self {
            senders,
            receivers,
            claimed: 0,
        }
    }
}

struct Shared {
    num_workers: usize,
    streams: Mutex<HashMap<usize, StreamSlots>>,
    reductions: Mutex<HashMap<usize, u64>>,
    barrier: Barrier,
}

/// A worker's handle into an in-process cluster.
pub struct LocalComm {
    worker_id: usize,
    shared: Arc<Shared>,
    next_stream: AtomicUsize,
    next_reduction: AtomicUsize,
}

impl LocalComm {
    /// Handles for `num_workers` connected workers, indexed by worker id.
    pub fn cluster(num_workers: usize) -> Vec<LocalComm> {
        assert!(num_workers > 0, "a cluster needs at least one worker");
        let shared = Arc::new(Shared {
            num_workers,
            streams: Mutex::new(HashMap::new()),
            reductions: Mutex::new(HashMap::new()),
            barrier: Barrier::new(num_workers),
        });
        (0..num_workers)
            .map(|worker_id| LocalComm {
                worker_id,
                shared: Arc::clone(&shared),
                next_stream: AtomicUsize::new(0),
                next_reduction: AtomicUsize::new(0),
            })
            .collect()
    }
}

#[async_trait]
impl Comm for LocalComm {
    fn worker_id(&self) -> usize {
        self.worker_id
    }

    fn num_workers(&self) -> usize {
        self.shared.num_workers
    }

    async fn all_reduce(&self, value: u64) -> Result<u64> {
        let round = self.next_reduction.fetch_add(1, Ordering::Relaxed);
        {
            let mut reductions = self
                .shared
                .reductions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let sum = reductions.entry(round).or_insert(0);
            *sum = sum.saturating_add(value);
        }
        self.shared.barrier.wait().await;
        let sum = self
            .shared
            .reductions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&round)
            .copied()
            .unwrap_or(0);
        // nobody may drop the round before everyone has read it
        if self.shared.barrier.wait().await.is_leader() {
            self.shared
                .reductions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&round);
        }
        trace!(worker = self.worker_id, round, value, sum, "all-reduce");
        Ok(sum)
    }

    fn new_cat_stream(&self) -> Result<CatStream> {
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let me = self.worker_id;
        let num_workers = self.shared.num_workers;

        let mut streams = self
            .shared
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let slots = streams
            .entry(id)
            .or_insert_with(|| StreamSlots::new(num_workers));
        let destinations = slots.senders[me]
            .iter_mut()
            .map(Option::take)
            .collect::<Option<Vec<_>>>();
        let sources = slots.receivers[me]
            .iter_mut()
            .map(Option::take)
            .collect::<Option<Vec<_>>>();
        let (Some(destinations), Some(sources)) = (destinations, sources) else {
            return Err(Error::InvalidParameter(format!(
                "worker {me} opened stream {id} twice"
            )));
        };
        slots.claimed += 1;
        if slots.claimed == num_workers {
            streams.remove(&id);
        }
        Ok(CatStream::new(id, destinations, sources))
    }
}
