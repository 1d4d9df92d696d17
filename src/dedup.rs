//! Cross-worker detection of keys held by more than one worker.
//!
//! Rather than shuffling reduced pairs a second time, every worker projects
//! the hashes of its unique keys onto a small fingerprint space and the
//! workers exchange the sorted fingerprints as Golomb-Rice coded blocks:
//!
//! 1. An all-reduce of the local unique-key counts fixes the code parameter,
//!    the fingerprint space `[0, max_hash)` and the block size bound. Every
//!    worker derives the same values from the same sum.
//! 2. The fingerprint space is cut into one contiguous range per worker.
//!    Each worker sends the fingerprints falling into a range to its owner.
//! 3. Each owner merges what it received; every fingerprint seen at least
//!    twice is a duplicate.
//! 4. Each owner broadcasts its duplicates, so every worker ends up with the
//!    full sorted duplicate set.
//!
//! Distinct keys whose fingerprints collide are reported too; the
//! false-positive rate falls as `fpr_parameter` grows.

use std::f64::consts::LN_2;

use bytes::Bytes;
use itertools::Itertools;
use tracing::{debug, trace};

use crate::data::BlockWriter;
use crate::error::{Error, Result};
use crate::golomb::GolombBuffer;
use crate::net::{CatReader, Comm};
use crate::{calculate_local_range, Range};

/// Parameters every worker derives from the cluster-wide unique-key count.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ProtocolParams {
    pub upper_bound_uniques: u64,
    pub fpr_parameter: f64,
    /// Golomb-Rice code parameter.
    pub b: u32,
    /// Fingerprints live in `[0, max_hash)`.
    pub max_hash: u64,
    /// Bit capacity of any block.
    pub space_bound: usize,
}

impl ProtocolParams {
    pub fn negotiate(upper_bound_uniques: u64, fpr_parameter: f64) -> Result<Self> {
        if !(fpr_parameter >= 1.0) {
            return Err(Error::InvalidParameter(format!(
                "fpr_parameter must be at least 1, got {fpr_parameter}"
            )));
        }
        let b = ((LN_2 * fpr_parameter).floor() as u32).clamp(1, 63);
        let max_hash = ((upper_bound_uniques as f64 * fpr_parameter) as u64).max(1);
        // a block holds at most every unique key below max_hash: each costs
        // b + 1 bits besides its unary quotient, and the quotients of sorted
        // deltas add up to at most max_hash >> b
        let space_bound = u128::from(upper_bound_uniques) * u128::from(b + 1)
            + u128::from(max_hash >> b)
            + 64;
        Ok(Self {
            upper_bound_uniques,
            fpr_parameter,
            b,
            max_hash,
            space_bound: usize::try_from(space_bound).unwrap_or(usize::MAX),
        })
    }
}

/// Reduce key hashes to fingerprints, sorted ascending. Equal fingerprints
/// from distinct keys are kept.
pub fn project_fingerprints(hashes: &[u64], max_hash: u64) -> Vec<u64> {
    let mut fingerprints: Vec<u64> = hashes.iter().map(|h| h % max_hash).collect();
    fingerprints.sort_unstable();
    fingerprints
}

/// The fingerprint range owned by each worker.
pub fn fingerprint_ranges(max_hash: u64, num_workers: usize) -> Vec<Range> {
    (0..num_workers)
        .map(|i| calculate_local_range(max_hash, num_workers, i))
        .collect()
}

/// Every value occurring at least twice in a sorted sequence, once each.
pub fn find_duplicates(sorted: &[u64]) -> Vec<u64> {
    sorted
        .iter()
        .dedup_with_count()
        .filter(|(count, _)| *count >= 2)
        .map(|(_, value)| *value)
        .collect()
}

/// A Golomb-Rice coded run of sorted values, as sent on the wire:
/// `[u64 byte_length][u64 element_count][payload]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedBlock {
    pub element_count: u64,
    pub payload: Bytes,
}

impl EncodedBlock {
    pub fn empty() -> Self {
        Self {
            element_count: 0,
            payload: Bytes::new(),
        }
    }

    /// Code a non-decreasing sequence. The first value is coded as its
    /// distance from zero, every later one as the gap to its predecessor.
    pub fn encode(sorted: &[u64], params: &ProtocolParams, debug: bool) -> Result<Self> {
        if sorted.is_empty() {
            return Ok(Self::empty());
        }
        let mut code = GolombBuffer::with_capacity(params.space_bound, params.b)?;
        let mut last = 0;
        for &value in sorted {
            let delta = value.checked_sub(last).ok_or_else(|| {
                Error::InvalidParameter(format!("block values not sorted: {value} after {last}"))
            })?;
            if debug {
                trace!(value, delta, "encoding fingerprint");
            }
            code.encode(delta)?;
            last = value;
        }
        Ok(Self {
            element_count: sorted.len() as u64,
            payload: Bytes::copy_from_slice(code.as_bytes()),
        })
    }

    pub fn byte_length(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Reconstruct the coded values. The header must describe the payload
    /// exactly: the values may neither run past its end nor leave a whole
    /// unused byte behind.
    pub fn decode(&self, b: u32) -> Result<Vec<u64>> {
        let total_bits = self.payload.len() as u128 * 8;
        if u128::from(self.element_count) * u128::from(b + 1) > total_bits {
            return Err(Error::MalformedBlock(format!(
                "{} elements cannot fit in {} bytes",
                self.element_count,
                self.payload.len()
            )));
        }
        let mut code = GolombBuffer::from_bytes(&self.payload, b)?;
        let mut values = Vec::with_capacity(self.element_count as usize);
        let mut last = 0u64;
        for _ in 0..self.element_count {
            last = last
                .checked_add(code.decode()?)
                .ok_or_else(|| Error::MalformedBlock("decoded value overflows".into()))?;
            values.push(last);
        }
        if code.position().div_ceil(8) != self.payload.len() {
            return Err(Error::MalformedBlock(format!(
                "{} elements end at bit {} of a {} byte payload",
                self.element_count,
                code.position(),
                self.payload.len()
            )));
        }
        Ok(values)
    }

    pub fn write_to<W: BlockWriter>(&self, writer: &mut W) -> Result<()> {
        writer.put(&self.byte_length())?;
        writer.put(&self.element_count)?;
        writer.append(&self.payload)
    }

    pub async fn read_from(reader: &mut CatReader) -> Result<Self> {
        let byte_length: u64 = reader.next().await?;
        let element_count: u64 = reader.next().await?;
        let len = usize::try_from(byte_length)
            .map_err(|_| Error::MalformedBlock(format!("byte length {byte_length}")))?;
        let payload = reader.read_bytes(len).await?;
        Ok(Self {
            element_count,
            payload,
        })
    }
}

/// Duplicate fingerprints found across the cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct DuplicateSet {
    pub params: ProtocolParams,
    /// Sorted ascending, no repeats.
    pub fingerprints: Vec<u64>,
}

impl DuplicateSet {
    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.fingerprints.iter().copied()
    }

    pub fn contains_fingerprint(&self, fingerprint: u64) -> bool {
        self.fingerprints.binary_search(&fingerprint).is_ok()
    }

    /// Whether a key with this hash may also live on another worker.
    pub fn is_duplicate_hash(&self, hash: u64) -> bool {
        self.contains_fingerprint(hash % self.params.max_hash)
    }
}

/// Read one block from every worker and decode it.
async fn receive_blocks(
    reader: &mut CatReader,
    num_workers: usize,
    b: u32,
) -> Result<Vec<Vec<u64>>> {
    let mut decoded = Vec::with_capacity(num_workers);
    while reader.has_next().await? {
        decoded.push(EncodedBlock::read_from(reader).await?.decode(b)?);
    }
    if decoded.len() != num_workers {
        return Err(Error::MalformedBlock(format!(
            "expected {num_workers} blocks, received {}",
            decoded.len()
        )));
    }
    Ok(decoded)
}

/// Run both exchange rounds. `hashes` holds the hash of every locally
/// unique key, each once.
pub async fn find_global_duplicates<C: Comm + ?Sized>(
    comm: &C,
    hashes: &[u64],
    fpr_parameter: f64,
    debug: bool,
) -> Result<DuplicateSet> {
    let num_workers = comm.num_workers();
    let me = comm.worker_id();

    let upper_bound_uniques = comm.all_reduce(hashes.len() as u64).await?;
    let params = ProtocolParams::negotiate(upper_bound_uniques, fpr_parameter)?;
    debug!(worker = me, local = hashes.len(), ?params, "negotiated fingerprint exchange");

    let fingerprints = project_fingerprints(hashes, params.max_hash);
    let ranges = fingerprint_ranges(params.max_hash, num_workers);

    // round 1: every range's slice goes to the range owner
    let mut stream = comm.new_cat_stream()?;
    let mut rest = &fingerprints[..];
    for (range, mut writer) in ranges.iter().zip(stream.writers()) {
        let split = rest.partition_point(|&f| f < range.end);
        let (slice, tail) = rest.split_at(split);
        let block = EncodedBlock::encode(slice, &params, debug)?;
        debug!(
            worker = me,
            elements = block.element_count,
            bytes = block.byte_length(),
            "round 1 block for range {:?}",
            range
        );
        block.write_to(&mut writer)?;
        writer.close()?;
        rest = tail;
    }

    let received = receive_blocks(&mut stream.cat_reader(), num_workers, params.b).await?;
    let owned = ranges[me];
    if let Some(stray) = received.iter().flatten().find(|&&f| !owned.contains(f)) {
        return Err(Error::MalformedBlock(format!(
            "fingerprint {stray} outside owned range {owned:?}"
        )));
    }
    let merged: Vec<u64> = received.into_iter().kmerge().collect();
    let duplicates = find_duplicates(&merged);
    debug!(
        worker = me,
        merged = merged.len(),
        duplicates = duplicates.len(),
        "merged owned range"
    );

    // round 2: every owner's duplicates go to everyone
    let block = EncodedBlock::encode(&duplicates, &params, debug)?;
    let mut stream = comm.new_cat_stream()?;
    for mut writer in stream.writers() {
        block.write_to(&mut writer)?;
        writer.close()?;
    }
    let received = receive_blocks(&mut stream.cat_reader(), num_workers, params.b).await?;
    let fingerprints: Vec<u64> = received.into_iter().kmerge().collect();
    if debug {
        trace!(worker = me, ?fingerprints, "global duplicate fingerprints");
    }

    Ok(DuplicateSet {
        params,
        fingerprints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemorySink;
    use crate::net::LocalComm;

    #[test]
    fn negotiation_is_deterministic() {
        let params = ProtocolParams::negotiate(100, 8.0).unwrap();
        assert_eq!(params.b, 5);
        assert_eq!(params.max_hash, 800);
        assert_eq!(params.space_bound, 100 * 6 + (800 >> 5) + 64);
        assert_eq!(params, ProtocolParams::negotiate(100, 8.0).unwrap());

        let empty = ProtocolParams::negotiate(0, 8.0).unwrap();
        assert_eq!(empty.max_hash, 1);
        assert_eq!(ProtocolParams::negotiate(10, 1.0).unwrap().b, 1);
        assert!(ProtocolParams::negotiate(10, 0.5).is_err());
    }

    #[test]
    fn duplicates_reported_once() {
        assert_eq!(find_duplicates(&[3, 3, 7, 9]), vec![3]);
        assert_eq!(find_duplicates(&[0, 0, 0, 4, 5, 5]), vec![0, 5]);
        assert!(find_duplicates(&[1, 2, 3]).is_empty());
        assert!(find_duplicates(&[]).is_empty());
    }

    #[test]
    fn projection_keeps_colliding_fingerprints() {
        assert_eq!(project_fingerprints(&[35, 9, 3, 7], 32), vec![3, 3, 7, 9]);
    }

    #[test]
    fn ranges_cover_fingerprint_space() {
        for max_hash in [1u64, 5, 800, 12345] {
            for workers in 1..=7 {
                let ranges = fingerprint_ranges(max_hash, workers);
                assert_eq!(ranges.len(), workers);
                assert_eq!(ranges[0].begin, 0);
                assert_eq!(ranges[workers - 1].end, max_hash);
                assert!(ranges.windows(2).all(|w| w[0].end == w[1].begin));
            }
        }
    }

    #[test]
    fn block_round_trip_with_leading_zero_and_repeats() {
        let params = ProtocolParams::negotiate(8, 8.0).unwrap();
        let values = vec![0, 0, 5, 5, 6, 40, 63];
        let block = EncodedBlock::encode(&values, &params, false).unwrap();
        assert_eq!(block.element_count, 7);
        assert_eq!(block.decode(params.b).unwrap(), values);
    }

    #[test]
    fn worst_case_block_fits_space_bound() {
        let params = ProtocolParams::negotiate(1000, 8.0).unwrap();
        let mut values: Vec<u64> = vec![0; 999];
        values.push(params.max_hash - 1);
        assert!(EncodedBlock::encode(&values, &params, false).is_ok());
        let spread: Vec<u64> = (0..1000).map(|i| i * 8 + 7).collect();
        assert!(EncodedBlock::encode(&spread, &params, false).is_ok());
    }

    #[test]
    fn unsorted_input_rejected() {
        let params = ProtocolParams::negotiate(4, 8.0).unwrap();
        assert!(EncodedBlock::encode(&[5, 2], &params, false).is_err());
    }

    #[test]
    fn empty_block_is_well_formed() {
        let params = ProtocolParams::negotiate(4, 8.0).unwrap();
        let block = EncodedBlock::encode(&[], &params, false).unwrap();
        assert_eq!(block, EncodedBlock::empty());
        assert!(block.decode(params.b).unwrap().is_empty());

        let sink = MemorySink::new();
        let mut writer = sink.writer();
        block.write_to(&mut writer).unwrap();
        writer.close().unwrap();
        assert_eq!(sink.bytes().len(), 16);
    }

    #[test]
    fn wire_layout() {
        let params = ProtocolParams::negotiate(4, 4.0).unwrap();
        assert_eq!(params.b, 2);
        // 13: unary 1110, remainder 1 LSB first; then gap 0: 0, 00
        let block = EncodedBlock::encode(&[13, 13], &params, false).unwrap();
        let sink = MemorySink::new();
        let mut writer = sink.writer();
        block.write_to(&mut writer).unwrap();
        writer.close().unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&2u64.to_le_bytes());
        expected.extend_from_slice(&2u64.to_le_bytes());
        expected.extend_from_slice(&[0b0001_0111, 0b0000_0000]);
        assert_eq!(&sink.bytes()[..], &expected[..]);
    }

    #[test]
    fn malformed_blocks_rejected() {
        let params = ProtocolParams::negotiate(16, 8.0).unwrap();
        let block = EncodedBlock::encode(&[1, 2, 3], &params, false).unwrap();

        let too_many = EncodedBlock {
            element_count: 40,
            ..block.clone()
        };
        assert!(matches!(too_many.decode(params.b), Err(Error::MalformedBlock(_))));

        let mut padded = block.payload.to_vec();
        padded.push(0);
        let trailing = EncodedBlock {
            element_count: 3,
            payload: Bytes::from(padded),
        };
        assert!(matches!(trailing.decode(params.b), Err(Error::MalformedBlock(_))));

        let phantom = EncodedBlock {
            element_count: 0,
            payload: Bytes::from_static(&[1]),
        };
        assert!(matches!(phantom.decode(params.b), Err(Error::MalformedBlock(_))));
    }

    #[tokio::test]
    async fn single_worker_finds_colliding_fingerprints() {
        let comm = LocalComm::cluster(1).pop().unwrap();
        // four uniques with fpr 8 give max_hash 32, so 35 lands on 3
        let set = find_global_duplicates(&comm, &[3, 35, 7, 9], 8.0, true)
            .await
            .unwrap();
        assert_eq!(set.params.max_hash, 32);
        assert_eq!(set.fingerprints, vec![3]);
        assert!(set.is_duplicate_hash(67));
        assert!(!set.is_duplicate_hash(7));
    }
}
