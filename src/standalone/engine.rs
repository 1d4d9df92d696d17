use anyhow::{bail, Result};
use bytes::Bytes;
use glob::glob;
use itertools::Itertools;
use std::{
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::Job;
use crate::config::{KeyMode, ReduceConfig};
use crate::data::BlockWriter;
use crate::dedup::DuplicateSet;
use crate::net::{CatReader, Comm, LocalComm};
use crate::stage::ReducePreStage;
use crate::workload::{Record, Workload};

/// What one worker did during a job.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker: usize,
    pub inputs: usize,
    pub total_inserts: usize,
    pub unique_inserts: usize,
    /// Records this worker's pre-stage sent to the reducers.
    pub emitted: usize,
    /// Records this worker received as a reducer.
    pub received: usize,
    /// Fingerprints flagged as shared across workers, if detection ran.
    pub possible_duplicates: Option<usize>,
    pub output: PathBuf,
}

/// Every file matching `pattern`, in path order.
pub fn list_inputs(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = glob(pattern)?.flatten().filter(|p| p.is_file()).collect();
    files.sort();
    Ok(files)
}

/// Run `job` on `job.workers` in-process workers. Input files are dealt out
/// round-robin; worker `i` reduces the `i`-th key range and writes
/// `mr-out-{i}` into the output directory.
pub async fn run_job(job: &Job, engine: Workload, config: ReduceConfig) -> Result<Vec<WorkerReport>> {
    if job.workers == 0 {
        bail!("a job needs at least one worker");
    }
    config.validate()?;
    let inputs = list_inputs(&job.input)?;
    std::fs::create_dir_all(&job.output)?;
    let serialized_args = Bytes::from(serde_json::to_string(&job.args)?);
    info!(inputs = inputs.len(), workers = job.workers, workload = %job.workload, "starting job");

    let job = Arc::new(job.clone());
    let mut tasks = JoinSet::new();
    for comm in LocalComm::cluster(job.workers) {
        let files: Vec<PathBuf> = inputs
            .iter()
            .skip(comm.worker_id())
            .step_by(job.workers)
            .cloned()
            .collect();
        let job = Arc::clone(&job);
        let args = serialized_args.clone();
        let config = config.clone();
        tasks.spawn(async move { run_worker(comm, &job, engine, &args, config, files).await });
    }

    let mut reports = Vec::with_capacity(job.workers);
    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(anyhow::Error::from).and_then(|report| report) {
            Ok(report) => reports.push(report),
            Err(e) => {
                // the others would wait on the failed worker forever
                tasks.abort_all();
                return Err(e);
            }
        }
    }
    reports.sort_by_key(|r| r.worker);

    let duplicates = reports.first().and_then(|r| r.possible_duplicates);
    info!(
        emitted = reports.iter().map(|r| r.emitted).sum::<usize>(),
        total_inserts = reports.iter().map(|r| r.total_inserts).sum::<usize>(),
        ?duplicates,
        "job done"
    );
    Ok(reports)
}

async fn run_worker(
    comm: LocalComm,
    job: &Job,
    engine: Workload,
    serialized_args: &Bytes,
    config: ReduceConfig,
    files: Vec<PathBuf>,
) -> Result<WorkerReport> {
    let worker = comm.worker_id();
    let key_mode = config.key_mode;

    // partition i of every pre-stage feeds worker i
    let mut shuffle = comm.new_cat_stream()?;
    let writers = shuffle.writers();
    let mut reader = shuffle.cat_reader();

    let mut stage = ReducePreStage::new(
        |record: &Record| record.0.clone(),
        move |a: &Record, b: &Record| engine.reduce_records(a, b),
        writers,
        config,
    )?;
    stage.initialize(job.memory)?;
    perform_map(&mut stage, &engine, serialized_args, &files)?;

    stage.flush_all(&comm).await?;
    let possible_duplicates = stage.duplicates().map(DuplicateSet::len);
    let emitted = stage.emit_stats().iter().sum();
    let (total_inserts, unique_inserts) = (stage.total_inserts(), stage.unique_inserts());
    stage.close_all()?;

    let records = receive(&mut reader, key_mode).await?;
    let received = records.len();
    let output = Path::new(&job.output).join(format!("mr-out-{}", worker));
    perform_reduce(records, &engine, &output)?;
    debug!(worker, received, output = %output.display(), "worker done");

    Ok(WorkerReport {
        worker,
        inputs: files.len(),
        total_inserts,
        unique_inserts,
        emitted,
        received,
        possible_duplicates,
        output,
    })
}

/// Map every input file and insert the records into the pre-stage.
/// Returns the number of records mapped.
pub fn perform_map<KE, RF, W>(
    stage: &mut ReducePreStage<String, Record, KE, RF, W>,
    engine: &Workload,
    serialized_args: &Bytes,
    files: &[PathBuf],
) -> Result<usize>
where
    KE: Fn(&Record) -> String,
    RF: Fn(&Record, &Record) -> Record,
    W: BlockWriter,
{
    let mut mapped = 0;
    for pathspec in files {
        let mut buf = Vec::new();
        {
            // a scope so that the file is closed right after reading
            let mut file = File::open(pathspec)?;
            file.read_to_end(&mut buf)?;
        }
        let filename = pathspec.to_str().unwrap_or("unknown");
        let map_func = engine.map_fn;
        for record in map_func(filename, Bytes::from(buf), serialized_args)? {
            stage.insert(record?)?;
            mapped += 1;
        }
    }
    Ok(mapped)
}

/// Drain the shuffle stream. Volatile-key streams carry the key ahead of
/// each record.
async fn receive(reader: &mut CatReader, key_mode: KeyMode) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    while reader.has_next().await? {
        let record = match key_mode {
            KeyMode::Robust => reader.next::<Record>().await?,
            KeyMode::Volatile => reader.next::<(String, Record)>().await?.1,
        };
        records.push(record);
    }
    Ok(records)
}

/// Combine the records of each key and write them, sorted by key, to
/// `output`.
pub fn perform_reduce(mut records: Vec<Record>, engine: &Workload, output: &Path) -> Result<()> {
    let mut out_file = File::create(output)?;
    records.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    for (key, group) in &records.into_iter().chunk_by(|record| record.0.clone()) {
        let count = group
            .map(|(_, count)| count)
            .reduce(|a, b| (engine.reduce_fn)(&a, &b))
            .unwrap_or_default();
        out_file.write_all((engine.format_fn)(&key, count).as_bytes())?;
    }
    Ok(())
}
