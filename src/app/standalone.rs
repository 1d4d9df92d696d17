use anyhow::Result;
use clap::Parser;
use prereduce::standalone::{engine::run_job, Args};
use prereduce::{workload, ReduceConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (job, config_path) = Args::parse().command.into_job();
    let engine = workload::named(&job.workload)?;
    let config = match config_path {
        Some(path) => ReduceConfig::from_path(path)?,
        None => ReduceConfig::default(),
    };

    let reports = run_job(&job, engine, config).await?;
    for report in &reports {
        println!(
            "worker {}: {} inputs, {} inserts ({} unique), {} emitted, {} received -> {}",
            report.worker,
            report.inputs,
            report.total_inserts,
            report.unique_inserts,
            report.emitted,
            report.received,
            report.output.display()
        );
    }
    if let Some(flagged) = reports.first().and_then(|r| r.possible_duplicates) {
        println!("{} keys possibly held by more than one worker", flagged);
    }
    Ok(())
}
