use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod engine;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a job on an in-process cluster
    Submit {
        /// Glob spec for the input files
        #[arg(short, long)]
        input: String,

        // Name of the workload
        #[arg(short, long)]
        workload: String,

        /// Output directory
        #[arg(short, long)]
        output: String,

        /// Number of in-process workers
        #[arg(short = 'n', long, default_value_t = 4)]
        workers: usize,

        /// Table memory per worker, in bytes
        #[arg(short, long, default_value_t = 64 << 20)]
        memory: usize,

        /// JSON file with the reduce configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Auxiliary arguments to pass to the application.
        #[clap(value_parser, last = true)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub input: String,
    pub workload: String,
    pub output: String,
    pub workers: usize,
    pub memory: usize,
    pub args: Vec<String>,
}

impl Commands {
    /// The job to run and the path of its reduce configuration, if any.
    pub fn into_job(self) -> (Job, Option<PathBuf>) {
        match self {
            Commands::Submit {
                input,
                workload,
                output,
                workers,
                memory,
                config,
                args,
            } => (
                Job {
                    input,
                    workload,
                    output,
                    workers,
                    memory,
                    args,
                },
                config,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_submit() {
        let args = Args::try_parse_from([
            "standalone", "submit", "-i", "data/*.txt", "-w", "grep", "-o", "out", "-n", "2",
            "--", "--term", "foo",
        ])
        .unwrap();
        let (job, config) = args.command.into_job();
        assert_eq!(job.workers, 2);
        assert_eq!(job.memory, 64 << 20);
        assert_eq!(job.args, ["--term", "foo"]);
        assert!(config.is_none());
    }
}
