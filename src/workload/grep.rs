//! Counts the lines of each input that contain a search term.
//!

use super::{MapOutput, Record};
use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug, Serialize, Deserialize)]
#[clap(no_binary_name = true)]
struct Args {
    #[clap(short, long, value_parser)]
    term: String,
}

pub fn map(name: &str, contents: Bytes, aux: &Bytes) -> MapOutput {
    let args = Args::try_parse_from(serde_json::from_slice::<Vec<String>>(aux)?)?;
    let term = args.term;

    let s = String::from_utf8(contents.as_ref().into())?;
    let matches = s.lines().filter(|line| line.contains(&term)).count() as u64;

    let name = name.to_string();
    let iter = (matches > 0)
        .then_some(matches)
        .into_iter()
        .map(move |n| -> Result<Record> { Ok((name.clone(), n)) });
    Ok(Box::new(iter))
}

pub fn reduce(a: &u64, b: &u64) -> u64 {
    a + b
}

pub fn format(file: &str, lines: u64) -> String {
    format!("{}:{}\n", file, lines)
}
