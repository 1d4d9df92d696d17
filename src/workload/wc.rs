//! Word count.
//!

use super::{MapOutput, Record};
use anyhow::Result;
use bytes::Bytes;

pub fn map(_name: &str, contents: Bytes, _aux: &Bytes) -> MapOutput {
    let s = String::from_utf8(contents.as_ref().into())?;
    let words = s
        .split(|c: char| !c.is_alphabetic())
        .filter(|s| !s.is_empty())
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>();

    let iter = words
        .into_iter()
        .map(|word| -> Result<Record> { Ok((word, 1)) });
    Ok(Box::new(iter))
}

pub fn reduce(a: &u64, b: &u64) -> u64 {
    a + b
}

pub fn format(word: &str, count: u64) -> String {
    format!("{} {}\n", word, count)
}
