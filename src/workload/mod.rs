//! Converts application names to the map and combine functions the
//! pre-reduce stage runs.
//!
//! # Example
//!
//! To get the word count application:
//! ```
//! # use anyhow::Result;
//! use prereduce::workload;
//! # fn main() -> Result<()> {
//! let wc = workload::named("wc")?;
//! assert_eq!((wc.reduce_fn)(&2, &3), 5);
//! # Ok(())
//! # }
//! ```

use anyhow::{bail, Result};
use bytes::Bytes;

pub mod grep;
pub mod wc;

/// A keyed count. The key is carried inside the record so the stage can run
/// in either key mode.
pub type Record = (String, u64);

/// The output of an application map function.
///
/// The outer result covers errors while creating the iterator, the inner
/// one errors during iteration.
pub type MapOutput = Result<Box<dyn Iterator<Item = Result<Record>>>>;

/// A map function takes an input name, its contents and the serialized
/// auxiliary arguments.
pub type MapFn = fn(name: &str, contents: Bytes, aux: &Bytes) -> MapOutput;

/// Combines two counts of the same key. Must be associative and
/// commutative, since it runs both in the pre-stage and after the shuffle.
pub type ReduceFn = fn(&u64, &u64) -> u64;

/// Renders one reduced record as an output line.
pub type FormatFn = fn(key: &str, count: u64) -> String;

/// A pre-reducible application.
#[derive(Copy, Clone)]
pub struct Workload {
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
    pub format_fn: FormatFn,
}

impl Workload {
    /// Combine two records of the same key.
    pub fn reduce_records(&self, a: &Record, b: &Record) -> Record {
        (a.0.clone(), (self.reduce_fn)(&a.1, &b.1))
    }
}

/// Gets the [`Workload`] named `name`.
///
/// Returns [`None`] if no application with the given name was found.
pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "wc" => Some(Workload {
            map_fn: wc::map,
            reduce_fn: wc::reduce,
            format_fn: wc::format,
        }),
        "grep" => Some(Workload {
            map_fn: grep::map,
            reduce_fn: grep::reduce,
            format_fn: grep::format,
        }),
        _ => None,
    }
}

/// Gets the [`Workload`] named `name`.
///
/// Returns an [`anyhow::Error`] if no application with the given name was found.
pub fn named(name: &str) -> Result<Workload> {
    match try_named(name) {
        Some(app) => Ok(app),
        None => bail!("No app named `{}` found.", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup() {
        assert!(try_named("wc").is_some());
        assert!(try_named("grep").is_some());
        assert!(try_named("mm-one").is_none());
        assert!(named("nope").is_err());
    }

    #[test]
    fn reduce_records_keeps_key() {
        let wc = named("wc").unwrap();
        let merged = wc.reduce_records(&("a".into(), 2), &("a".into(), 5));
        assert_eq!(merged, ("a".to_string(), 7));
    }
}
