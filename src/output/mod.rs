//! Turning pipeline results into caller-facing instances and persisted records
//!
//! Builders ([`InstanceBuilder`]) materialize rows as maps, typed structs, or
//! persistence records. Sinks ([`RecordSink`]) receive records table by table,
//! parents first, in fixed-size batches.

pub mod builder;
pub mod writer;

pub use builder::{
    materialize, materialize_all, InstanceBuilder, MapBuilder, ParentRef, Record, RecordBuilder, TypedBuilder,
    ValidatedBuilder,
};
pub use writer::{JsonlDirWriter, StreamWriter};

use crate::pipeline::PipelineResult;
use crate::value::JoinKey;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;

/// Batch size used when the caller has no preference
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Destination for persisted records
///
/// Committing is the caller's job: [`persist`] never calls `flush`.
pub trait RecordSink {
    fn write_batch(&mut self, table: &str, records: &[Record]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

/// Write every table of `result` to `sink`, parents before children
///
/// Each record carries references to the parent rows it was linked to.
/// Returns the number of records written.
pub fn persist<S: RecordSink + ?Sized>(result: &PipelineResult, sink: &mut S, batch_size: usize) -> Result<usize> {
    if batch_size == 0 {
        bail!("batch size must be at least 1");
    }

    // child table -> child key -> parents
    let mut parents: HashMap<&str, HashMap<&JoinKey, Vec<ParentRef>>> = HashMap::new();
    for link in &result.links {
        parents
            .entry(link.child_table.as_str())
            .or_default()
            .entry(&link.child_key)
            .or_default()
            .push(ParentRef {
                table: link.parent_table.clone(),
                key: link.parent_key.clone(),
            });
    }

    let mut written = 0;
    for table in &result.order {
        let mut records: Vec<Record> = materialize(result, table, &RecordBuilder)?.into_values().collect();
        if let Some(by_key) = parents.get_mut(table.as_str()) {
            for record in &mut records {
                record.parents = by_key.remove(&record.key).unwrap_or_default();
            }
        }

        for batch in records.chunks(batch_size) {
            sink.write_batch(table, batch)
                .with_context(|| format!("Failed to persist {} batch of {}", table, batch.len()))?;
            written += batch.len();
        }
        log::debug!("persisted {} {} record(s)", records.len(), table);
    }
    Ok(written)
}
