use crate::output::builder::Record;
use crate::output::RecordSink;
use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Record data plus `_key` and, when linked, `_parents`
fn tagged(record: &Record) -> Result<Map<String, Value>> {
    let mut data = record.data.clone();
    data.insert(
        "_key".to_string(),
        serde_json::to_value(&record.key).context("Failed to serialize key")?,
    );
    if !record.parents.is_empty() {
        data.insert(
            "_parents".to_string(),
            serde_json::to_value(&record.parents).context("Failed to serialize parents")?,
        );
    }
    Ok(data)
}

/// Table names become file names, so they must stay inside the output directory
fn check_table_name(table: &str) -> Result<()> {
    if table.is_empty() || table == "." || table == ".." || table.contains(['/', '\\']) {
        bail!("Table name {:?} cannot be used as a file name", table);
    }
    Ok(())
}

/// Writes records to JSON Lines files, one `<table>.jsonl` per table
pub struct JsonlDirWriter {
    output_dir: PathBuf,
    writers: HashMap<String, BufWriter<File>>,
}

impl JsonlDirWriter {
    /// Create the writer, creating `output_dir` if needed
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Result<Self> {
        std::fs::create_dir_all(&output_dir).context("Failed to create output directory")?;

        Ok(JsonlDirWriter {
            output_dir: output_dir.as_ref().to_path_buf(),
            writers: HashMap::new(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn writer_for(&mut self, table: &str) -> Result<&mut BufWriter<File>> {
        if !self.writers.contains_key(table) {
            check_table_name(table)?;
            let path = self.output_dir.join(format!("{}.jsonl", table));
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open file: {}", path.display()))?;
            self.writers.insert(table.to_string(), BufWriter::new(file));
        }
        self.writers
            .get_mut(table)
            .with_context(|| format!("No writer for table {}", table))
    }
}

impl RecordSink for JsonlDirWriter {
    fn write_batch(&mut self, table: &str, records: &[Record]) -> Result<()> {
        let writer = self.writer_for(table)?;
        for record in records {
            let json = serde_json::to_string(&tagged(record)?).context("Failed to serialize record")?;
            writeln!(writer, "{}", json).context("Failed to write record")?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.flush().context("Failed to flush writer")?;
        }
        Ok(())
    }
}

/// Writes every table to a single stream, tagging rows with their origin
pub struct StreamWriter<W: Write> {
    writer: W,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(writer: W) -> Self {
        StreamWriter { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RecordSink for StreamWriter<W> {
    fn write_batch(&mut self, table: &str, records: &[Record]) -> Result<()> {
        for record in records {
            let mut data = tagged(record)?;
            data.insert("_table".to_string(), Value::String(table.to_string()));

            let json = serde_json::to_string(&data).context("Failed to serialize record")?;
            writeln!(self.writer, "{}", json).context("Failed to write record")?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush writer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::builder::ParentRef;
    use crate::value::JoinKey;
    use serde_json::json;

    fn record(table: &str, id: &str, parent: Option<&str>) -> Record {
        Record {
            table: table.to_string(),
            key: JoinKey::from(vec![id]),
            data: serde_json::from_value(json!({"id": id})).unwrap(),
            parents: parent
                .map(|p| ParentRef {
                    table: "users".into(),
                    key: JoinKey::from(vec![p]),
                })
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn test_stream_writer() {
        let mut buffer = Vec::new();
        let mut writer = StreamWriter::new(&mut buffer);

        writer.write_batch("posts", &[record("posts", "p1", Some("u1"))]).unwrap();
        writer.flush().unwrap();

        let output = String::from_utf8(buffer).unwrap();
        let line: Value = serde_json::from_str(output.trim_end()).unwrap();
        assert_eq!(
            line,
            json!({
                "id": "p1",
                "_table": "posts",
                "_key": ["p1"],
                "_parents": [{"table": "users", "key": ["u1"]}]
            })
        );
    }

    #[test]
    fn test_jsonl_dir_writer() {
        let dir = std::env::temp_dir().join(format!("smelter-writer-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let mut writer = JsonlDirWriter::new(&dir).unwrap();
        writer.write_batch("users", &[record("users", "u1", None), record("users", "u2", None)]).unwrap();
        writer.write_batch("posts", &[record("posts", "p1", Some("u1"))]).unwrap();
        writer.flush().unwrap();

        let users = std::fs::read_to_string(dir.join("users.jsonl")).unwrap();
        assert_eq!(
            users.lines().collect::<Vec<_>>(),
            vec![r#"{"id":"u1","_key":["u1"]}"#, r#"{"id":"u2","_key":["u2"]}"#]
        );

        let posts = std::fs::read_to_string(dir.join("posts.jsonl")).unwrap();
        let p1: Value = serde_json::from_str(posts.trim_end()).unwrap();
        assert_eq!(p1["_parents"], json!([{"table": "users", "key": ["u1"]}]));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_jsonl_dir_writer_rejects_escaping_table_names() {
        let dir = std::env::temp_dir().join(format!("smelter-names-{}", std::process::id()));
        let mut writer = JsonlDirWriter::new(&dir).unwrap();

        for bad in ["../x", "a/b", "..", "", "a\\b"] {
            assert!(writer.write_batch(bad, &[record("users", "u1", None)]).is_err(), "{:?}", bad);
        }
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
