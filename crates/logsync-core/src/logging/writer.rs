//! Append-only JSONL file per node per day.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::LogRecord;

/// Writes to `{logs_dir}/raw/{date}_{node}.jsonl`.
pub struct JsonlWriter {
    node: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl JsonlWriter {
    pub fn new(logs_dir: impl AsRef<Path>, node: impl Into<String>) -> std::io::Result<Self> {
        let node = node.into();
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = raw_dir.join(format!("{}_{}.jsonl", date, node));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            node,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush, so a crash loses at most the line in flight.
    pub fn write(&self, record: &LogRecord) -> std::io::Result<()> {
        let json = record
            .to_json_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        let _ = self.writer.get_mut().flush();
    }
}

/// Read every record from every file under `{logs_dir}/raw`, oldest first.
///
/// Lines that do not parse are skipped.
pub fn read_records(logs_dir: impl AsRef<Path>) -> std::io::Result<Vec<LogRecord>> {
    let raw_dir = logs_dir.as_ref().join("raw");
    if !raw_dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for entry in fs::read_dir(&raw_dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "jsonl") {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                if let Ok(record) = LogRecord::from_json_line(&line?) {
                    records.push(record);
                }
            }
        }
    }
    records.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_creates_raw_dir_and_named_file() {
        let temp = TempDir::new().unwrap();
        let writer = JsonlWriter::new(temp.path(), "alice").unwrap();
        assert!(temp.path().join("raw").is_dir());
        let name = writer.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("_alice.jsonl"));
        assert_eq!(writer.node(), "alice");
    }

    #[test]
    fn test_records_from_several_nodes_are_merged() {
        let temp = TempDir::new().unwrap();
        let alice = JsonlWriter::new(temp.path(), "alice").unwrap();
        let bob = JsonlWriter::new(temp.path(), "bob").unwrap();

        alice.write(&LogRecord::new("info", "alice", "t", "one")).unwrap();
        bob.write(&LogRecord::new("warn", "bob", "t", "two")).unwrap();
        alice.write(&LogRecord::new("info", "alice", "t", "three")).unwrap();

        let records = read_records(temp.path()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records.iter().filter(|r| r.node == "alice").count(), 2);
    }

    #[test]
    fn test_read_missing_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(read_records(temp.path().join("nope")).unwrap().is_empty());
    }
}
