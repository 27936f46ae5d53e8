//! Persistence of recordable node state.
//!
//! Each modification of a recordable node's state bundle is appended as one
//! JSON line, `{"time": <micros>, "value": <value>}`, to
//! `<dir>/<record_replay_id>.jsonl`. Values round-trip through the plain
//! wire encoding, so a replay yields the same `(time, value)` sequence the
//! run produced.

use crate::ts::plain::{PlainValue, plain_from_json, plain_to_json};
use rustc_hash::FxHashMap;
use serde_json::json;
use std::fs::{File, OpenOptions, create_dir_all};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tickflow_common::{EngineError, EngineTime};
use tracing::debug;

fn io_err(context: &str, e: std::io::Error) -> EngineError {
    EngineError::internal(format!("{context}: {e}"))
}

#[derive(Debug)]
pub struct Recorder {
    dir: PathBuf,
    files: FxHashMap<String, BufWriter<File>>,
}

impl Recorder {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let dir = dir.into();
        create_dir_all(&dir).map_err(|e| io_err("creating record directory", e))?;
        Ok(Self {
            dir,
            files: FxHashMap::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one `(time, value)` record under `id`.
    pub fn record(
        &mut self,
        id: &str,
        time: EngineTime,
        value: &PlainValue,
    ) -> Result<(), EngineError> {
        if !self.files.contains_key(id) {
            let path = self.dir.join(format!("{id}.jsonl"));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| io_err("opening record file", e))?;
            debug!(id, path = %path.display(), "recording state");
            self.files.insert(id.to_string(), BufWriter::new(file));
        }
        let writer = self
            .files
            .get_mut(id)
            .ok_or_else(|| EngineError::internal("record writer missing"))?;
        let line = json!({ "time": time.micros(), "value": plain_to_json(value) });
        writeln!(writer, "{line}").map_err(|e| io_err("writing record", e))?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), EngineError> {
        for writer in self.files.values_mut() {
            writer.flush().map_err(|e| io_err("flushing records", e))?;
        }
        Ok(())
    }

    /// Read back every record written under `id`.
    pub fn replay(
        dir: impl AsRef<Path>,
        id: &str,
    ) -> Result<Vec<(EngineTime, PlainValue)>, EngineError> {
        let path = dir.as_ref().join(format!("{id}.jsonl"));
        let file = File::open(&path).map_err(|e| io_err("opening replay file", e))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| io_err("reading replay file", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: serde_json::Value = serde_json::from_str(&line)
                .map_err(|e| EngineError::internal(format!("malformed record line: {e}")))?;
            let time = parsed
                .get("time")
                .and_then(|t| t.as_i64())
                .ok_or_else(|| EngineError::internal("record missing time"))?;
            let value = parsed
                .get("value")
                .ok_or_else(|| EngineError::internal("record missing value"))?;
            records.push((EngineTime::from_micros(time), plain_from_json(value)?));
        }
        Ok(records)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(us: i64) -> EngineTime {
        EngineTime::from_micros(us)
    }

    #[test]
    fn records_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(dir.path()).unwrap();

        let first = PlainValue::Bundle(vec![PlainValue::scalar(1i64)]);
        let second = PlainValue::Bundle(vec![PlainValue::scalar(2i64)]);
        recorder.record("acct", t(10), &first).unwrap();
        recorder.record("acct", t(20), &second).unwrap();
        recorder.flush().unwrap();

        let replayed = Recorder::replay(dir.path(), "acct").unwrap();
        assert_eq!(replayed, vec![(t(10), first), (t(20), second)]);
    }

    #[test]
    fn separate_ids_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(dir.path()).unwrap();
        recorder.record("a", t(1), &PlainValue::scalar(1i64)).unwrap();
        recorder.record("b", t(1), &PlainValue::scalar(2i64)).unwrap();
        recorder.flush().unwrap();

        assert_eq!(Recorder::replay(dir.path(), "a").unwrap().len(), 1);
        assert_eq!(Recorder::replay(dir.path(), "b").unwrap().len(), 1);
    }
}
