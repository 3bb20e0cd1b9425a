//! Build log: a text journal mapping output path to (start_ms, end_ms,
//! output_mtime, command_hash). Last record for a path wins.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::LogError;

pub const CURRENT_VERSION: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLogEntry {
    pub start_ms: u64,
    pub end_ms: u64,
    pub output_mtime: i64,
    pub command_hash: u64,
}

#[derive(Default)]
pub struct BuildLog {
    pub entries: HashMap<String, BuildLogEntry>,
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an existing log, tolerating truncation and version mismatch by
    /// starting fresh (the caller re-opens for write afterward).
    pub fn load(path: &Path) -> Result<Self, LogError> {
        let mut log = BuildLog { entries: HashMap::new() };
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(log),
            Err(e) => return Err(LogError::Io { path: path.to_path_buf(), source: e }),
        };

        let mut lines = content.lines();
        let header = match lines.next() {
            Some(h) => h,
            None => return Ok(log),
        };
        if parse_version(header) != Some(CURRENT_VERSION) {
            tracing::warn!(target: "nicorn::build_log", "bad build log signature or version; starting over");
            return Ok(log);
        }

        for line in lines {
            match parse_record(line) {
                Some((path, entry)) => {
                    log.entries.insert(path, entry);
                }
                None => {
                    tracing::warn!(target: "nicorn::build_log", "skipping malformed build log line");
                }
            }
        }
        Ok(log)
    }

    pub fn record(&mut self, output: &str, entry: BuildLogEntry) {
        self.entries.insert(output.to_string(), entry);
    }

    pub fn get(&self, output: &str) -> Option<&BuildLogEntry> {
        self.entries.get(output)
    }

    /// Append the header (if the file doesn't already have one) and every
    /// record, replacing whatever is on disk. Appends are cheap (see
    /// `append_record`); this full rewrite is only used by recompaction and
    /// by fresh opens after a version mismatch.
    pub fn write_all(&self, path: &Path) -> Result<(), LogError> {
        let mut out = String::new();
        out.push_str(&format!("# ninja log v{CURRENT_VERSION}\n"));
        for (output, e) in &self.entries {
            out.push_str(&format!("{}\t{}\t{}\t{}\t{:x}\n", e.start_ms, e.end_ms, e.output_mtime, output, e.command_hash));
        }
        std::fs::write(path, out).map_err(|e| LogError::Io { path: path.to_path_buf(), source: e })
    }

    /// Append one record to the on-disk log, writing the header first if
    /// the file is new or empty.
    pub fn append_record(&self, path: &Path, output: &str, entry: &BuildLogEntry) -> Result<(), LogError> {
        let needs_header = !path.exists() || std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| LogError::Io { path: path.to_path_buf(), source: e })?;
        if needs_header {
            writeln!(f, "# ninja log v{CURRENT_VERSION}").map_err(|e| LogError::Io { path: path.to_path_buf(), source: e })?;
        }
        writeln!(f, "{}\t{}\t{}\t{}\t{:x}", entry.start_ms, entry.end_ms, entry.output_mtime, output, entry.command_hash)
            .map_err(|e| LogError::Io { path: path.to_path_buf(), source: e })
    }

    /// Rewrite the log keeping only entries whose output is still live,
    /// per `is_path_dead`, then atomically replace the original file.
    pub fn recompact(&mut self, path: &Path, is_path_dead: impl Fn(&str) -> bool) -> Result<(), LogError> {
        self.entries.retain(|output, _| !is_path_dead(output));
        let tmp = path.with_extension("tmp");
        self.write_all(&tmp)?;
        std::fs::rename(&tmp, path).map_err(|e| LogError::Io { path: path.to_path_buf(), source: e })
    }
}

fn parse_version(header: &str) -> Option<u32> {
    header.strip_prefix("# ninja log v")?.trim().parse().ok()
}

fn parse_record(line: &str) -> Option<(String, BuildLogEntry)> {
    let mut fields = line.splitn(5, '\t');
    let start_ms: u64 = fields.next()?.parse().ok()?;
    let end_ms: u64 = fields.next()?.parse().ok()?;
    let output_mtime: i64 = fields.next()?.parse().ok()?;
    let output = fields.next()?.to_string();
    let hash_hex = fields.next()?;
    let command_hash = u64::from_str_radix(hash_hex, 16).ok()?;
    Some((output, BuildLogEntry { start_ms, end_ms, output_mtime, command_hash }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_record_wins() {
        let mut log = BuildLog::new();
        log.record("out", BuildLogEntry { start_ms: 0, end_ms: 1, output_mtime: 5, command_hash: 0xdead });
        log.record("out", BuildLogEntry { start_ms: 2, end_ms: 3, output_mtime: 7, command_hash: 0xbeef });
        assert_eq!(log.get("out").unwrap().command_hash, 0xbeef);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".ninja_log");
        let mut log = BuildLog::new();
        log.record("a.o", BuildLogEntry { start_ms: 10, end_ms: 20, output_mtime: 100, command_hash: 42 });
        log.record("b.o", BuildLogEntry { start_ms: 11, end_ms: 22, output_mtime: 101, command_hash: 43 });
        log.write_all(&path).unwrap();

        let reloaded = BuildLog::load(&path).unwrap();
        assert_eq!(reloaded.entries.len(), 2);
        assert_eq!(reloaded.get("a.o").unwrap().command_hash, 42);
    }

    #[test]
    fn bad_header_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".ninja_log");
        std::fs::write(&path, "not a header\n1\t2\t3\tfoo\tabc\n").unwrap();
        let log = BuildLog::load(&path).unwrap();
        assert!(log.entries.is_empty());
    }

    #[test]
    fn malformed_line_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".ninja_log");
        std::fs::write(&path, format!("# ninja log v{CURRENT_VERSION}\ngarbage line\n10\t20\t5\tout\tff\n")).unwrap();
        let log = BuildLog::load(&path).unwrap();
        assert_eq!(log.entries.len(), 1);
    }

    #[test]
    fn recompact_drops_dead_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".ninja_log");
        let mut log = BuildLog::new();
        log.record("live", BuildLogEntry { start_ms: 0, end_ms: 1, output_mtime: 1, command_hash: 1 });
        log.record("dead", BuildLogEntry { start_ms: 0, end_ms: 1, output_mtime: 1, command_hash: 2 });
        log.write_all(&path).unwrap();
        log.recompact(&path, |p| p == "dead").unwrap();
        assert_eq!(log.entries.len(), 1);
        let reloaded = BuildLog::load(&path).unwrap();
        assert_eq!(reloaded.entries.len(), 1);
        assert!(reloaded.get("live").is_some());
    }
}
