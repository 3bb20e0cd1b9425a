//! Deps log: a binary append-only journal mapping an output node to its
//! discovered dependency list (headers pulled in by `deps = gcc|msvc`).
//!
//! Record framing: a 2-byte little-endian size field whose high bit marks
//! the record kind. A path record carries `size` bytes of UTF-8 path
//! padded to a 4-byte boundary, followed by the one's-complement of the
//! record's assigned id (a cheap concurrent-writer check). A deps record
//! carries `output_id: u32`, `output_mtime: i64` truncated to 4 bytes on
//! disk as `u32`, then `(size-8)/4` input ids.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;

use crate::error::LogError;

const SIGNATURE: &[u8] = b"# ninjadeps\n";
const CURRENT_VERSION: u32 = 1;
const MAX_RECORD_SIZE: usize = (1 << 15) - 1;
const DEPS_BIT: u16 = 0x8000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepsRecord {
    pub mtime: i64,
    pub inputs: Vec<u32>,
}

#[derive(Default)]
pub struct DepsLog {
    /// id -> path, dense in first-seen order (invariant 6: ids referenced
    /// by a deps record always precede it in file order).
    pub paths: Vec<String>,
    path_to_id: HashMap<String, u32>,
    pub deps: HashMap<u32, DepsRecord>,
    dead_record_count: usize,
    /// Count of `paths` already appended to the open log file, so
    /// `append_record` only emits path records for newly interned paths.
    flushed_path_count: usize,
}

impl DepsLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id_for(&mut self, path: &str) -> u32 {
        if let Some(&id) = self.path_to_id.get(path) {
            return id;
        }
        let id = self.paths.len() as u32;
        self.paths.push(path.to_string());
        self.path_to_id.insert(path.to_string(), id);
        id
    }

    pub fn lookup_id(&self, path: &str) -> Option<u32> {
        self.path_to_id.get(path).copied()
    }

    pub fn record_deps(&mut self, output: &str, mtime: i64, inputs: &[String]) -> bool {
        let out_id = self.id_for(output);
        let input_ids: Vec<u32> = inputs.iter().map(|p| self.id_for(p)).collect();
        let changed = match self.deps.get(&out_id) {
            Some(existing) => existing.mtime != mtime || existing.inputs != input_ids,
            None => true,
        };
        if changed {
            self.deps.insert(out_id, DepsRecord { mtime, inputs: input_ids });
        }
        changed
    }

    pub fn get(&self, output: &str) -> Option<&DepsRecord> {
        self.path_to_id.get(output).and_then(|id| self.deps.get(id))
    }

    pub fn load(path: &Path) -> Result<Self, LogError> {
        let mut log = DepsLog::new();
        let mut bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(log),
            Err(e) => return Err(LogError::Io { path: path.to_path_buf(), source: e }),
        };

        if bytes.len() < SIGNATURE.len() + 4 || &bytes[..SIGNATURE.len()] != SIGNATURE {
            tracing::warn!(target: "nicorn::deps_log", "bad deps log signature or version; starting over");
            return Ok(log);
        }
        let version = u32::from_le_bytes(bytes[SIGNATURE.len()..SIGNATURE.len() + 4].try_into().unwrap());
        if version != CURRENT_VERSION {
            tracing::warn!(target: "nicorn::deps_log", "bad deps log signature or version; starting over");
            return Ok(log);
        }

        let mut cursor = SIGNATURE.len() + 4;
        let mut next_expected_id: u32 = 0;
        loop {
            if cursor + 2 > bytes.len() {
                break;
            }
            let raw_size = u16::from_le_bytes([bytes[cursor], bytes[cursor + 1]]);
            cursor += 2;
            let is_deps = raw_size & DEPS_BIT != 0;
            let size = (raw_size & !DEPS_BIT) as usize;
            if cursor + size > bytes.len() {
                tracing::warn!(target: "nicorn::deps_log", "premature end of file; recovering");
                bytes.truncate(cursor - 2);
                break;
            }
            let record = &bytes[cursor..cursor + size];
            cursor += size;

            if is_deps {
                if size < 8 || size % 4 != 0 {
                    tracing::warn!(target: "nicorn::deps_log", "malformed deps record; recovering");
                    break;
                }
                let output_id = u32::from_le_bytes(record[0..4].try_into().unwrap());
                let mtime = u32::from_le_bytes(record[4..8].try_into().unwrap()) as i64;
                let input_count = (size - 8) / 4;
                let mut inputs = Vec::with_capacity(input_count);
                for i in 0..input_count {
                    let off = 8 + i * 4;
                    inputs.push(u32::from_le_bytes(record[off..off + 4].try_into().unwrap()));
                }
                if log.deps.contains_key(&output_id) {
                    log.dead_record_count += 1;
                }
                log.deps.insert(output_id, DepsRecord { mtime, inputs });
            } else {
                if size < 4 {
                    tracing::warn!(target: "nicorn::deps_log", "malformed path record; recovering");
                    break;
                }
                let checksum = u32::from_le_bytes(record[size - 4..size].try_into().unwrap());
                let path_bytes = &record[..size - 4];
                let path_str = std::str::from_utf8(path_bytes).unwrap_or("").trim_end_matches('\0').to_string();
                let expected_id = next_expected_id;
                if !checksum != expected_id {
                    tracing::warn!(target: "nicorn::deps_log", "concurrent writer detected; discarding record");
                    continue;
                }
                log.paths.push(path_str.clone());
                log.path_to_id.insert(path_str, expected_id);
                next_expected_id += 1;
            }
        }
        log.flushed_path_count = log.paths.len();
        Ok(log)
    }

    /// Append one deps record (and any newly-interned path records it
    /// introduced since the last flush) directly to the open log file,
    /// writing the header first if the file is new or empty. Mirrors
    /// `BuildLog::append_record` so a deps record survives without
    /// requiring a full `recompact`.
    pub fn append_record(&mut self, path: &Path, output: &str, mtime: i64, inputs: &[String]) -> Result<bool, LogError> {
        let changed = self.record_deps(output, mtime, inputs);
        if !changed {
            return Ok(false);
        }
        let needs_header = !path.exists() || std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| LogError::Io { path: path.to_path_buf(), source: e })?;
        if needs_header {
            self.write_header(&mut f).map_err(|e| LogError::Io { path: path.to_path_buf(), source: e })?;
        }
        while self.flushed_path_count < self.paths.len() {
            let id = self.flushed_path_count as u32;
            let p = self.paths[self.flushed_path_count].clone();
            self.write_path_record(&mut f, &p, id).map_err(|e| LogError::Io { path: path.to_path_buf(), source: e })?;
            self.flushed_path_count += 1;
        }
        let out_id = self.lookup_id(output).expect("record_deps just interned it");
        let record = self.deps.get(&out_id).expect("record_deps just inserted it").clone();
        self.write_record(&mut f, out_id, &record).map_err(|e| LogError::Io { path: path.to_path_buf(), source: e })?;
        Ok(true)
    }

    /// Append every path that hasn't yet been written to `path`, then append
    /// one deps record. Callers pass a fresh `io::Write` sink positioned at
    /// end-of-file.
    pub fn write_record(&self, sink: &mut impl Write, output_id: u32, record: &DepsRecord) -> std::io::Result<()> {
        let mut size = 4 + 4 + record.inputs.len() * 4;
        let truncated_inputs = if size > MAX_RECORD_SIZE {
            tracing::warn!(target: "nicorn::deps_log", "deps record for id {output_id} truncated to fit the size cap");
            let max_inputs = (MAX_RECORD_SIZE - 8) / 4;
            size = 8 + max_inputs * 4;
            &record.inputs[..max_inputs]
        } else {
            &record.inputs[..]
        };
        let raw_size = (size as u16) | DEPS_BIT;
        sink.write_all(&raw_size.to_le_bytes())?;
        sink.write_all(&output_id.to_le_bytes())?;
        sink.write_all(&(record.mtime as u32).to_le_bytes())?;
        for &id in truncated_inputs {
            sink.write_all(&id.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn write_path_record(&self, sink: &mut impl Write, path: &str, id: u32) -> std::io::Result<()> {
        let mut bytes = path.as_bytes().to_vec();
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        let size = bytes.len() + 4;
        let raw_size = size as u16;
        sink.write_all(&raw_size.to_le_bytes())?;
        sink.write_all(&bytes)?;
        sink.write_all(&(!id).to_le_bytes())?;
        Ok(())
    }

    pub fn write_header(&self, sink: &mut impl Write) -> std::io::Result<()> {
        sink.write_all(SIGNATURE)?;
        sink.write_all(&CURRENT_VERSION.to_le_bytes())
    }

    pub fn dead_record_count(&self) -> usize {
        self.dead_record_count
    }

    pub fn needs_recompaction(&self) -> bool {
        self.dead_record_count * 2 > self.deps.len().max(1)
    }

    /// Rewrite the log from scratch, reassigning dense ids in first-seen
    /// order among entries that are still live.
    pub fn recompact(&mut self, path: &Path, is_path_dead: impl Fn(&str) -> bool) -> Result<(), LogError> {
        let live_outputs: Vec<u32> = self
            .deps
            .keys()
            .copied()
            .filter(|id| self.paths.get(*id as usize).map(|p| !is_path_dead(p)).unwrap_or(false))
            .collect();

        let mut new_log = DepsLog::new();
        let mut buf = Vec::new();
        new_log.write_header(&mut buf).map_err(|e| LogError::Io { path: path.to_path_buf(), source: e })?;
        let mut written: HashSet<u32> = HashSet::new();

        let mut emit_path = |new_log: &mut DepsLog, buf: &mut Vec<u8>, p: &str| -> std::io::Result<u32> {
            let id = new_log.id_for(p);
            if written.insert(id) {
                new_log.write_path_record(buf, p, id)?;
            }
            Ok(id)
        };

        for &old_out_id in &live_outputs {
            let record = self.deps.get(&old_out_id).unwrap().clone();
            let out_path = self.paths[old_out_id as usize].clone();
            let input_paths: Vec<String> = record.inputs.iter().map(|&id| self.paths[id as usize].clone()).collect();

            let new_out_id = emit_path(&mut new_log, &mut buf, &out_path).map_err(|e| LogError::Io { path: path.to_path_buf(), source: e })?;
            let mut new_inputs = Vec::with_capacity(input_paths.len());
            for p in &input_paths {
                let id = emit_path(&mut new_log, &mut buf, p).map_err(|e| LogError::Io { path: path.to_path_buf(), source: e })?;
                new_inputs.push(id);
            }
            let new_record = DepsRecord { mtime: record.mtime, inputs: new_inputs };
            new_log
                .write_record(&mut buf, new_out_id, &new_record)
                .map_err(|e| LogError::Io { path: path.to_path_buf(), source: e })?;
            new_log.deps.insert(new_out_id, new_record);
        }

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &buf).map_err(|e| LogError::Io { path: path.to_path_buf(), source: e })?;
        std::fs::rename(&tmp, path).map_err(|e| LogError::Io { path: path.to_path_buf(), source: e })?;
        new_log.flushed_path_count = new_log.paths.len();
        *self = new_log;
        Ok(())
    }
}
