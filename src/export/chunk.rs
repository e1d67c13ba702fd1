use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::state::PacketRecord;

/// Default number of records per chunk file
pub const DEFAULT_CHUNK_SIZE: usize = 40;

/// Buffers packet records and writes them out as numbered JSON chunk files.
///
/// Files are named `<session_id>_chunk_<n>.json` with `n` starting at 1.
/// Owned by the capture thread; not shared.
#[derive(Debug)]
pub struct ChunkWriter {
    dir: PathBuf,
    session_id: String,
    chunk_size: usize,
    buffer: Vec<PacketRecord>,
    total_records: u64,
    next_index: u32,
}

impl ChunkWriter {
    /// Create the writer and its output directory
    pub fn new(dir: impl Into<PathBuf>, session_id: impl Into<String>, chunk_size: usize) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let chunk_size = chunk_size.max(1);
        Ok(Self {
            dir,
            session_id: session_id.into(),
            chunk_size,
            buffer: Vec::with_capacity(chunk_size),
            total_records: 0,
            next_index: 1,
        })
    }

    /// Session identifier derived from the session start time
    pub fn session_id_for(started_at: DateTime<Utc>) -> String {
        format!("session_{}", started_at.timestamp())
    }

    /// Buffer a record; writes a chunk every `chunk_size` records.
    /// Returns the path of the chunk written, if any.
    pub fn push(&mut self, record: PacketRecord) -> Result<Option<PathBuf>> {
        self.buffer.push(record);
        self.total_records += 1;

        if self.total_records % self.chunk_size as u64 == 0 {
            return self.flush();
        }
        Ok(None)
    }

    /// Write whatever is buffered as a chunk, even a partial one.
    /// Does nothing if the buffer is empty.
    pub fn flush(&mut self) -> Result<Option<PathBuf>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let path = self.chunk_path(self.next_index);
        // Index advances even if the write fails so a file is never reused
        self.next_index += 1;

        let records = std::mem::take(&mut self.buffer);
        write_chunk(&path, &records)
            .with_context(|| format!("Failed to write chunk file: {}", path.display()))?;

        Ok(Some(path))
    }

    pub fn chunk_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{}_chunk_{}.json", self.session_id, index))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Records waiting for the next chunk
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Chunks written so far
    pub fn chunks_written(&self) -> u32 {
        self.next_index - 1
    }
}

fn write_chunk(path: &Path, records: &[PacketRecord]) -> Result<()> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, records)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Transport;
    use std::net::Ipv4Addr;

    fn record(n: u32) -> PacketRecord {
        PacketRecord {
            timestamp: n as f64,
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            length: n,
            transport: Transport::Udp {
                src_port: 1000,
                dst_port: 53,
            },
        }
    }

    fn read_chunk(path: &Path) -> Vec<PacketRecord> {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_session_id_from_start_time() {
        let started = DateTime::from_timestamp(1700000000, 0).unwrap();
        assert_eq!(ChunkWriter::session_id_for(started), "session_1700000000");
    }

    #[test]
    fn test_full_chunk_flushes_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkWriter::new(dir.path(), "session_1", DEFAULT_CHUNK_SIZE).unwrap();

        for n in 0..39 {
            assert!(writer.push(record(n)).unwrap().is_none());
        }
        let path = writer.push(record(39)).unwrap().expect("chunk written at 40");

        assert_eq!(path, dir.path().join("session_1_chunk_1.json"));
        assert_eq!(writer.buffered(), 0);
        assert_eq!(writer.chunks_written(), 1);

        let records = read_chunk(&path);
        assert_eq!(records.len(), 40);
        assert_eq!(records[0], record(0));
        assert_eq!(records[39], record(39));
    }

    #[test]
    fn test_partial_chunk_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkWriter::new(dir.path(), "session_2", DEFAULT_CHUNK_SIZE).unwrap();

        for n in 0..39 {
            writer.push(record(n)).unwrap();
        }
        assert_eq!(writer.chunks_written(), 0);

        let path = writer.flush().unwrap().unwrap();
        assert_eq!(path, dir.path().join("session_2_chunk_1.json"));
        assert_eq!(read_chunk(&path).len(), 39);

        // Nothing left: second flush is a no-op
        assert!(writer.flush().unwrap().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_indices_increase() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkWriter::new(dir.path(), "s", 2).unwrap();

        for n in 0..5 {
            writer.push(record(n)).unwrap();
        }
        writer.flush().unwrap();

        assert!(dir.path().join("s_chunk_1.json").exists());
        assert!(dir.path().join("s_chunk_2.json").exists());
        assert_eq!(read_chunk(&dir.path().join("s_chunk_3.json")), vec![record(4)]);
    }

    #[test]
    fn test_existing_chunk_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("s_chunk_1.json"), "keep").unwrap();

        let mut writer = ChunkWriter::new(dir.path(), "s", 1).unwrap();
        assert!(writer.push(record(0)).is_err());
        assert_eq!(fs::read_to_string(dir.path().join("s_chunk_1.json")).unwrap(), "keep");

        // The failed index is skipped, not retried
        let path = writer.push(record(1)).unwrap().unwrap();
        assert_eq!(path, dir.path().join("s_chunk_2.json"));
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("captures").join("today");
        let mut writer = ChunkWriter::new(&nested, "s", 1).unwrap();
        writer.push(record(0)).unwrap();
        assert!(nested.join("s_chunk_1.json").exists());
    }
}
