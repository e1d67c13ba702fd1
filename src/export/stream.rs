use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;

/// Newline-delimited JSON output shared by the capture thread and the
/// traceroute workers. Each record is written and flushed under one lock so
/// lines never interleave.
#[derive(Clone)]
pub struct RecordSink {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl RecordSink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// In-memory sink plus a handle for reading back what was written
    pub fn memory() -> (Self, MemoryBuffer) {
        let buffer = MemoryBuffer::default();
        (Self::new(buffer.clone()), buffer)
    }

    /// Serialize `record` as one line
    pub fn emit<T: Serialize>(&self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut out = self.out.lock();
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}

/// Shared byte buffer behind `RecordSink::memory`
#[derive(Clone, Default)]
pub struct MemoryBuffer(Arc<Mutex<Vec<u8>>>);

impl MemoryBuffer {
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// Parsed JSON value of every line written so far
    pub fn values(&self) -> Vec<serde_json::Value> {
        self.lines()
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

impl Write for MemoryBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_one_record_per_line() {
        let (sink, buffer) = RecordSink::memory();
        sink.emit(&json!({"a": 1})).unwrap();
        sink.emit(&json!({"b": [1, 2]})).unwrap();

        assert_eq!(buffer.lines(), vec![r#"{"a":1}"#, r#"{"b":[1,2]}"#]);
    }

    #[test]
    fn test_concurrent_writers_do_not_interleave() {
        let (sink, buffer) = RecordSink::memory();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        sink.emit(&json!({"thread": t, "i": i, "pad": "x".repeat(200)}))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let values = buffer.values();
        assert_eq!(values.len(), 200);
        assert_eq!(buffer.lines().len(), 200);
    }
}
