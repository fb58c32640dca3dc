//! Streaming key/value record format.
//!
//! A record file is a back-to-back sequence of JSON objects, one per line.
//! There is no header or trailer: readers decode records until end of file.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use atomicwrites::{AllowOverwrite, AtomicFile};
use serde_json::de::IoRead;
use serde_json::{Deserializer, StreamDeserializer};

use crate::KeyValue;

/// Appends records to a writer.
pub struct RecordWriter<W: Write> {
    inner: BufWriter<W>,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
        }
    }

    pub fn write(&mut self, kv: &KeyValue) -> io::Result<()> {
        serde_json::to_writer(&mut self.inner, kv)?;
        self.inner.write_all(b"\n")
    }

    /// Flushes buffered records. Dropping the writer without calling this
    /// swallows write errors.
    pub fn finish(mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decodes records one at a time until end of stream.
pub struct RecordReader<R: Read> {
    stream: StreamDeserializer<'static, IoRead<BufReader<R>>, KeyValue>,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            stream: Deserializer::from_reader(BufReader::new(inner)).into_iter(),
        }
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = io::Result<KeyValue>;

    fn next(&mut self) -> Option<Self::Item> {
        self.stream.next().map(|r| r.map_err(io::Error::from))
    }
}

/// Writes `records` to `path`, replacing it atomically.
///
/// The records go to a temporary file next to `path` which is renamed over
/// it once complete, so readers never observe a partially written file.
pub fn write_records<I>(path: &Path, records: I) -> Result<()>
where
    I: IntoIterator<Item = KeyValue>,
{
    AtomicFile::new(path, AllowOverwrite)
        .write(|f| {
            let mut w = RecordWriter::new(f);
            for kv in records {
                w.write(&kv)?;
            }
            w.finish()
        })
        .with_context(|| format!("unable to write records to {}", path.display()))
}

/// Opens `path` for record decoding.
pub fn open_records(path: &Path) -> io::Result<RecordReader<File>> {
    File::open(path).map(RecordReader::new)
}
