//! Hash-bucketed mapping storage for one join side.
//!
//! Each bucket keeps mappings in memory up to a budget and appends the
//! overflow to a per-bucket spill file. Buckets are selected by the hash of
//! the first join variable's value; all match candidates for a probe are
//! therefore confined to a single bucket.

use std::fs::{self, File};
use std::hash::Hasher;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use ahash::AHasher;
use tessera_error::{Result, ResultExt};

use crate::mapping::Mapping;

/// Bucket index for a join key value.
pub fn bucket_for(value: u64, bucket_count: usize) -> usize {
    let mut hasher = AHasher::default();
    hasher.write_u64(value);
    (hasher.finish() % bucket_count as u64) as usize
}

#[derive(Debug)]
struct Bucket {
    memory: Vec<Mapping>,
    spill_path: PathBuf,
    writer: Option<BufWriter<File>>,
    spilled: u64,
}

impl Bucket {
    fn new(spill_path: PathBuf) -> Self {
        Bucket {
            memory: Vec::new(),
            spill_path,
            writer: None,
            spilled: 0,
        }
    }

    fn append(&mut self, mapping: Mapping, memory_limit: usize) -> Result<()> {
        if self.memory.len() < memory_limit {
            self.memory.push(mapping);
            return Ok(());
        }
        if self.writer.is_none() {
            let file = File::create(&self.spill_path).context("creating join spill file")?;
            self.writer = Some(BufWriter::new(file));
        }
        let writer = self.writer.as_mut().expect("writer just created");
        let bytes = mapping.as_bytes();
        writer
            .write_all(&(bytes.len() as u32).to_be_bytes())
            .context("writing join spill length")?;
        writer.write_all(bytes).context("writing join spill record")?;
        self.spilled += 1;
        Ok(())
    }
}

/// Streaming position within one bucket: the in-memory portion first, then
/// the spill file record by record. The bucket must not be mutated while a
/// cursor on it is open.
///
/// Holding a cursor keeps at most one spilled record in memory at a time, so
/// probing a bucket never undoes the memory bound that made it spill.
#[derive(Debug)]
pub struct CandidateCursor {
    bucket: usize,
    memory_pos: usize,
    spill_read: u64,
    reader: Option<BufReader<File>>,
}

/// All mappings one join side has consumed so far.
#[derive(Debug)]
pub struct MappingSpillSet {
    buckets: Vec<Option<Bucket>>,
    memory_limit_per_bucket: usize,
    directory: PathBuf,
    name: &'static str,
    size: u64,
}

impl MappingSpillSet {
    pub fn new(
        memory_limit: usize,
        bucket_count: usize,
        directory: PathBuf,
        name: &'static str,
    ) -> Result<Self> {
        fs::create_dir_all(&directory).context("creating join spill directory")?;
        let bucket_count = std::cmp::max(1, bucket_count);
        Ok(MappingSpillSet {
            buckets: (0..bucket_count).map(|_| None).collect(),
            memory_limit_per_bucket: std::cmp::max(1, memory_limit / bucket_count),
            directory,
            name,
            size: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn add(&mut self, mapping: Mapping, bucket: usize) -> Result<()> {
        if self.buckets[bucket].is_none() {
            let path = self.directory.join(format!("{}_bucket{bucket}", self.name));
            self.buckets[bucket] = Some(Bucket::new(path));
        }
        self.buckets[bucket]
            .as_mut()
            .expect("bucket just created")
            .append(mapping, self.memory_limit_per_bucket)?;
        self.size += 1;
        Ok(())
    }

    /// Open a streaming cursor over the bucket in insertion order.
    pub fn cursor(&mut self, bucket: usize) -> Result<CandidateCursor> {
        if let Some(b) = self.buckets[bucket].as_mut() {
            if let Some(writer) = b.writer.as_mut() {
                writer.flush().context("flushing join spill file")?;
            }
        }
        Ok(CandidateCursor {
            bucket,
            memory_pos: 0,
            spill_read: 0,
            reader: None,
        })
    }

    /// The next mapping under the cursor, copied out for the caller, or
    /// `None` once the bucket is exhausted.
    pub fn next_candidate(&mut self, cursor: &mut CandidateCursor) -> Result<Option<Mapping>> {
        let Some(bucket) = self.buckets[cursor.bucket].as_mut() else {
            return Ok(None);
        };
        if let Some(mapping) = bucket.memory.get(cursor.memory_pos) {
            cursor.memory_pos += 1;
            return Ok(Some(Mapping::from_bytes(mapping.as_bytes())));
        }
        if cursor.spill_read >= bucket.spilled {
            return Ok(None);
        }
        if cursor.reader.is_none() {
            let file = File::open(&bucket.spill_path).context("opening join spill file")?;
            cursor.reader = Some(BufReader::new(file));
        }
        let reader = cursor.reader.as_mut().expect("reader just opened");
        let mut len_bytes = [0u8; 4];
        reader
            .read_exact(&mut len_bytes)
            .context("reading join spill length")?;
        let mut record = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
        reader
            .read_exact(&mut record)
            .context("reading join spill record")?;
        cursor.spill_read += 1;
        Ok(Some(Mapping::from_bytes(&record)))
    }

    /// Drop all contents and delete spill files.
    pub fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            if let Some(bucket) = bucket.take() {
                drop(bucket.writer);
                let _ = fs::remove_file(&bucket.spill_path);
            }
        }
        self.size = 0;
        let _ = fs::remove_dir(&self.directory);
    }
}

impl Drop for MappingSpillSet {
    fn drop(&mut self) {
        self.clear();
    }
}
