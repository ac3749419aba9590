//! Receiver queue that spills to disk once its memory cache fills up.
//!
//! The queue alternates between two spill files so that one can be written
//! while the other is drained. The write target and read source per state:
//!
//! ```text
//! MemoryMemory --memory full--> File1Memory --memory empty--> MemoryFile1
//! MemoryFile1  --memory full--> File2File1  --file1 empty--> File2Memory
//! MemoryFile2  --memory full--> File1File2  --file2 empty--> File1Memory
//! ```
//!
//! FIFO order is preserved across the spill boundary: everything in memory
//! was enqueued before anything in the file currently being written.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::PathBuf;

use parking_lot::Mutex;
use tessera_error::{Result, ResultExt, TesseraError};

use crate::mapping::Mapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueStatus {
    MemoryMemory,
    File1Memory,
    MemoryFile1,
    File2File1,
    File2Memory,
    MemoryFile2,
    File1File2,
    Closed,
}

#[derive(Debug)]
struct SpillFile {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    reader: Option<BufReader<File>>,
}

impl SpillFile {
    fn new(path: PathBuf) -> Self {
        SpillFile {
            path,
            writer: None,
            reader: None,
        }
    }

    fn append(&mut self, record: &[u8]) -> Result<()> {
        if self.writer.is_none() {
            let file = File::create(&self.path).context("creating spill file")?;
            self.writer = Some(BufWriter::new(file));
        }
        let writer = self.writer.as_mut().expect("writer just created");
        writer
            .write_all(&(record.len() as u32).to_be_bytes())
            .context("writing spill record length")?;
        writer
            .write_all(record)
            .context("writing spill record")?;
        Ok(())
    }

    fn close_writer(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().context("flushing spill file")?;
        }
        Ok(())
    }

    /// Next record, or `None` once the file is exhausted. Exhaustion resets
    /// the file for reuse.
    fn read_next(&mut self) -> Result<Option<Vec<u8>>> {
        if self.reader.is_none() {
            match File::open(&self.path) {
                Ok(file) => self.reader = Some(BufReader::new(file)),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Ok(None);
                }
                Err(e) => return Err(e).context("opening spill file"),
            }
        }
        let reader = self.reader.as_mut().expect("reader just created");
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.reader = None;
                // Truncate so the next write cycle starts clean.
                File::create(&self.path).context("resetting spill file")?;
                return Ok(None);
            }
            Err(e) => return Err(e).context("reading spill record length"),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        let mut record = vec![0u8; len];
        reader
            .read_exact(&mut record)
            .context("reading spill record")?;
        Ok(Some(record))
    }
}

#[derive(Debug)]
struct Inner {
    max_cache_size: usize,
    cache: VecDeque<Vec<u8>>,
    file1: SpillFile,
    file2: SpillFile,
    status: QueueStatus,
    size: u64,
    directory: PathBuf,
}

/// Spill-capable FIFO of raw mapping records. Safe for concurrent producers
/// and a single consumer.
#[derive(Debug)]
pub struct CachedReceiverQueue {
    inner: Mutex<Inner>,
}

impl CachedReceiverQueue {
    pub fn new(max_cache_size: usize, directory: PathBuf, queue_id: usize) -> Result<Self> {
        fs::create_dir_all(&directory).context("creating spill directory")?;
        Ok(CachedReceiverQueue {
            inner: Mutex::new(Inner {
                max_cache_size: std::cmp::max(1, max_cache_size),
                cache: VecDeque::new(),
                file1: SpillFile::new(directory.join(format!("queue{queue_id}_spill1"))),
                file2: SpillFile::new(directory.join(format!("queue{queue_id}_spill2"))),
                status: QueueStatus::MemoryMemory,
                size: 0,
                directory,
            }),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().size == 0
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().status == QueueStatus::Closed
    }

    pub fn enqueue(&self, record: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.status {
            QueueStatus::Closed => {
                return Err(TesseraError::new("queue has already been closed"));
            }
            QueueStatus::MemoryMemory | QueueStatus::MemoryFile1 | QueueStatus::MemoryFile2 => {
                inner.cache.push_back(record.to_vec());
                if inner.cache.len() >= inner.max_cache_size {
                    inner.status = match inner.status {
                        QueueStatus::MemoryMemory => QueueStatus::File1Memory,
                        QueueStatus::MemoryFile1 => QueueStatus::File2File1,
                        QueueStatus::MemoryFile2 => QueueStatus::File1File2,
                        _ => unreachable!(),
                    };
                }
            }
            QueueStatus::File1Memory | QueueStatus::File1File2 => {
                inner.file1.append(record)?;
            }
            QueueStatus::File2Memory | QueueStatus::File2File1 => {
                inner.file2.append(record)?;
            }
        }
        inner.size += 1;
        Ok(())
    }

    pub fn dequeue(&self) -> Result<Option<Mapping>> {
        let mut inner = self.inner.lock();
        if inner.status == QueueStatus::Closed {
            return Err(TesseraError::new("queue has already been closed"));
        }
        let record = inner.next_record()?;
        if record.is_some() {
            inner.size -= 1;
        }
        Ok(record.map(|bytes| Mapping::from_bytes(&bytes)))
    }

    /// Close the queue and delete its spill files. Further enqueues are
    /// rejected.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.status = QueueStatus::Closed;
        inner.cache.clear();
        let _ = inner.file1.close_writer();
        let _ = inner.file2.close_writer();
        inner.file1.reader = None;
        inner.file2.reader = None;
        let _ = fs::remove_file(&inner.file1.path);
        let _ = fs::remove_file(&inner.file2.path);
        let _ = fs::remove_dir(&inner.directory);
    }
}

impl Inner {
    fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        match self.status {
            QueueStatus::MemoryMemory | QueueStatus::File1Memory | QueueStatus::File2Memory => {
                self.dequeue_memory()
            }
            QueueStatus::MemoryFile1 | QueueStatus::File2File1 => {
                match self.file1.read_next()? {
                    Some(record) => Ok(Some(record)),
                    None => {
                        self.status = match self.status {
                            QueueStatus::MemoryFile1 => QueueStatus::MemoryMemory,
                            QueueStatus::File2File1 => QueueStatus::File2Memory,
                            _ => unreachable!(),
                        };
                        self.dequeue_memory()
                    }
                }
            }
            QueueStatus::MemoryFile2 | QueueStatus::File1File2 => {
                match self.file2.read_next()? {
                    Some(record) => Ok(Some(record)),
                    None => {
                        self.status = match self.status {
                            QueueStatus::MemoryFile2 => QueueStatus::MemoryMemory,
                            QueueStatus::File1File2 => QueueStatus::File1Memory,
                            _ => unreachable!(),
                        };
                        self.dequeue_memory()
                    }
                }
            }
            QueueStatus::Closed => unreachable!("checked by caller"),
        }
    }

    fn dequeue_memory(&mut self) -> Result<Option<Vec<u8>>> {
        let record = self.cache.pop_front();
        if self.cache.is_empty() {
            match self.status {
                QueueStatus::File1Memory => {
                    self.status = QueueStatus::MemoryFile1;
                    self.file1.close_writer()?;
                }
                QueueStatus::File2Memory => {
                    self.status = QueueStatus::MemoryFile2;
                    self.file2.close_writer()?;
                }
                _ => {}
            }
        }
        Ok(record)
    }
}
