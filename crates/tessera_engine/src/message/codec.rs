//! Byte-level encoding and decoding of control and batch messages.
//!
//! All integers are big-endian. Mapping records inside a batch are
//! self-describing through the 4-byte total length field at a fixed offset
//! within each record.

use tessera_error::{Result, TesseraError};

use super::types::MessageType;
use crate::ident::TaskId;
use crate::mapping::{OFFSET_LENGTH, OFFSET_RECEIVER, read_u32, read_u64};

/// `[tag][4B query id][serialized operator tree]`
pub fn encode_query_create(query_id: u32, tree: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + tree.len());
    buf.push(MessageType::QueryCreate as u8);
    buf.extend_from_slice(&query_id.to_be_bytes());
    buf.extend_from_slice(tree);
    buf
}

pub fn decode_query_create(data: &[u8]) -> Result<(u32, &[u8])> {
    ensure_len(data, 5, "query create")?;
    Ok((read_u32(data, 1), &data[5..]))
}

/// `[tag][2B slave id][8B coordinator id]`
pub fn encode_query_created(slave: u16, coordinator: TaskId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(11);
    buf.push(MessageType::QueryCreated as u8);
    buf.extend_from_slice(&slave.to_be_bytes());
    buf.extend_from_slice(&coordinator.0.to_be_bytes());
    buf
}

pub fn decode_query_created(data: &[u8]) -> Result<(u16, TaskId)> {
    ensure_len(data, 11, "query created")?;
    Ok((read_u16(data, 1), TaskId(read_u64(data, 3))))
}

/// `[tag][4B query id]`
pub fn encode_query_start(query_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    buf.push(MessageType::QueryStart as u8);
    buf.extend_from_slice(&query_id.to_be_bytes());
    buf
}

pub fn decode_query_start(data: &[u8]) -> Result<u32> {
    ensure_len(data, 5, "query start")?;
    Ok(read_u32(data, 1))
}

/// `[tag][4B query id]`
pub fn encode_query_abortion(query_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    buf.push(MessageType::QueryAbortion as u8);
    buf.extend_from_slice(&query_id.to_be_bytes());
    buf
}

pub fn decode_query_abortion(data: &[u8]) -> Result<u32> {
    ensure_len(data, 5, "query abortion")?;
    Ok(read_u32(data, 1))
}

/// `[tag][2B sender slave][8B finished task id]`, sent to the finished
/// task's sibling instances.
pub fn encode_query_task_finished(sender_slave: u16, finished_task: TaskId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(11);
    buf.push(MessageType::QueryTaskFinished as u8);
    buf.extend_from_slice(&sender_slave.to_be_bytes());
    buf.extend_from_slice(&finished_task.0.to_be_bytes());
    buf
}

/// `[tag][2B sender slave][8B coordinator id][8B finished task id]`, the
/// variant a finished tree root sends to the coordinator.
pub fn encode_query_task_finished_to_coordinator(
    sender_slave: u16,
    coordinator: TaskId,
    finished_task: TaskId,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(19);
    buf.push(MessageType::QueryTaskFinished as u8);
    buf.extend_from_slice(&sender_slave.to_be_bytes());
    buf.extend_from_slice(&coordinator.0.to_be_bytes());
    buf.extend_from_slice(&finished_task.0.to_be_bytes());
    buf
}

#[derive(Debug, PartialEq, Eq)]
pub enum TaskFinished {
    /// Peer-to-peer notification; the id is the finished task instance.
    Sibling { sender_slave: u16, task: TaskId },
    /// Root-to-coordinator notification.
    Coordinator {
        sender_slave: u16,
        coordinator: TaskId,
        task: TaskId,
    },
}

pub fn decode_query_task_finished(data: &[u8]) -> Result<TaskFinished> {
    match data.len() {
        11 => Ok(TaskFinished::Sibling {
            sender_slave: read_u16(data, 1),
            task: TaskId(read_u64(data, 3)),
        }),
        19 => Ok(TaskFinished::Coordinator {
            sender_slave: read_u16(data, 1),
            coordinator: TaskId(read_u64(data, 3)),
            task: TaskId(read_u64(data, 11)),
        }),
        other => Err(TesseraError::new(format!(
            "query task finished message of unexpected length {other}"
        ))),
    }
}

/// `[tag][2B sender slave][8B coordinator id][utf8 error text]`
pub fn encode_query_task_failed(sender_slave: u16, coordinator: TaskId, message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(11 + message.len());
    buf.push(MessageType::QueryTaskFailed as u8);
    buf.extend_from_slice(&sender_slave.to_be_bytes());
    buf.extend_from_slice(&coordinator.0.to_be_bytes());
    buf.extend_from_slice(message.as_bytes());
    buf
}

pub fn decode_query_task_failed(data: &[u8]) -> Result<(u16, TaskId, String)> {
    ensure_len(data, 11, "query task failed")?;
    let message = String::from_utf8(data[11..].to_vec())?;
    Ok((read_u16(data, 1), TaskId(read_u64(data, 3)), message))
}

/// Builds `[tag][2B sender slave][mapping records...]`.
pub fn encode_mapping_batch<'a>(
    sender_slave: u16,
    records: impl Iterator<Item = &'a [u8]>,
) -> Vec<u8> {
    let mut buf = vec![MessageType::QueryMappingBatch as u8];
    buf.extend_from_slice(&sender_slave.to_be_bytes());
    for record in records {
        buf.extend_from_slice(record);
    }
    buf
}

/// Iterator over the mapping records of a batch message.
#[derive(Debug)]
pub struct BatchRecords<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BatchRecords<'a> {
    pub fn new(batch: &'a [u8]) -> Result<(u16, BatchRecords<'a>)> {
        ensure_len(batch, 3, "mapping batch")?;
        Ok((
            read_u16(batch, 1),
            BatchRecords {
                data: batch,
                offset: 3,
            },
        ))
    }
}

impl<'a> Iterator for BatchRecords<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        if self.offset + OFFSET_LENGTH + 4 > self.data.len() {
            self.offset = self.data.len();
            return Some(Err(TesseraError::new("truncated mapping record header")));
        }
        let len = read_u32(self.data, self.offset + OFFSET_LENGTH) as usize;
        if len < OFFSET_LENGTH + 4 || self.offset + len > self.data.len() {
            self.offset = self.data.len();
            return Some(Err(TesseraError::new(format!(
                "mapping record of length {len} exceeds batch"
            ))));
        }
        let record = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Some(Ok(record))
    }
}

/// Receiver id of a single mapping record.
pub fn record_receiver(record: &[u8]) -> TaskId {
    TaskId(read_u64(record, OFFSET_RECEIVER))
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_be_bytes(bytes)
}

fn ensure_len(data: &[u8], min: usize, what: &str) -> Result<()> {
    if data.len() < min {
        return Err(TesseraError::new(format!(
            "{what} message too short: {} bytes",
            data.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingPool;

    #[test]
    fn control_round_trips() {
        let coordinator = TaskId::new(0, 3, 0);

        let encoded = encode_query_create(3, &[1, 2, 3]);
        let (query, tree) = decode_query_create(&encoded).unwrap();
        assert_eq!(3, query);
        assert_eq!(&[1, 2, 3], tree);

        let (slave, coord) = decode_query_created(&encode_query_created(2, coordinator)).unwrap();
        assert_eq!(2, slave);
        assert_eq!(coordinator, coord);

        assert_eq!(7, decode_query_start(&encode_query_start(7)).unwrap());
        assert_eq!(7, decode_query_abortion(&encode_query_abortion(7)).unwrap());

        let (slave, coord, msg) =
            decode_query_task_failed(&encode_query_task_failed(1, coordinator, "join blew up"))
                .unwrap();
        assert_eq!(1, slave);
        assert_eq!(coordinator, coord);
        assert_eq!("join blew up", msg);
    }

    #[test]
    fn task_finished_variants_by_length() {
        let task = TaskId::new(2, 3, 4);
        let coordinator = TaskId::new(0, 3, 0);

        let sibling = decode_query_task_finished(&encode_query_task_finished(2, task)).unwrap();
        assert_eq!(
            TaskFinished::Sibling {
                sender_slave: 2,
                task
            },
            sibling
        );

        let to_coord = decode_query_task_finished(&encode_query_task_finished_to_coordinator(
            2,
            coordinator,
            task,
        ))
        .unwrap();
        assert_eq!(
            TaskFinished::Coordinator {
                sender_slave: 2,
                coordinator,
                task
            },
            to_coord
        );

        assert!(decode_query_task_finished(&[21, 0, 0]).is_err());
    }

    #[test]
    fn batch_slicing() {
        let pool = MappingPool::new(4, 2);
        let a = pool.create_with_values(&[1], &[0b1000_0000]);
        let b = pool.create_with_values(&[2, 3], &[0b0100_0000]);

        let batch = encode_mapping_batch(1, [a.as_bytes(), b.as_bytes()].into_iter());
        let (sender_slave, records) = BatchRecords::new(&batch).unwrap();
        assert_eq!(1, sender_slave);

        let records: Vec<_> = records.map(|r| r.unwrap().to_vec()).collect();
        assert_eq!(2, records.len());
        assert_eq!(a.as_bytes(), &records[0]);
        assert_eq!(b.as_bytes(), &records[1]);
    }

    #[test]
    fn truncated_batch_record_is_an_error() {
        let pool = MappingPool::new(4, 1);
        let a = pool.create_with_values(&[1], &[0x80]);
        let mut batch = encode_mapping_batch(1, [a.as_bytes()].into_iter());
        batch.truncate(batch.len() - 2);

        let (_, mut records) = BatchRecords::new(&batch).unwrap();
        assert!(records.next().unwrap().is_err());
        assert!(records.next().is_none());
    }
}
