//! Wire message tags.
//!
//! Every message starts with a one-byte tag. The numeric values are part of
//! the wire protocol and must not change.

use tessera_error::{Result, TesseraError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Liveness ping from master to a waiting client.
    MasterWorkInProgress = 8,
    /// A batch of decoded result rows for the client.
    QueryResult = 9,
    ClientCommandAborted = 10,
    ClientCommandSucceeded = 11,
    ClientCommandFailed = 12,
    /// Serialized operator tree from master to one slave.
    QueryCreate = 16,
    /// Acknowledgement of a received operator tree.
    QueryCreated = 17,
    /// Start signal for a created query, broadcast to all slaves.
    QueryStart = 18,
    /// Abort signal for a query, broadcast to all slaves.
    QueryAbortion = 19,
    /// Concatenated mapping records from one slave.
    QueryMappingBatch = 20,
    /// A task instance has finished on the sending slave.
    QueryTaskFinished = 21,
    /// A task instance has failed on the sending slave.
    QueryTaskFailed = 22,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Result<MessageType> {
        Ok(match tag {
            8 => MessageType::MasterWorkInProgress,
            9 => MessageType::QueryResult,
            10 => MessageType::ClientCommandAborted,
            11 => MessageType::ClientCommandSucceeded,
            12 => MessageType::ClientCommandFailed,
            16 => MessageType::QueryCreate,
            17 => MessageType::QueryCreated,
            18 => MessageType::QueryStart,
            19 => MessageType::QueryAbortion,
            20 => MessageType::QueryMappingBatch,
            21 => MessageType::QueryTaskFinished,
            22 => MessageType::QueryTaskFailed,
            other => return Err(TesseraError::new(format!("unknown message tag: {other}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        for tag in [8u8, 9, 10, 11, 12, 16, 17, 18, 19, 20, 21, 22] {
            assert_eq!(tag, MessageType::from_tag(tag).unwrap() as u8);
        }
    }

    #[test]
    fn unknown_tag_is_an_error() {
        assert!(MessageType::from_tag(42).is_err());
    }
}
