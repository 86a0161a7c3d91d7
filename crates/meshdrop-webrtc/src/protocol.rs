//! Data channel protocol
//!
//! Control messages are JSON text frames tagged by `type`. Chunk payloads
//! travel as raw binary frames, each immediately preceded by the
//! `file-chunk` header describing it:
//!
//! ```text
//! file-offer  -> file-answer
//! file-chunk{0} [binary] file-chunk{1} [binary] ... file-complete
//! ```

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::DirectoryEntry;
use crate::types::TransferId;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One frame received from a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Text(String),
    Binary(Bytes),
}

/// Control messages exchanged over an open link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    FileOffer {
        transfer_id: TransferId,
        file_name: String,
        file_size: u64,
        mime_type: String,
        total_chunks: u32,
    },
    #[serde(rename_all = "camelCase")]
    FileAnswer {
        transfer_id: TransferId,
        accepted: bool,
    },
    /// Header for the binary frame that follows
    #[serde(rename_all = "camelCase")]
    FileChunk {
        transfer_id: TransferId,
        chunk_index: u32,
        chunk_size: u32,
        is_last: bool,
    },
    #[serde(rename_all = "camelCase")]
    FileComplete { transfer_id: TransferId },
    #[serde(rename_all = "camelCase")]
    FileError {
        transfer_id: TransferId,
        error: String,
    },
    FilesList { entries: Vec<DirectoryEntry> },
}

impl ControlMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn transfer_id(&self) -> Option<&TransferId> {
        match self {
            ControlMessage::FileOffer { transfer_id, .. }
            | ControlMessage::FileAnswer { transfer_id, .. }
            | ControlMessage::FileChunk { transfer_id, .. }
            | ControlMessage::FileComplete { transfer_id }
            | ControlMessage::FileError { transfer_id, .. } => Some(transfer_id),
            ControlMessage::FilesList { .. } => None,
        }
    }
}

/// Number of chunks for a file; an empty file has none
pub fn total_chunks(file_size: u64, chunk_size: usize) -> u32 {
    let chunk_size = chunk_size.max(1) as u64;
    file_size.div_ceil(chunk_size) as u32
}

/// Split into `chunk_size` slices; only the last may be shorter.
/// Slices share the original buffer.
pub fn split_chunks(data: &Bytes, chunk_size: usize) -> impl Iterator<Item = Bytes> + '_ {
    let chunk_size = chunk_size.max(1);
    (0..data.len())
        .step_by(chunk_size)
        .map(move |start| data.slice(start..(start + chunk_size).min(data.len())))
}

/// Concatenate slots in index order. Returns the number of empty slots
/// if any chunk is missing.
pub fn assemble(slots: &[Option<Bytes>]) -> Result<Bytes, usize> {
    let missing = slots.iter().filter(|s| s.is_none()).count();
    if missing > 0 {
        return Err(missing);
    }
    let total: usize = slots.iter().flatten().map(|b| b.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for chunk in slots.iter().flatten() {
        out.extend_from_slice(chunk);
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CHUNK_SIZE;

    fn pattern(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_total_chunks() {
        assert_eq!(total_chunks(0, CHUNK_SIZE), 0);
        assert_eq!(total_chunks(1, CHUNK_SIZE), 1);
        assert_eq!(total_chunks(65536, CHUNK_SIZE), 1);
        assert_eq!(total_chunks(65537, CHUNK_SIZE), 2);
        assert_eq!(total_chunks(10_000_000, CHUNK_SIZE), 153);
        assert_eq!(total_chunks(25_000_000, CHUNK_SIZE), 382);
    }

    #[test]
    fn test_split_and_assemble() {
        for size in [0usize, 1, 65536, 65537, 10_000_000] {
            let data = pattern(size);
            let chunks: Vec<Bytes> = split_chunks(&data, CHUNK_SIZE).collect();
            assert_eq!(chunks.len() as u32, total_chunks(size as u64, CHUNK_SIZE));
            if let Some((last, rest)) = chunks.split_last() {
                assert!(rest.iter().all(|c| c.len() == CHUNK_SIZE));
                assert!(!last.is_empty() && last.len() <= CHUNK_SIZE);
            }
            let slots: Vec<Option<Bytes>> = chunks.into_iter().map(Some).collect();
            assert_eq!(assemble(&slots).unwrap(), data, "size {}", size);
        }
    }

    #[test]
    fn test_assemble_reports_gaps() {
        let slots = vec![Some(Bytes::from_static(b"a")), None, None];
        assert_eq!(assemble(&slots), Err(2));
    }

    #[test]
    fn test_control_message_wire_shape() {
        let msg = ControlMessage::FileChunk {
            transfer_id: TransferId::new("t"),
            chunk_index: 3,
            chunk_size: 65536,
            is_last: false,
        };
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "file-chunk");
        assert_eq!(json["transferId"], "t");
        assert_eq!(json["chunkIndex"], 3);
        assert_eq!(json["chunkSize"], 65536);
        assert_eq!(json["isLast"], false);
    }

    #[test]
    fn test_decode_offer() {
        let text = r#"{"type":"file-offer","transferId":"abc","fileName":"a.txt","fileSize":5,"mimeType":"text/plain","totalChunks":1}"#;
        let msg = ControlMessage::decode(text).unwrap();
        assert_eq!(msg.transfer_id(), Some(&TransferId::new("abc")));
        assert!(matches!(
            msg,
            ControlMessage::FileOffer { total_chunks: 1, file_size: 5, .. }
        ));
        assert!(ControlMessage::decode(r#"{"type":"bogus"}"#).is_err());
    }
}
