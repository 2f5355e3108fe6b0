//! Data channel wire frames and file reassembly
//!
//! Every frame starts with a one-byte discriminant:
//!
//! ```text
//! 0x01 | JSON FileMetadata
//! 0x02 | transfer id (16 bytes) | sequence (u32 BE) | chunk bytes
//! ```
//!
//! A file is one metadata frame followed by its chunks, in order, on one channel.

use super::MessageSystem;
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Discriminant of a metadata frame
pub const FRAME_METADATA: u8 = 0x01;

/// Discriminant of a chunk frame
pub const FRAME_CHUNK: u8 = 0x02;

/// Bytes preceding the payload of a chunk frame
pub const CHUNK_HEADER_LEN: usize = 1 + 16 + 4;

/// Describes the file whose chunks follow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub transfer_id: Uuid,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub time: DateTime<Utc>,
    pub system: MessageSystem,
}

/// One data channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Metadata(FileMetadata),
    Chunk {
        transfer_id: Uuid,
        seq: u32,
        data: Bytes,
    },
}

impl WireFrame {
    pub fn encode(&self) -> Result<Bytes> {
        match self {
            WireFrame::Metadata(metadata) => {
                let json = serde_json::to_vec(metadata)?;
                let mut buf = BytesMut::with_capacity(1 + json.len());
                buf.put_u8(FRAME_METADATA);
                buf.put_slice(&json);
                Ok(buf.freeze())
            }
            WireFrame::Chunk {
                transfer_id,
                seq,
                data,
            } => {
                let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + data.len());
                buf.put_u8(FRAME_CHUNK);
                buf.put_slice(transfer_id.as_bytes());
                buf.put_u32(*seq);
                buf.put_slice(data);
                Ok(buf.freeze())
            }
        }
    }

    pub fn decode(frame: &Bytes) -> Result<Self> {
        let Some(&tag) = frame.first() else {
            return Err(Error::InvalidFrame("empty frame".to_string()));
        };

        match tag {
            FRAME_METADATA => {
                let metadata = serde_json::from_slice(&frame[1..]).map_err(|e| {
                    Error::InvalidFrame(format!("malformed file metadata: {}", e))
                })?;
                Ok(WireFrame::Metadata(metadata))
            }
            FRAME_CHUNK => {
                if frame.len() < CHUNK_HEADER_LEN {
                    return Err(Error::InvalidFrame(format!(
                        "chunk frame too short: {} bytes",
                        frame.len()
                    )));
                }
                let mut header = &frame[1..CHUNK_HEADER_LEN];
                let mut id = [0u8; 16];
                header.copy_to_slice(&mut id);
                let seq = header.get_u32();
                Ok(WireFrame::Chunk {
                    transfer_id: Uuid::from_bytes(id),
                    seq,
                    data: frame.slice(CHUNK_HEADER_LEN..),
                })
            }
            other => Err(Error::InvalidFrame(format!(
                "unknown frame type 0x{:02x}",
                other
            ))),
        }
    }
}

/// Split `data` into consecutive slices of at most `chunk_size` bytes
///
/// An empty input yields no chunks. Panics if `chunk_size` is zero.
pub fn split_chunks(data: &Bytes, chunk_size: usize) -> impl Iterator<Item = Bytes> + '_ {
    assert!(chunk_size > 0, "chunk_size must be positive");
    (0..data.len())
        .step_by(chunk_size)
        .map(move |start| data.slice(start..data.len().min(start + chunk_size)))
}

/// A fully received file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
    /// Bytes received past the declared size and discarded
    pub overflow: u64,
}

/// Rebuilds files from the frames of one channel
#[derive(Debug, Default)]
pub struct FileAssembler {
    pending: Option<FileMetadata>,
    buffer: BytesMut,
    next_seq: u32,
}

impl FileAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// No transfer in progress
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Feed one frame; returns the file once its declared size is reached
    pub fn push(&mut self, frame: WireFrame) -> Option<AssembledFile> {
        match frame {
            WireFrame::Metadata(metadata) => {
                if let Some(previous) = &self.pending {
                    warn!(
                        "Transfer of {} interrupted after {} of {} bytes",
                        previous.name,
                        self.buffer.len(),
                        previous.size
                    );
                }
                debug!("Receiving {} ({} bytes)", metadata.name, metadata.size);
                self.buffer = BytesMut::with_capacity(metadata.size.min(1 << 24) as usize);
                self.next_seq = 0;
                let empty = metadata.size == 0;
                self.pending = Some(metadata);
                if empty {
                    return self.finish();
                }
                None
            }
            WireFrame::Chunk {
                transfer_id,
                seq,
                data,
            } => {
                let Some(metadata) = &self.pending else {
                    warn!("Dropping {} byte chunk without metadata", data.len());
                    return None;
                };
                if metadata.transfer_id != transfer_id {
                    warn!(
                        "Dropping chunk of unknown transfer {} while receiving {}",
                        transfer_id, metadata.name
                    );
                    return None;
                }
                if seq != self.next_seq {
                    warn!(
                        "Chunk {} of {} out of sequence (expected {}), dropping the transfer",
                        seq, metadata.name, self.next_seq
                    );
                    self.pending = None;
                    self.buffer.clear();
                    return None;
                }
                self.next_seq = seq.wrapping_add(1);
                self.buffer.extend_from_slice(&data);

                if self.buffer.len() as u64 >= metadata.size {
                    return self.finish();
                }
                None
            }
        }
    }

    fn finish(&mut self) -> Option<AssembledFile> {
        let metadata = self.pending.take()?;
        let mut data = std::mem::take(&mut self.buffer);
        let overflow = (data.len() as u64).saturating_sub(metadata.size);
        if overflow > 0 {
            warn!(
                "Received {} bytes more than the declared {} for {}",
                overflow, metadata.size, metadata.name
            );
            data.truncate(metadata.size as usize);
        }
        Some(AssembledFile {
            metadata,
            data: data.freeze(),
            overflow,
        })
    }
}
