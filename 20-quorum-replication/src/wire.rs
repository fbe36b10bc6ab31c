//! Replication messages as they travel between nodes.
//!
//! Each message is one frame in the same format the log files use: a varint
//! body length, the bincode body and its CRC32.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{self, FrameLen};
use crate::error::{ReplicatorError, Result};
use crate::replicator::RpcMessage;

/// Envelope for one request or reply.
///
/// A reply carries the `message_id` of the request it answers and sets
/// `in_reply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationWireMessage {
    pub message_id: u64,
    pub sender_id: u64,
    pub receiver_id: u64,
    pub quorum_id: String,
    pub in_reply: bool,
    pub body: RpcMessage,
}

pub async fn write_message<W>(writer: &mut W, message: &ReplicationWireMessage) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = codec::frame_bytes(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next message. `Ok(None)` means the peer closed the stream
/// between messages.
///
/// The prefix is read a byte at a time, so callers should hand in a buffered
/// reader.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<ReplicationWireMessage>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = FrameLen::default();
    let len = loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                if prefix.is_empty() {
                    return Ok(None);
                }
                return Err(ReplicatorError::Transport("connection closed inside a frame".into()));
            }
            Err(err) => return Err(err.into()),
        };
        if let Some(len) = prefix.push(byte)? {
            break len;
        }
    };
    let mut frame = vec![0u8; codec::trailer_len(len)];
    reader.read_exact(&mut frame).await?;
    let body = codec::verify_checksum(frame)?;
    Ok(Some(codec::decode_body(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::entries;
    use crate::replicator::{AppendEntries, RequestVoteReply};

    fn append_message() -> ReplicationWireMessage {
        ReplicationWireMessage {
            message_id: 7,
            sender_id: 1,
            receiver_id: 2,
            quorum_id: "quorum".into(),
            in_reply: false,
            body: RpcMessage::AppendEntries(AppendEntries {
                term: 3,
                leader_id: 1,
                prev_log_index: 4,
                prev_log_term: 2,
                entries: entries().term(3).indexes(&[5, 6]).build(),
                commit_index: 4,
            }),
        }
    }

    #[tokio::test]
    async fn messages_stream_back_in_order() {
        let reply = ReplicationWireMessage {
            message_id: 7,
            sender_id: 2,
            receiver_id: 1,
            quorum_id: "quorum".into(),
            in_reply: true,
            body: RpcMessage::RequestVoteReply(RequestVoteReply {
                term: 3,
                vote_granted: true,
            }),
        };
        let mut buffer = Vec::new();
        write_message(&mut buffer, &append_message()).await.unwrap();
        write_message(&mut buffer, &reply).await.unwrap();

        let mut reader = buffer.as_slice();
        assert_eq!(read_message(&mut reader).await.unwrap(), Some(append_message()));
        assert_eq!(read_message(&mut reader).await.unwrap(), Some(reply));
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &append_message()).await.unwrap();
        buffer.truncate(buffer.len() - 3);
        assert!(read_message(&mut buffer.as_slice()).await.is_err());
    }

    #[tokio::test]
    async fn damaged_message_is_rejected() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &append_message()).await.unwrap();
        let middle = buffer.len() / 2;
        buffer[middle] ^= 0xff;
        assert!(matches!(
            read_message(&mut buffer.as_slice()).await,
            Err(ReplicatorError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn reads_through_a_buffered_stream() {
        let (client, server) = tokio::io::duplex(64);
        let (read_half, _write_half) = tokio::io::split(server);
        let mut reader = tokio::io::BufReader::new(read_half);
        let writer = tokio::spawn(async move {
            let mut client = client;
            for _ in 0..3 {
                write_message(&mut client, &append_message()).await.unwrap();
            }
        });
        for _ in 0..3 {
            assert_eq!(read_message(&mut reader).await.unwrap(), Some(append_message()));
        }
        writer.await.unwrap();
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
    }
}
