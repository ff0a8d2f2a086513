//! Wire framing for the message bus
//!
//! One envelope type travels every hop. Coordinator and agents speak
//! length-prefixed JSON over TCP (4-byte big-endian length, bounded);
//! agents and workers speak the same envelopes as newline-delimited
//! JSON over the worker's stdio pipes. Both framings preserve message
//! boundaries and round-trip.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::SimulatorAddress;
use crate::error::{ProtocolError, ProtocolResult};
use crate::operation::Operation;
use crate::response::Response;

/// Hard cap on a single frame payload
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// The body of an envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Payload {
    /// A command or report
    Operation {
        /// The operation
        operation: Operation,
    },
    /// The answer to a previously sent operation with the same `seq`
    Response {
        /// The response
        response: Response,
    },
}

/// A routed message with request/response correlation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Per-sender monotonic sequence number; responses echo it
    pub seq: u64,
    /// Where the message originated
    pub source: SimulatorAddress,
    /// Where the message is going
    pub destination: SimulatorAddress,
    /// Operation or response
    pub payload: Payload,
}

impl Envelope {
    /// An operation envelope
    pub fn operation(
        seq: u64,
        source: SimulatorAddress,
        destination: SimulatorAddress,
        operation: Operation,
    ) -> Self {
        Self {
            seq,
            source,
            destination,
            payload: Payload::Operation { operation },
        }
    }

    /// A response envelope answering `seq`
    pub fn response(
        seq: u64,
        source: SimulatorAddress,
        destination: SimulatorAddress,
        response: Response,
    ) -> Self {
        Self {
            seq,
            source,
            destination,
            payload: Payload::Response { response },
        }
    }
}

/// Write one length-prefixed envelope
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = serde_json::to_vec(envelope)?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            size: bytes.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed envelope
///
/// Returns `Ok(None)` on a clean end of stream (EOF before the length
/// prefix); EOF mid-frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> ProtocolResult<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            limit: MAX_FRAME_BYTES,
        });
    }
    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed,
            _ => ProtocolError::Io(err),
        })?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Encode an envelope as a single JSON line for the stdio hop
pub fn encode_line(envelope: &Envelope) -> ProtocolResult<String> {
    let mut line = serde_json::to_string(envelope)?;
    line.push('\n');
    Ok(line)
}

/// Decode an envelope from a stdio line; empty lines yield `None`
pub fn decode_line(line: &str) -> ProtocolResult<Option<Envelope>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(trimmed)?))
}
