// SPDX-FileCopyrightText: © 2025 Greenhouse Broker Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Length-prefixed byte-frame reader/writer with a hard size ceiling.
//!
//! Every frame on the wire is `[4-byte big-endian length N][N bytes of
//! payload]`. This module does no text decoding; payload bytes are opaque.
//! Callers convert to/from UTF-8 at the `protocol` boundary.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BrokerError, Result};

/// Hard ceiling on a single frame's payload size (1 MiB).
pub const MAX_FRAME_BYTES: usize = 1_048_576;

/// Writes one length-prefixed frame to `stream` and flushes it.
///
/// Fails with [`BrokerError::FrameTooLarge`] without writing any bytes when
/// `payload` exceeds [`MAX_FRAME_BYTES`]. A single call either writes the
/// full header-and-payload or fails before writing anything.
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(BrokerError::FrameTooLarge { size: payload.len(), limit: MAX_FRAME_BYTES });
    }

    #[allow(clippy::cast_possible_truncation)]
    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame from `stream`.
///
/// Fails with [`BrokerError::InvalidFrame`] when the declared length is
/// zero or exceeds [`MAX_FRAME_BYTES`], and with [`BrokerError::EndOfStream`]
/// or [`BrokerError::Io`] when the stream ends or errors before the
/// declared number of bytes arrive.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(BrokerError::EndOfStream),
        Err(e) => return Err(BrokerError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf);
    #[allow(clippy::cast_possible_truncation)]
    if len == 0 || (len as usize) > MAX_FRAME_BYTES {
        return Err(BrokerError::InvalidFrame(len));
    }

    let mut payload = vec![0u8; len as usize];
    match stream.read_exact(&mut payload).await {
        Ok(()) => Ok(payload),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(BrokerError::EndOfStream),
        Err(e) => Err(BrokerError::Io(e)),
    }
}
