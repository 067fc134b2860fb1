// SPDX-FileCopyrightText: © 2025 Greenhouse Broker Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for the greenhouse broker.
//!
//! Errors are split into the taxonomy the broker's dispatch loop cares
//! about: framing/IO errors are fatal for a connection, while protocol and
//! routing errors are reported back to the peer without tearing the
//! connection down. See `connection::run` in `greenhouse-broker` for how
//! each variant is handled.

use thiserror::Error;

/// Main error type for broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A payload exceeded `frame::MAX_FRAME_BYTES` on write.
    #[error("frame too large: {size} bytes exceeds the {limit}-byte ceiling")]
    FrameTooLarge { size: usize, limit: usize },

    /// A frame length prefix was zero or exceeded the ceiling on read.
    #[error("invalid frame length: {0}")]
    InvalidFrame(u32),

    /// The stream ended before the declared frame length was fully read.
    #[error("stream ended before frame was complete")]
    EndOfStream,

    /// Underlying socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame parsed as JSON but violated the application protocol
    /// (unknown `type`, missing required field, wrong connection state).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration failed validation at startup.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Framing/IO errors are fatal to the connection; no ERROR frame is
    /// sent because the channel itself is unreliable (spec §7).
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::FrameTooLarge { .. } | Self::InvalidFrame(_) | Self::EndOfStream | Self::Io(_))
    }
}

/// Convenience alias for `Result<T, BrokerError>`.
pub type Result<T> = std::result::Result<T, BrokerError>;
