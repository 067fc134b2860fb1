// SPDX-FileCopyrightText: © 2025 Greenhouse Broker Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! greenhouse-core: wire protocol, framing and error types shared by the broker.
//!
//! ## Modules
//!
//! - [`frame`]: length-prefixed binary framing (`FrameCodec`).
//! - [`protocol`]: canonical message-type strings, roles, and the typed [`protocol::Message`] enum.
//! - [`error`]: the crate-wide [`error::BrokerError`] hierarchy.

pub mod error;
pub mod frame;
pub mod protocol;

pub use error::{BrokerError, Result};
pub use protocol::Message;
