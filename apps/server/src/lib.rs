// SPDX-FileCopyrightText: © 2025 Greenhouse Broker Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Process-level wiring for the broker: CLI parsing, layered configuration,
//! logging initialization, and the signal-driven serve loop
//! (`SPEC_FULL.md` §6.3, §9). The protocol and routing logic itself lives
//! in `greenhouse-core` and `greenhouse-broker`.

pub mod cli;
pub mod config;
pub mod logging;
pub mod server;
