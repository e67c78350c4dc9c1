// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]
#![deny(clippy::expect_used, clippy::unwrap_used)]

//! tideGraft Flotilla — work distribution for pipelined placement.
//!
//! Flotilla answers one question: given a fixed pool of ranks and a
//! placement pipeline whose stages have very different per-item costs, who
//! works on what? It owns the stage scheduler, the token type that flows
//! between stages, and the abstract message-passing substrate the pipeline
//! runs on.
//!
//! The placement core (`tidegraft_mangrove`) stays substrate-agnostic: it
//! talks to [`transport::Substrate`] and never to a concrete communication
//! layer. The in-process [`transport::Loopback`] implementation backs the
//! single-node deployment and every test; a cluster deployment plugs an MPI
//! (or similar) binding into the same trait.
//!
//! # Architecture
//!
//! ```text
//!    ┌─────────────────────────────┐
//!    │        schedule             │  stage costs → ranks per stage
//!    └──────────┬──────────────────┘
//!               │ StageAssignment
//!    ┌──────────▼──────────────────┐
//!    │         token               │  Data / Eof / Flush framing
//!    └──────────┬──────────────────┘
//!               │ Token<T>
//!    ┌──────────▼──────────────────┐
//!    │        transport            │  send / issend / probe / recv / wait
//!    └──────────┬──────────────────┘
//!               │ Substrate
//!    ┌──────────▼──────────────────┐
//!    │        collective           │  split-send / receive-merge
//!    └─────────────────────────────┘
//! ```

pub mod collective;
pub mod schedule;
pub mod token;
pub mod transport;
