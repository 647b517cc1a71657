//! A stratum v1 mining pool server.
//!
//! The pool sits between bitcoin nodes and a fleet of miners. The [`node`]
//! module polls node RPC for block templates and submits solved blocks, the
//! [`job`] module turns templates into stratum work and validates the shares
//! that come back, the [`stratum`] module speaks the wire protocol to each
//! miner, and the [`hub`] ties them together, owning every session and the
//! job registry. The [`daemon`] module assembles all of it from a parsed
//! [`config`] and runs it under one shutdown umbrella.

pub mod config;
pub mod daemon;
pub mod hub;
pub mod job;
pub mod node;
pub mod peer;
pub mod stratum;
pub mod tracing;
pub mod vardiff;
