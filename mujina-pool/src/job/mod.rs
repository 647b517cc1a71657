//! Block templates in, mining jobs out, shares validated.
//!
//! This module owns the work pipeline of the pool. A [`BlockTemplate`]
//! arrives from a node, [`JobRegistry::submit_template`] turns it into a
//! [`MiningJob`] with a freshly built coinbase and merkle branch, and
//! [`JobRegistry::validate`] checks each share a miner sends back against
//! the jobs currently on offer, scoring it for difficulty and watching for
//! the one that solves the block.

// Submodules
pub(crate) mod coinbase;
mod extranonce;
mod job;
mod merkle;
mod registry;
pub(crate) mod template;

#[cfg(test)]
mod test_blocks;

// Re-export types from submodules
pub use coinbase::{CoinbaseParams, Recipient};
pub use job::{BlockSolution, MiningJob, MAX_VERSION_MASK};
pub use registry::{JobRegistry, ShareAccepted, ShareSubmission};
pub use template::{BlockTemplate, TemplateSource};
