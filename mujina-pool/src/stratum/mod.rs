//! Stratum v1 protocol plumbing.
//!
//! Everything between the TCP socket and the hub lives here. The
//! [`StratumServer`] accepts connections and spawns one connection task per
//! miner, the connection task frames newline delimited JSON-RPC in both
//! directions, and [`Session`] carries the per miner protocol state the hub
//! consults while dispatching requests. Message parsing, share error codes,
//! and version rolling negotiation round out the set.

// Submodules
mod connection;
mod error;
mod messages;
mod server;
mod session;
pub(crate) mod version_rolling;

// Re-export types from submodules
pub use connection::{SessionCommand, SessionEvent, MAX_LINE_LENGTH};
pub use error::ShareError;
pub use messages::{
    parse_request, AuthorizeParams, ConfigureParams, IncomingRequest, JsonRpcMessage, SubmitParams,
};
pub use server::{SessionRegistration, StratumServer};
pub use session::{AuthVerdict, Authorizer, OpenAuthorizer, Session, SubscriptionCounter};
