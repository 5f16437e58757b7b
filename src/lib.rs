///
/// Client configuration and the HTTP plumbing shared by every resource module.
///
pub mod client;

///
/// Error taxonomy for transport, timeout, protocol and decoding failures.
pub mod error;

///
/// Blocking (long-poll) query primitives: `index`/`wait` encoding and the
/// indexed result pair returned by every read.
pub mod query;

///
/// Key/value store operations.
///
pub mod kv;

///
/// Service catalog operations.
pub mod catalog;

///
/// Robust API for watching Consul changes
pub mod watch;

///
/// Atomic multi-operation transactions with per-operation error attribution.
///
pub mod txn;

///
/// Alias for Consul's change index, carried by the `X-Consul-Index` header.
pub type ChangeIndex = u64;
