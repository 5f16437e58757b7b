use {reqwest::StatusCode, std::time::Duration, thiserror::Error};

use crate::query::INDEX_HEADER;

///
/// Failure of a single request against the agent.
///
/// Transport, timeout and protocol errors are all retryable from a watch's
/// point of view; transaction-level rejections are not errors at this layer,
/// they come back inside a [`crate::txn::TxnResponse`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(reqwest::Error),

    /// The client-side request timeout elapsed before any response arrived.
    /// Distinct from a server-side wait expiry, which is a successful
    /// response with an unchanged index.
    #[error("client-side timeout after {0:?} waiting for a response")]
    Timeout(Duration),

    #[error("configured agent address is invalid: {0}")]
    InvalidAddress(String),

    #[error("response is missing the {INDEX_HEADER} header")]
    MissingIndex,

    #[error("malformed {INDEX_HEADER} header: {0:?}")]
    InvalidIndex(String),

    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },
}
