use {
    crate::{error::Error, ChangeIndex},
    reqwest::header::HeaderMap,
    std::time::Duration,
};

/// Response header carrying the change index of the queried resource.
pub const INDEX_HEADER: &str = "X-Consul-Index";

///
/// Parameters of a single blocking query.
///
/// An `index` of zero asks the agent to return the current state immediately.
/// Any non-zero index asks it to hold the request open until the resource's
/// index advances past that value, or until `wait` elapses. Without an
/// explicit `wait` the agent applies its own default (documented as five
/// minutes, capped at ten); neither value is assumed here, the client-side
/// request timeout is what bounds the call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockingQueryOptions {
    pub index: ChangeIndex,
    pub wait: Option<Duration>,
}

impl BlockingQueryOptions {
    pub fn at_index(index: ChangeIndex) -> Self {
        Self { index, wait: None }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    /// Query string pairs for this blocking query. `index` is omitted at
    /// zero so a plain read stays a plain read on the wire.
    pub(crate) fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if self.index > 0 {
            pairs.push(("index", self.index.to_string()));
        }
        if let Some(wait) = self.wait {
            pairs.push(("wait", wait_to_string(wait)));
        }
        pairs
    }
}

/// Renders a wait duration the way the agent expects it, e.g. "10s" or "5m".
pub(crate) fn wait_to_string(wait: Duration) -> String {
    let secs = wait.as_secs().max(1);
    if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

///
/// A decoded response body together with the change index the agent attached
/// to it. The index feeds the next blocking query on the same resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indexed<T> {
    pub value: T,
    pub index: ChangeIndex,
}

impl<T> Indexed<T> {
    pub fn new(value: T, index: ChangeIndex) -> Self {
        Self { value, index }
    }
}

/// Extracts the change index from response headers. The header is part of
/// the protocol for every indexed read; a missing or non-numeric value is a
/// protocol error, not something to paper over.
pub(crate) fn index_from_headers(headers: &HeaderMap) -> Result<ChangeIndex, Error> {
    let raw = headers.get(INDEX_HEADER).ok_or(Error::MissingIndex)?;
    let raw = raw
        .to_str()
        .map_err(|_| Error::InvalidIndex(format!("{raw:?}")))?;
    raw.trim()
        .parse::<ChangeIndex>()
        .map_err(|_| Error::InvalidIndex(raw.to_string()))
}
