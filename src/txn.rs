use {
    crate::{
        catalog::ServiceOptions, client::ConsulClient, error::Error, kv::base64_value,
        kv::KeyValue, ChangeIndex,
    },
    reqwest::{Method, StatusCode},
    serde::{Deserialize, Deserializer, Serialize},
    tracing::debug,
};

///
/// Key/value transaction verbs.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxnKvVerb {
    Set,
    Cas,
    Lock,
    Unlock,
    Get,
    GetTree,
    CheckIndex,
    CheckSession,
    Delete,
    DeleteTree,
    DeleteCas,
}

///
/// Service transaction verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxnServiceVerb {
    Set,
    Cas,
    Get,
    Delete,
    DeleteCas,
}

///
/// One key/value operation inside a transaction.
///
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnKvOperation {
    #[serde(rename = "Verb")]
    pub verb: TxnKvVerb,

    #[serde(rename = "Key")]
    pub key: String,

    #[serde(rename = "Value", with = "base64_value", default)]
    pub value: Option<Vec<u8>>,

    #[serde(rename = "Flags", default)]
    pub flags: u64,

    /// Modify index compared by `cas`, `check-index` and `delete-cas`.
    #[serde(rename = "Index", default)]
    pub index: ChangeIndex,

    #[serde(rename = "Session", default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl Default for TxnKvVerb {
    fn default() -> Self {
        TxnKvVerb::Set
    }
}

impl TxnKvOperation {
    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            verb: TxnKvVerb::Set,
            key: key.into(),
            value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn cas(key: impl Into<String>, value: impl Into<Vec<u8>>, index: ChangeIndex) -> Self {
        Self {
            verb: TxnKvVerb::Cas,
            key: key.into(),
            value: Some(value.into()),
            index,
            ..Default::default()
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self {
            verb: TxnKvVerb::Get,
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn check_index(key: impl Into<String>, index: ChangeIndex) -> Self {
        Self {
            verb: TxnKvVerb::CheckIndex,
            key: key.into(),
            index,
            ..Default::default()
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            verb: TxnKvVerb::Delete,
            key: key.into(),
            ..Default::default()
        }
    }
}

///
/// One service operation inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnServiceOperation {
    #[serde(rename = "Verb")]
    pub verb: TxnServiceVerb,

    #[serde(rename = "Node")]
    pub node: String,

    #[serde(rename = "Service")]
    pub service: ServiceOptions,
}

///
/// One operation of an atomic transaction. Serialized as a single-key object
/// naming the operation kind, exactly as the agent expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnOperation {
    #[serde(rename = "KV")]
    Kv(TxnKvOperation),
    #[serde(rename = "Service")]
    Service(TxnServiceOperation),
}

///
/// Result entry for one operation that produced output. Read-style
/// precondition verbs (`check-index`, `check-session`) and deletes produce
/// no entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnResult {
    #[serde(rename = "KV")]
    Kv(KeyValue),
    #[serde(rename = "Service")]
    Service(ServiceOptions),
}

///
/// Rejection of one operation, attributed by zero-based position in the
/// submitted operation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnError {
    #[serde(rename = "OpIndex")]
    pub op_index: usize,

    #[serde(rename = "What")]
    pub what: String,
}

///
/// An ordered batch of operations, applied by the agent all-or-nothing.
///
/// Insertion order is preserved through serialization so the `op_index`
/// values of any [`TxnError`] refer unambiguously to positions in this list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnRequest {
    operations: Vec<TxnOperation>,
}

impl TxnRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: TxnOperation) -> &mut Self {
        self.operations.push(operation);
        self
    }

    pub fn push_kv(&mut self, operation: TxnKvOperation) -> &mut Self {
        self.push(TxnOperation::Kv(operation))
    }

    pub fn push_service(&mut self, operation: TxnServiceOperation) -> &mut Self {
        self.push(TxnOperation::Service(operation))
    }

    pub fn operations(&self) -> &[TxnOperation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

///
/// Outcome of a transaction. `results` and `errors` are mutually exclusive:
/// any error entry means the agent applied nothing and `results` is empty.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TxnResponse {
    #[serde(rename = "Results", default, deserialize_with = "nullable_vec")]
    pub results: Vec<TxnResult>,

    #[serde(rename = "Errors", default, deserialize_with = "nullable_vec")]
    pub errors: Vec<TxnError>,
}

impl TxnResponse {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The agent sends `null` instead of an empty array for the unused half of
/// the response.
fn nullable_vec<'de, D, T>(de: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(de)?.unwrap_or_default())
}

const TXN_PATH: &str = "/v1/txn";

impl ConsulClient {
    /// Submits the batch atomically. A 409 still decodes as a transaction
    /// response carrying the per-operation errors; transaction errors are
    /// never retried here, the caller decides whether to re-read and resend.
    pub async fn txn(&self, request: &TxnRequest) -> Result<TxnResponse, Error> {
        let body = serde_json::to_vec(request.operations())?;
        let response = self.send(Method::PUT, TXN_PATH, &[], Some(body)).await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UnexpectedStatus { status, body });
        }
        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
        let decoded: TxnResponse = serde_json::from_slice(&bytes)?;
        debug!(
            results = decoded.results.len(),
            errors = decoded.errors.len(),
            "transaction completed"
        );
        Ok(decoded)
    }
}
