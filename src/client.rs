use {
    crate::{
        error::Error,
        query::{index_from_headers, BlockingQueryOptions, Indexed},
    },
    reqwest::{Method, StatusCode, Url},
    serde::de::DeserializeOwned,
    std::time::Duration,
    tracing::trace,
};

const TOKEN_HEADER: &str = "X-Consul-Token";

/// Default end-to-end request timeout. Kept above the agent's ten minute
/// wait cap so a blocking query is never cut short by its own client.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(11 * 60);

///
/// Connection settings for one agent.
///
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the agent, e.g. `http://127.0.0.1:8500`.
    pub address: String,
    /// Access token, attached to every request as the `X-Consul-Token` header.
    pub token: Option<String>,
    /// Datacenter selector, attached as the `dc` query parameter.
    pub datacenter: Option<String>,
    /// End-to-end timeout for a single request. Must stay above the wait
    /// duration of any blocking query issued through this client.
    pub timeout: Duration,
}

impl Config {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: None,
            datacenter: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

///
/// Handle to one Consul agent.
///
/// Cloning is cheap: clones share the underlying connection pool. The pool
/// is injected at construction, so several clients with different
/// configurations can share one.
///
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    config: Config,
}

impl ConsulClient {
    pub fn new(config: Config) -> Self {
        Self::with_http_client(reqwest::Client::new(), config)
    }

    /// Builds a client on top of an existing connection pool.
    pub fn with_http_client(http: reqwest::Client, config: Config) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        let base = self.config.address.trim_end_matches('/');
        Url::parse(&format!("{base}{path}")).map_err(|e| Error::InvalidAddress(e.to_string()))
    }

    pub(crate) fn transport_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout(self.config.timeout)
        } else {
            Error::Transport(err)
        }
    }

    pub(crate) async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&'static str, String)],
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, Error> {
        trace!(%method, path, "consul request");
        let mut query = query.to_vec();
        if let Some(dc) = &self.config.datacenter {
            query.push(("dc", dc.clone()));
        }
        let mut request = self
            .http
            .request(method, self.url(path)?)
            .timeout(self.config.timeout);
        if !query.is_empty() {
            request = request.query(&query);
        }
        if let Some(token) = &self.config.token {
            request = request.header(TOKEN_HEADER, token);
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        request.send().await.map_err(|e| self.transport_error(e))
    }

    /// Indexed GET: decodes the body and the change index header. A 404 is a
    /// valid outcome for resources that may be absent and still carries an
    /// index, so it maps to `None` rather than an error.
    pub(crate) async fn get_indexed<T: DeserializeOwned>(
        &self,
        path: &str,
        options: BlockingQueryOptions,
        extra: &[(&'static str, String)],
    ) -> Result<Indexed<Option<T>>, Error> {
        let mut query = options.query_pairs();
        query.extend_from_slice(extra);
        let response = self.send(Method::GET, path, &query, None).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            let index = index_from_headers(response.headers())?;
            return Ok(Indexed::new(None, index));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UnexpectedStatus { status, body });
        }
        let index = index_from_headers(response.headers())?;
        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
        let value = serde_json::from_slice(&bytes)?;
        Ok(Indexed::new(Some(value), index))
    }

    /// PUT returning the agent's bare `true`/`false` body.
    pub(crate) async fn put_bool(
        &self,
        path: &str,
        query: &[(&'static str, String)],
        body: Vec<u8>,
    ) -> Result<bool, Error> {
        let response = self.send(Method::PUT, path, query, Some(body)).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UnexpectedStatus { status, body });
        }
        let body = response.text().await.map_err(|e| self.transport_error(e))?;
        Ok(body.trim() == "true")
    }

    pub(crate) async fn delete(
        &self,
        path: &str,
        query: &[(&'static str, String)],
    ) -> Result<(), Error> {
        let response = self.send(Method::DELETE, path, query, None).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UnexpectedStatus { status, body });
        }
        Ok(())
    }
}
