//! PostgREST-style HTTP backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use shopsync_engine::{Fields, Timestamp};
use tracing::{debug, warn};

use super::{from_wire, to_wire, version_window, BackendError, RemoteBackend};

/// Timeout of the lightweight reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct RestBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transient(format!("cannot create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, url)
            .header("Prefer", "return=representation");
        if let Some(key) = &self.api_key {
            req = req.header("apikey", key).bearer_auth(key);
        }
        req
    }

    async fn rows(&self, req: RequestBuilder) -> Result<Vec<Fields>, BackendError> {
        let resp = req.send().await.map_err(|e| classify_error(&self.base_url, &e))?;
        let resp = check_status(resp).await?;
        let rows: Vec<Fields> = resp
            .json()
            .await
            .map_err(|e| BackendError::Transient(format!("unreadable response: {e}")))?;
        Ok(rows.into_iter().map(from_wire).collect())
    }

    async fn fetch(&self, table: &str, id: &str) -> Result<Option<Fields>, BackendError> {
        let req = self
            .request(Method::GET, &self.table_url(table))
            .query(&[("id", format!("eq.{id}"))]);
        Ok(self.rows(req).await?.into_iter().next())
    }
}

/// Map a transport failure. Anything that never reached the server is
/// transient.
fn classify_error(url: &str, err: &reqwest::Error) -> BackendError {
    if err.is_timeout() {
        return BackendError::Transient(format!("request to {url} timed out"));
    }
    if err.is_connect() {
        return BackendError::Transient(format!("cannot reach {url}"));
    }
    if err.is_builder() {
        return BackendError::Validation(format!("invalid request: {err}"));
    }
    BackendError::Transient(format!("network error communicating with {url}: {err}"))
}

/// Map an HTTP status.
fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let detail = if body.trim().is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), body.trim())
    };

    match status {
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            BackendError::Conflict { current: None }
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            BackendError::Transient(detail)
        }
        s if s.is_server_error() => BackendError::Transient(detail),
        _ => BackendError::Validation(detail),
    }
}

/// Row filters of a patch. A conditional patch only matches a row whose
/// `updated_at` lies in the expected millisecond.
fn update_filters(id: &str, expected_updated_at: Option<Timestamp>) -> Vec<(&'static str, String)> {
    let mut filters = vec![("id", format!("eq.{id}"))];
    if let Some((start, end)) = expected_updated_at.and_then(version_window) {
        filters.push(("updated_at", format!("gte.{start}")));
        filters.push(("updated_at", format!("lt.{end}")));
    }
    filters
}

async fn check_status(resp: Response) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

#[async_trait]
impl RemoteBackend for RestBackend {
    async fn select(&self, table: &str) -> Result<Vec<Fields>, BackendError> {
        let req = self
            .request(Method::GET, &self.table_url(table))
            .query(&[("select", "*")]);
        self.rows(req).await
    }

    async fn insert(&self, table: &str, row: Fields) -> Result<Fields, BackendError> {
        let req = self
            .request(Method::POST, &self.table_url(table))
            .json(&to_wire(row));
        self.rows(req)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Transient("insert returned no row".into()))
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: Fields,
        expected_updated_at: Option<Timestamp>,
    ) -> Result<Fields, BackendError> {
        let filters = update_filters(id, expected_updated_at);
        let req = self
            .request(Method::PATCH, &self.table_url(table))
            .query(&filters)
            .json(&to_wire(patch));

        if let Some(row) = self.rows(req).await?.into_iter().next() {
            return Ok(row);
        }

        // Nothing matched: the row is gone or its version moved on
        match self.fetch(table, id).await? {
            Some(current) if expected_updated_at.is_some() => {
                debug!(table, id, "conditional update matched no row");
                Err(BackendError::Conflict {
                    current: Some(current),
                })
            }
            Some(_) => {
                warn!(table, id, "update matched no row although it exists");
                Err(BackendError::Transient("update matched no row".into()))
            }
            None => Err(BackendError::NotFound),
        }
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), BackendError> {
        let req = self
            .request(Method::DELETE, &self.table_url(table))
            .query(&[("id", format!("eq.{id}"))]);
        if self.rows(req).await?.is_empty() {
            return Err(BackendError::NotFound);
        }
        Ok(())
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/rest/v1/", self.base_url);
        match self
            .request(Method::GET, &url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => !resp.status().is_server_error(),
            Err(e) => {
                debug!(error = %e, "backend probe failed");
                false
            }
        }
    }
}
