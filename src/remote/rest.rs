//! `RemoteStore` over a table-style REST endpoint (`<base>/<collection>`).
//!
//! One HTTP method per logical operation: GET filtered list, POST insert,
//! PATCH update-by-id, DELETE by id or filter. Mutations ask for the
//! affected rows back with `Prefer: return=representation`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use tracing::debug;

use crate::auth::AuthProvider;
use crate::config::SyncConfig;
use crate::error::RemoteError;
use crate::types::Record;

use super::{BulkInsertReport, ConflictPolicy, Filter, RemoteStore, RemoveTarget};

const RETURN_REPRESENTATION: &str = "return=representation";
const IGNORE_DUPLICATES: &str = "resolution=ignore-duplicates";

pub struct RestClient {
    base_url: String,
    api_key: Option<String>,
    auth: Arc<dyn AuthProvider>,
    http: Client,
    timeout_ms: u64,
}

impl RestClient {
    pub fn new(config: &SyncConfig, auth: Arc<dyn AuthProvider>) -> Result<Self, RemoteError> {
        let base = config
            .rest_url
            .as_deref()
            .ok_or_else(|| RemoteError::NotConfigured("rest_url is not set".to_string()))?;
        Url::parse(base).map_err(|e| RemoteError::NotConfigured(format!("invalid rest_url: {e}")))?;

        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .connect_timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| RemoteError::NotConfigured(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            auth,
            http,
            timeout_ms: config.request_timeout_ms,
        })
    }

    // -----------------------------------------------------------------------
    // Request building
    // -----------------------------------------------------------------------

    fn table_url(&self, collection: &str) -> Result<Url, RemoteError> {
        let valid = !collection.is_empty()
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(RemoteError::InvalidRequest(format!(
                "invalid collection name {collection:?}"
            )));
        }
        Url::parse(&format!("{}/{}", self.base_url, collection))
            .map_err(|e| RemoteError::InvalidRequest(e.to_string()))
    }

    fn request(&self, method: Method, url: Url) -> Result<RequestBuilder, RemoteError> {
        let token = self
            .auth
            .access_token()
            .ok_or(RemoteError::AuthExpired)?;
        let mut builder = self
            .http
            .request(method, url)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::ACCEPT, "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("apikey", key);
        }
        Ok(builder)
    }

    fn owner_id(&self) -> Result<String, RemoteError> {
        self.auth
            .current_user()
            .map(|u| u.id)
            .ok_or(RemoteError::AuthExpired)
    }

    /// Shape a record for the wire: owner stamped from the session, id
    /// removed (the URL carries it for updates; inserts get a fresh one).
    fn outgoing(record: &Record, owner: &str) -> Record {
        let mut out = record.clone();
        out.remove("id");
        out.set_user_id(owner);
        out
    }

    async fn send(&self, builder: RequestBuilder, collection: &str) -> Result<Response, RemoteError> {
        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport(e, self.timeout_ms))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body, collection))
    }

    async fn rows(response: Response) -> Result<Vec<Record>, RemoteError> {
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let value: Value =
            serde_json::from_str(&text).map_err(|e| RemoteError::Decode(e.to_string()))?;
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| {
                    Record::from_value(item)
                        .ok_or_else(|| RemoteError::Decode("row is not an object".to_string()))
                })
                .collect(),
            Value::Object(map) => Ok(vec![Record::from(map)]),
            Value::Null => Ok(Vec::new()),
            other => Err(RemoteError::Decode(format!("unexpected response body: {other}"))),
        }
    }
}

/// Map a non-2xx response onto the error taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: String, collection: &str) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED => RemoteError::AuthExpired,
        StatusCode::FORBIDDEN if body.to_ascii_lowercase().contains("jwt expired") => {
            RemoteError::AuthExpired
        }
        StatusCode::CONFLICT => RemoteError::Conflict {
            collection: collection.to_string(),
            body,
        },
        other => RemoteError::Status {
            status: other.as_u16(),
            body,
        },
    }
}

fn classify_transport(e: reqwest::Error, timeout_ms: u64) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout(timeout_ms)
    } else {
        RemoteError::Network(e.to_string())
    }
}

#[async_trait]
impl RemoteStore for RestClient {
    async fn write(&self, collection: &str, record: &Record) -> Result<Record, RemoteError> {
        let owner = self.owner_id()?;
        let body = Self::outgoing(record, &owner).into_value();
        let mut url = self.table_url(collection)?;

        let builder = match record.id().filter(|_| record.has_remote_id()) {
            Some(id) => {
                url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
                debug!(collection, id = %id, "remote update");
                self.request(Method::PATCH, url)?
            }
            None => {
                debug!(collection, "remote insert");
                self.request(Method::POST, url)?
            }
        };
        let response = self
            .send(
                builder.header("Prefer", RETURN_REPRESENTATION).json(&body),
                collection,
            )
            .await?;

        let mut rows = Self::rows(response).await?;
        if rows.is_empty() {
            // PATCH on a row that no longer exists matches nothing.
            return Err(RemoteError::Status {
                status: StatusCode::NOT_FOUND.as_u16(),
                body: format!("no row in {collection} matched the update"),
            });
        }
        Ok(rows.swap_remove(0))
    }

    async fn read_filtered(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>, RemoteError> {
        let mut url = self.table_url(collection)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("select", "*");
            for (k, v) in filter.query_pairs() {
                query.append_pair(&k, &v);
            }
        }
        let response = self.send(self.request(Method::GET, url)?, collection).await?;
        Self::rows(response).await
    }

    async fn remove(&self, collection: &str, target: &RemoveTarget) -> Result<(), RemoteError> {
        let mut url = self.table_url(collection)?;
        match target {
            RemoveTarget::Id(id) => {
                url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
            }
            RemoveTarget::Filter(filter) => {
                // Filter deletes are always scoped to the session owner.
                let owner = self.owner_id()?;
                let mut query = url.query_pairs_mut();
                query.append_pair("user_id", &format!("eq.{owner}"));
                for (k, v) in filter.query_pairs() {
                    query.append_pair(&k, &v);
                }
            }
        }
        self.send(self.request(Method::DELETE, url)?, collection)
            .await?;
        Ok(())
    }

    async fn read_all(&self, collection: &str) -> Result<Vec<Record>, RemoteError> {
        let owner = self.owner_id()?;
        self.read_filtered(collection, &Filter::all().eq("user_id", owner))
            .await
    }

    async fn bulk_insert(
        &self,
        collection: &str,
        records: &[Record],
        policy: ConflictPolicy,
    ) -> Result<BulkInsertReport, RemoteError> {
        if records.is_empty() {
            return Ok(BulkInsertReport::default());
        }
        let owner = self.owner_id()?;
        let body: Vec<Value> = records
            .iter()
            .map(|r| Self::outgoing(r, &owner).into_value())
            .collect();
        let prefer = match policy {
            ConflictPolicy::Ignore => format!("{RETURN_REPRESENTATION},{IGNORE_DUPLICATES}"),
            ConflictPolicy::Fail => RETURN_REPRESENTATION.to_string(),
        };
        let url = self.table_url(collection)?;
        let response = self
            .send(
                self.request(Method::POST, url)?
                    .header("Prefer", prefer)
                    .json(&body),
                collection,
            )
            .await?;
        let inserted = Self::rows(response).await?.len().min(records.len());
        Ok(BulkInsertReport {
            inserted,
            skipped: records.len() - inserted,
        })
    }
}
