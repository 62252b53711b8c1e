//! reqwest-backed implementation of the remote document store.
//!
//! The document endpoint exposes one JSON document per user:
//! `GET /users/{id}/document` (404 when the user has never synced) and
//! `PUT /users/{id}/document?merge=true`. The server assigns `updated_at` on
//! every accepted write.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::debug;

use crate::models::{Snapshot, SyncRecord};

use super::{RemoteError, RemoteStore};

/// HTTP request timeout in seconds.
/// 30s allows for slow responses while failing fast enough to let the next
/// sync trigger retry naturally.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Client for the remote document store.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct UpsertBody<'a> {
    datasets: &'a Snapshot,
    updated_by: &'a str,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests.
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    fn document_url(&self, user_id: &str) -> String {
        format!("{}/users/{}/document", self.base_url, user_id)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::from_status(status, &body))
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn fetch(&self, user_id: &str) -> Result<Option<SyncRecord>, RemoteError> {
        let response = self
            .authorized(self.client.get(self.document_url(user_id)))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(%user_id, "no remote document");
            return Ok(None);
        }

        let response = Self::check(response).await?;
        let record = response.json::<SyncRecord>().await?;
        Ok(Some(record))
    }

    async fn upsert(
        &self,
        user_id: &str,
        datasets: Snapshot,
        updated_by: &str,
    ) -> Result<(), RemoteError> {
        let url = format!("{}?merge=true", self.document_url(user_id));
        let body = UpsertBody {
            datasets: &datasets,
            updated_by,
        };

        let response = self
            .authorized(self.client.put(&url))
            .json(&body)
            .send()
            .await?;

        Self::check(response).await?;
        debug!(%user_id, datasets = datasets.len(), "document upserted");
        Ok(())
    }
}
