//! HTTP discovery client

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use dmsg_protocol::PubKey;

use super::{Discovery, Entry};
use crate::error::{DiscoveryError, DmsgError};

/// Error body returned by the discovery service
#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    pub error: String,
}

/// Discovery client talking to a discovery service over HTTP
#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    base_url: String,
    http: reqwest::Client,
}

impl HttpDiscovery {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, http }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn entry_url(&self, pk: &PubKey) -> String {
        format!("{}/discovery/entries/{}", self.base_url, pk)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, DiscoveryError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(DmsgError::DiscEntryNotFound.into());
        }
        let message = match resp.json::<ApiErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
        };
        Err(DiscoveryError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_list(&self, path: &str) -> Result<Vec<Entry>, DiscoveryError> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn entry(&self, pk: &PubKey) -> Result<Entry, DiscoveryError> {
        let resp = self.http.get(self.entry_url(pk)).send().await?;
        let entry: Entry = Self::check(resp).await?.json().await?;
        entry.verify_signature()?;
        Ok(entry)
    }

    async fn post_entry(&self, entry: &Entry) -> Result<(), DiscoveryError> {
        let resp = self
            .http
            .post(self.entry_url(&entry.static_pk))
            .json(entry)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn available_servers(&self) -> Result<Vec<Entry>, DiscoveryError> {
        self.get_list("/dmsg-discovery/available_servers").await
    }

    async fn client_entries(&self) -> Result<Vec<Entry>, DiscoveryError> {
        self.get_list("/dmsg-discovery/entries").await
    }
}
