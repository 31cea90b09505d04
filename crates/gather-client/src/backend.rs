//! Request/response access to the backend REST API.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use gather_shared::constants::{HISTORY_PATH, USERS_PATH};
use gather_shared::{Message, UserIdentity, UserProfile};

use crate::error::{ClientError, Result};

/// Queries the chat engine needs from the backend.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Full history between `local` and `peer`, oldest first.
    async fn fetch_history(&self, local: &UserIdentity, peer: &UserIdentity) -> Result<Vec<Message>>;

    /// Every registered user.
    async fn fetch_users(&self) -> Result<Vec<UserProfile>>;
}

/// `reqwest`-backed implementation.
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ClientError::Http)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn fetch_history(&self, local: &UserIdentity, peer: &UserIdentity) -> Result<Vec<Message>> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| ClientError::Config(format!("invalid server URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Config("server URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(HISTORY_PATH.trim_start_matches('/').split('/'))
            .push(local.as_str())
            .push(peer.as_str());

        debug!(url = %url, "Fetching conversation history");

        let messages = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<Message>>()
            .await?;
        Ok(messages)
    }

    async fn fetch_users(&self) -> Result<Vec<UserProfile>> {
        let url = format!("{}{USERS_PATH}", self.base_url);
        debug!(url = %url, "Fetching user list");

        let users = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<UserProfile>>()
            .await?;
        Ok(users)
    }
}
