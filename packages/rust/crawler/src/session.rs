//! Browser sessions: long-lived HTTP clients that keep cookies and
//! connections between requests, expensive enough to be pooled.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use uuid::Uuid;

use dealdriver_shared::{AppConfig, DealDriverError, Result};

/// Settings applied to every session a factory creates.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub user_agent: String,
    pub request_timeout: Duration,
    pub max_redirects: usize,
}

impl From<&AppConfig> for SessionSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            user_agent: config.scraping.user_agent.clone(),
            request_timeout: Duration::from_secs(config.scraping.request_timeout_secs),
            max_redirects: 5,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// One scraping session.
#[derive(Debug, Clone)]
pub struct BrowserSession {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    client: Client,
}

impl BrowserSession {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Builds [`BrowserSession`]s with shared settings.
#[derive(Debug, Clone, Default)]
pub struct HttpSessionFactory {
    settings: SessionSettings,
}

impl HttpSessionFactory {
    pub fn new(settings: SessionSettings) -> Self {
        Self { settings }
    }

    pub fn create(&self) -> Result<BrowserSession> {
        let client = Client::builder()
            .user_agent(self.settings.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(self.settings.max_redirects))
            .timeout(self.settings.request_timeout)
            .cookie_store(true)
            .build()
            .map_err(|e| DealDriverError::Network(format!("failed to build HTTP client: {e}")))?;

        let session = BrowserSession {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            client,
        };
        tracing::debug!(session = %session.id, "created browser session");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_get_distinct_ids() {
        let factory = HttpSessionFactory::default();
        let a = factory.create().unwrap();
        let b = factory.create().unwrap();
        assert_ne!(a.id, b.id);
    }
}
