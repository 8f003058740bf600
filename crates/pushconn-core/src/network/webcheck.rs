//! Reachability check.
//!
//! Fetches a known page and compares the MD5 of its body with the expected
//! digest. A captive portal answers the request too, but with a different
//! page, so a plain "the GET succeeded" is not enough.

use crate::config::WebcheckConfig;
use crate::error::{ConnError, Result};
use async_trait::async_trait;
use md5::{Digest, Md5};
use reqwest::Client;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Anything that can tell whether the internet is reachable.
///
/// Implementations send exactly one verdict on `ch` per call and never fail:
/// every problem is reported as `false`.
#[async_trait]
pub trait Webchecker: Send + Sync {
    async fn webcheck(&self, ch: mpsc::Sender<bool>);
}

/// HTTP implementation of [`Webchecker`].
#[derive(Debug, Clone)]
pub struct HttpWebchecker {
    client: Client,
    url: String,
    target: String,
}

impl HttpWebchecker {
    /// Build a checker for `url` expecting a body whose MD5 is `target` (hex).
    pub fn new(
        url: impl Into<String>,
        target: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(WebcheckConfig::USER_AGENT)
            .build()
            .map_err(|e| ConnError::Http {
                message: format!("Failed to create HTTP client: {}", e),
                source: Some(e),
            })?;

        Ok(Self {
            client,
            url: url.into(),
            target: target.into().to_ascii_lowercase(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the page and return the hex MD5 of its body.
    async fn fetch_digest(&self) -> Result<String> {
        let mut response = self.client.get(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnError::Http {
                message: format!("GET {} returned {}", self.url, status),
                source: None,
            });
        }

        let mut hasher = Md5::new();
        let mut read = 0usize;
        while let Some(chunk) = response.chunk().await? {
            read += chunk.len();
            if read > WebcheckConfig::MAX_BODY_BYTES {
                return Err(ConnError::Http {
                    message: format!(
                        "response body of {} is larger than {} bytes",
                        self.url,
                        WebcheckConfig::MAX_BODY_BYTES
                    ),
                    source: None,
                });
            }
            hasher.update(&chunk);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Run the check and return the verdict directly.
    pub async fn check(&self) -> bool {
        match self.fetch_digest().await {
            Ok(sum) if sum == self.target => {
                debug!("connectivity check passed");
                true
            }
            Ok(sum) => {
                debug!("connectivity check failed: content mismatch ({})", sum);
                false
            }
            Err(e) => {
                error!("while GETting {}: {}", self.url, e);
                false
            }
        }
    }
}

#[async_trait]
impl Webchecker for HttpWebchecker {
    async fn webcheck(&self, ch: mpsc::Sender<bool>) {
        let verdict = self.check().await;
        // The receiver is gone when the result was superseded; nothing to do.
        let _ = ch.send(verdict).await;
    }
}
