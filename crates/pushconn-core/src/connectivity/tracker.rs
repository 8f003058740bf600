//! Public facade over [`ConnectedState`].

use super::ConnectedState;
use crate::bus::DynEndpoint;
use crate::cancel::CancellationToken;
use crate::config::{ConnectivityConfig, RedialConfig};
use crate::error::{ConnError, Result};
use crate::network::{HttpWebchecker, Webchecker};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Publishes whether the device can reach the internet.
///
/// `track()` sends `false` as soon as tracking is up, then one value per
/// change. If a watch dies the whole state machine is rebuilt and the
/// baseline `false` is sent again, so consumers must tolerate a repeated
/// `false` around a restart.
///
/// # Example
///
/// ```rust,ignore
/// let tracker = Arc::new(ConnectivityTracker::new(endpoint, config)?);
/// let (tx, mut rx) = mpsc::channel(16);
/// tokio::spawn({
///     let tracker = tracker.clone();
///     async move { tracker.track(tx).await }
/// });
/// while let Some(online) = rx.recv().await {
///     println!("online: {}", online);
/// }
/// ```
pub struct ConnectivityTracker {
    endpoint: DynEndpoint,
    config: ConnectivityConfig,
    redial: RedialConfig,
    webchk: Arc<dyn Webchecker>,
    cancel: CancellationToken,
}

impl ConnectivityTracker {
    /// Create a tracker probing the URL from `config`.
    pub fn new(endpoint: DynEndpoint, config: ConnectivityConfig) -> Result<Self> {
        config.validate()?;
        let webchk = HttpWebchecker::new(
            config.connectivity_check_url.clone(),
            config.connectivity_check_md5.clone(),
            config.webcheck_timeout,
        )?;

        Ok(Self {
            endpoint,
            config,
            redial: RedialConfig::default(),
            webchk: Arc::new(webchk),
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the reachability check.
    pub fn with_webchecker(mut self, webchk: Arc<dyn Webchecker>) -> Self {
        self.webchk = webchk;
        self
    }

    /// Replace the redial schedule.
    pub fn with_redial_config(mut self, redial: RedialConfig) -> Self {
        self.redial = redial;
        self
    }

    pub fn config(&self) -> &ConnectivityConfig {
        &self.config
    }

    /// Stop tracking. Idempotent; `track()` returns shortly after.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Send `value` unless cancelled. `false` means stop tracking.
    async fn emit(&self, out: &mpsc::Sender<bool>, value: bool) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = out.send(value) => {
                if sent.is_err() {
                    debug!("connectivity receiver dropped; stopping");
                }
                sent.is_ok()
            }
        }
    }

    /// Track connectivity, sending every change on `out`.
    ///
    /// Runs until [`cancel`](Self::cancel) is called or `out` is closed, and
    /// returns `Ok(())` in both cases. Errors only come from a bounded redial
    /// schedule running out.
    pub async fn track(&self, out: mpsc::Sender<bool>) -> Result<()> {
        loop {
            let mut cs = ConnectedState::new(
                self.endpoint.clone(),
                self.config.clone(),
                self.webchk.clone(),
                self.redial.clone(),
                self.cancel.clone(),
            );

            let started = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                started = cs.start() => started,
            };
            match started {
                Ok(initial) => {
                    info!("tracking connectivity, link is {}", initial);
                }
                Err(ConnError::Cancelled) => return Ok(()),
                Err(e) => {
                    error!("unable to start connectivity tracking: {}", e);
                    return Err(e);
                }
            }

            if !self.emit(&out, false).await {
                return Ok(());
            }

            loop {
                let step = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    step = cs.step() => step,
                };
                match step {
                    Ok(connected) => {
                        if !self.emit(&out, connected).await {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        error!("connectivity tracking broke, restarting: {}", e);
                        break;
                    }
                }
            }

            self.endpoint.close();
            drop(cs);

            let cooldown = self.redial.restart_cooldown;
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(cooldown) => {}
            }
        }
    }
}
