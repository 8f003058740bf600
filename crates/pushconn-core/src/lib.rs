//! pushconn-core - device-side connectivity tracking for a push client.
//!
//! Answers one question for the push client: can this device reach the
//! internet right now? It watches NetworkManager over the system bus and, once
//! the link claims global connectivity, confirms it by fetching a known page
//! and checking its MD5. The answer is published as a stream of booleans that
//! only changes when the answer does.
//!
//! # Example
//!
//! ```rust,ignore
//! use pushconn_core::{ConnectivityConfig, ConnectivityTracker};
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> pushconn_core::Result<()> {
//!     let config = ConnectivityConfig::from_file("/etc/pushconn/config.json")?;
//!     let tracker = ConnectivityTracker::new(endpoint(), config)?;
//!
//!     let (tx, mut rx) = mpsc::channel(16);
//!     tokio::spawn(async move { tracker.track(tx).await });
//!     while let Some(online) = rx.recv().await {
//!         println!("online: {}", online);
//!     }
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod cancel;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod network;

pub use bus::{BusValue, DynEndpoint, Endpoint};
pub use cancel::{CancellationToken, CancelledError};
pub use config::{BusConfig, ConnectivityConfig, RedialConfig, WebcheckConfig};
pub use connectivity::{ConnectedState, ConnectivityTracker};
pub use error::{ConnError, Result};
pub use network::{
    HttpWebchecker, LinkState, NetworkManager, PrimaryConnection, Redialer, Webchecker,
};
