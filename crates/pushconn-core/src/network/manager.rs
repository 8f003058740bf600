//! NetworkManager client: link state and primary connection.
//!
//! Reads the `State` and `PrimaryConnection` properties and turns the
//! `StateChanged` and `PropertiesChanged` signals into typed channels. Both
//! watches run a small forwarding task that lives as long as the returned
//! watch; the channel closes when the underlying subscription dies.

use crate::bus::{DynEndpoint, Watch};
use crate::cancel::CancellationToken;
use crate::config::BusConfig;
use crate::error::Result;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Link state as reported by NetworkManager, ordered by quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LinkState {
    #[default]
    Unknown,
    Asleep,
    Disconnected,
    Disconnecting,
    Connecting,
    ConnectedLocal,
    ConnectedSite,
    ConnectedGlobal,
}

impl LinkState {
    /// Map a NetworkManager `NMState` code; unrecognised codes are `Unknown`.
    pub fn from_code(code: u32) -> Self {
        match code {
            10 => LinkState::Asleep,
            20 => LinkState::Disconnected,
            30 => LinkState::Disconnecting,
            40 => LinkState::Connecting,
            50 => LinkState::ConnectedLocal,
            60 => LinkState::ConnectedSite,
            70 => LinkState::ConnectedGlobal,
            _ => LinkState::Unknown,
        }
    }

    /// The `NMState` code for this state.
    pub fn code(self) -> u32 {
        match self {
            LinkState::Unknown => 0,
            LinkState::Asleep => 10,
            LinkState::Disconnected => 20,
            LinkState::Disconnecting => 30,
            LinkState::Connecting => 40,
            LinkState::ConnectedLocal => 50,
            LinkState::ConnectedSite => 60,
            LinkState::ConnectedGlobal => 70,
        }
    }

    /// Only global connectivity is usable for reaching the push server.
    pub fn is_connected_global(self) -> bool {
        self == LinkState::ConnectedGlobal
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Unknown => "Unknown",
            LinkState::Asleep => "Asleep",
            LinkState::Disconnected => "Disconnected",
            LinkState::Disconnecting => "Disconnecting",
            LinkState::Connecting => "Connecting",
            LinkState::ConnectedLocal => "Connected Local",
            LinkState::ConnectedSite => "Connected Site",
            LinkState::ConnectedGlobal => "Connected Global",
        };
        f.write_str(name)
    }
}

impl From<LinkState> for crate::bus::BusValue {
    fn from(state: LinkState) -> Self {
        crate::bus::BusValue::U32(state.code())
    }
}

/// Object path of the connection currently holding the default route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PrimaryConnection(pub String);

impl fmt::Display for PrimaryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stream of link-state changes.
pub type StateWatch = Watch<LinkState>;

/// Stream of primary-connection changes.
pub type PrimaryConnectionWatch = Watch<PrimaryConnection>;

/// Typed access to the NetworkManager service behind an endpoint.
#[derive(Clone)]
pub struct NetworkManager {
    endpoint: DynEndpoint,
}

impl NetworkManager {
    pub fn new(endpoint: DynEndpoint) -> Self {
        Self { endpoint }
    }

    /// Current link state.
    pub async fn get_state(&self) -> Result<LinkState> {
        let value = self.endpoint.get_property(BusConfig::STATE_PROPERTY).await?;
        Ok(LinkState::from_code(value.as_u32(BusConfig::STATE_PROPERTY)?))
    }

    /// Current primary connection.
    pub async fn get_primary_connection(&self) -> Result<PrimaryConnection> {
        let value = self
            .endpoint
            .get_property(BusConfig::PRIMARY_CONNECTION_PROPERTY)
            .await?;
        let path = value.as_object_path(BusConfig::PRIMARY_CONNECTION_PROPERTY)?;
        Ok(PrimaryConnection(path.to_string()))
    }

    /// Subscribe to `StateChanged`.
    ///
    /// Payloads that don't carry a state code are logged and skipped.
    pub async fn watch_state(&self) -> Result<StateWatch> {
        let mut signals = self
            .endpoint
            .watch_signal(BusConfig::STATE_CHANGED_SIGNAL)
            .await?;
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                let args = tokio::select! {
                    _ = token.cancelled() => break,
                    args = signals.recv() => args,
                };
                let Some(args) = args else {
                    debug!("got not-OK from StateChanged watch");
                    break;
                };
                let state = match args.first().map(|v| v.as_u32(BusConfig::STATE_CHANGED_SIGNAL)) {
                    Some(Ok(code)) => LinkState::from_code(code),
                    Some(Err(e)) => {
                        warn!("Ignoring StateChanged payload: {}", e);
                        continue;
                    }
                    None => {
                        warn!("Ignoring empty StateChanged payload");
                        continue;
                    }
                };
                debug!("got network state {}", state);
                if tx.send(state).await.is_err() {
                    break;
                }
            }
        });

        Ok(Watch::new(rx, cancel))
    }

    /// Subscribe to changes of the `PrimaryConnection` property.
    ///
    /// Changes to other properties are ignored.
    pub async fn watch_primary_connection(&self) -> Result<PrimaryConnectionWatch> {
        let mut props = self.endpoint.watch_properties().await?;
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                let changed = tokio::select! {
                    _ = token.cancelled() => break,
                    changed = props.recv() => changed,
                };
                let Some(changed) = changed else {
                    debug!("got not-OK from PropertiesChanged watch");
                    break;
                };
                let Some(value) = changed.changed.get(BusConfig::PRIMARY_CONNECTION_PROPERTY) else {
                    continue;
                };
                let primary = match value.as_object_path(BusConfig::PRIMARY_CONNECTION_PROPERTY) {
                    Ok(path) => PrimaryConnection(path.to_string()),
                    Err(e) => {
                        warn!("Ignoring PrimaryConnection change: {}", e);
                        continue;
                    }
                };
                debug!("primary connection changed to {}", primary);
                if tx.send(primary).await.is_err() {
                    break;
                }
            }
        });

        Ok(Watch::new(rx, cancel))
    }
}

impl fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkManager")
            .field("endpoint", &self.endpoint.to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::{TestingEndpoint, Work};
    use crate::bus::BusValue;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn test_state_codes() {
        for state in [
            LinkState::Unknown,
            LinkState::Asleep,
            LinkState::Disconnected,
            LinkState::Disconnecting,
            LinkState::Connecting,
            LinkState::ConnectedLocal,
            LinkState::ConnectedSite,
            LinkState::ConnectedGlobal,
        ] {
            assert_eq!(LinkState::from_code(state.code()), state);
        }
        assert_eq!(LinkState::from_code(42), LinkState::Unknown);
    }

    #[test]
    fn test_state_order() {
        assert!(LinkState::ConnectedGlobal > LinkState::ConnectedSite);
        assert!(LinkState::Connecting > LinkState::Disconnected);
        assert!(LinkState::ConnectedGlobal.is_connected_global());
        assert!(!LinkState::ConnectedSite.is_connected_global());
        assert_eq!(LinkState::ConnectedGlobal.to_string(), "Connected Global");
    }

    #[tokio::test]
    async fn test_get_state() {
        let endp = TestingEndpoint::new(Work(true), Work(true), vec![LinkState::Connecting.into()]);
        let nm = NetworkManager::new(Arc::new(endp));
        assert_eq!(nm.get_state().await.unwrap(), LinkState::Connecting);
    }

    #[tokio::test]
    async fn test_get_state_fails() {
        let endp =
            TestingEndpoint::new(Work(true), Work(false), vec![LinkState::Connecting.into()]);
        let nm = NetworkManager::new(Arc::new(endp));
        assert!(nm.get_state().await.is_err());
    }

    #[tokio::test]
    async fn test_get_state_wrong_type() {
        let endp = TestingEndpoint::new(Work(true), Work(true), vec![BusValue::Str("up".into())]);
        let nm = NetworkManager::new(Arc::new(endp));
        assert!(nm.get_state().await.is_err());
    }

    #[tokio::test]
    async fn test_get_primary_connection() {
        let endp = TestingEndpoint::new(
            Work(true),
            Work(true),
            vec![BusValue::ObjectPath("/hello".into())],
        );
        let nm = NetworkManager::new(Arc::new(endp));
        assert_eq!(
            nm.get_primary_connection().await.unwrap(),
            PrimaryConnection("/hello".into())
        );
    }

    #[tokio::test]
    async fn test_watch_state() {
        let endp = TestingEndpoint::new(
            Work(true),
            Work(true),
            vec![LinkState::Connecting.into(), LinkState::ConnectedGlobal.into()],
        );
        let nm = NetworkManager::new(Arc::new(endp));
        let mut watch = nm.watch_state().await.unwrap();
        assert_eq!(watch.recv().await, Some(LinkState::Connecting));
        assert_eq!(watch.recv().await, Some(LinkState::ConnectedGlobal));
        assert_eq!(watch.recv().await, None);
    }

    #[tokio::test]
    async fn test_watch_primary_connection_filters_keys() {
        let endp = Arc::new(TestingEndpoint::new(Work(true), Work(true), vec![]));
        let source = endp.watch_source("PropertiesChanged");
        let nm = NetworkManager::new(endp.clone());
        let mut watch = nm.watch_primary_connection().await.unwrap();

        let other = HashMap::from([("WirelessEnabled".to_string(), BusValue::Bool(true))]);
        let primary = HashMap::from([(
            "PrimaryConnection".to_string(),
            BusValue::ObjectPath("/org/freedesktop/NetworkManager/ActiveConnection/3".into()),
        )]);
        source.send(vec![BusValue::Dict(other), BusValue::Array(vec![])]).await.unwrap();
        source.send(vec![BusValue::Dict(primary), BusValue::Array(vec![])]).await.unwrap();

        assert_eq!(
            watch.recv().await,
            Some(PrimaryConnection(
                "/org/freedesktop/NetworkManager/ActiveConnection/3".into()
            ))
        );
        drop(source);
        assert_eq!(watch.recv().await, None);
    }
}
