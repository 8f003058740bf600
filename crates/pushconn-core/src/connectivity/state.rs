//! The connectivity state machine.
//!
//! `ConnectedState` turns three inputs into a de-duplicated boolean:
//!
//! - link-state changes from NetworkManager,
//! - primary-connection changes,
//! - verdicts of the reachability check, started by a timer.
//!
//! Any link-state change cancels an in-flight check and reports
//! "disconnected" if "connected" was the last thing said. Reaching
//! `ConnectedGlobal` arms the timer with the stabilizing timeout; when it
//! fires the check runs, and only a passing check reports "connected". After
//! every verdict the check is scheduled again `recheck_timeout` later for as
//! long as the link stays globally connected.

use crate::bus::DynEndpoint;
use crate::cancel::CancellationToken;
use crate::config::{BusConfig, ConnectivityConfig, RedialConfig};
use crate::error::{ConnError, Result};
use crate::network::{
    LinkState, NetworkManager, PrimaryConnection, PrimaryConnectionWatch, Redialer, StateWatch,
    Webchecker,
};
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::DropGuard;
use tracing::{debug, info, warn};

/// One input consumed by `step()`.
enum Event {
    State(Option<LinkState>),
    Primary(Option<PrimaryConnection>),
    Timer,
    Webcheck(Option<bool>),
}

/// Mutable state of one tracking session.
///
/// Created per [`ConnectivityTracker`](super::ConnectivityTracker) run and
/// thrown away when a watch dies. Dropping it tears down its watches and any
/// check still in flight.
pub struct ConnectedState {
    config: ConnectivityConfig,
    endpoint: DynEndpoint,
    webchk: Arc<dyn Webchecker>,
    redialer: Redialer,
    cancel: CancellationToken,
    /// Cancels check tasks spawned by this instance.
    checks: CancellationToken,
    _checks_guard: DropGuard,
    last_sent: bool,
    conn_attempts: u32,
    current_state: LinkState,
    primary: Option<PrimaryConnection>,
    state_watch: Option<StateWatch>,
    primary_watch: Option<PrimaryConnectionWatch>,
    webget_rx: Option<mpsc::Receiver<bool>>,
    timer: Pin<Box<Sleep>>,
    timer_armed: bool,
}

impl ConnectedState {
    pub fn new(
        endpoint: DynEndpoint,
        config: ConnectivityConfig,
        webchk: Arc<dyn Webchecker>,
        redial: RedialConfig,
        cancel: CancellationToken,
    ) -> Self {
        let checks = CancellationToken::new();
        Self {
            config,
            endpoint,
            webchk,
            redialer: Redialer::new(redial, cancel.clone()),
            cancel,
            _checks_guard: checks.clone().drop_guard(),
            checks,
            last_sent: false,
            conn_attempts: 0,
            current_state: LinkState::Unknown,
            primary: None,
            state_watch: None,
            primary_watch: None,
            webget_rx: None,
            timer: Box::pin(tokio::time::sleep(Duration::ZERO)),
            timer_armed: false,
        }
    }

    /// Bus dial attempts made while starting, across all startup rounds.
    pub fn conn_attempts(&self) -> u32 {
        self.conn_attempts
    }

    /// The last value `step()` returned (`false` before the first step).
    pub fn last_sent(&self) -> bool {
        self.last_sent
    }

    /// Link state as of the last event consumed.
    pub fn current_state(&self) -> LinkState {
        self.current_state
    }

    /// Primary connection reported at startup, if it could be read.
    pub fn primary_connection(&self) -> Option<&PrimaryConnection> {
        self.primary.as_ref()
    }

    /// Dial the bus, subscribe to NetworkManager and read the initial state.
    ///
    /// A failed round closes the endpoint and starts over after a pause taken
    /// from the redial schedule (at least `restart_cooldown`). Rounds repeat
    /// until one succeeds, the attempt bound is reached, or the token is
    /// cancelled.
    pub async fn start(&mut self) -> Result<LinkState> {
        let mut rounds = 0u32;
        loop {
            self.cancel.check()?;
            rounds += 1;
            self.conn_attempts += self.redialer.auto_redial(self.endpoint.as_ref()).await;
            self.cancel.check()?;

            match self.try_start().await {
                Ok(initial) => {
                    debug!("got initial state of {}", initial);
                    return Ok(initial);
                }
                Err(e) => {
                    debug!("failed to start tracking: {}", e);
                    self.endpoint.close();
                }
            }

            if !self.redialer.config().allows_attempt(rounds) {
                return Err(ConnError::RetriesExhausted { attempts: rounds });
            }
            let pause = self.round_delay(rounds);
            debug!("retrying startup in {:?}", pause);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ConnError::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Pause after `rounds` failed startup rounds: the redial schedule,
    /// never shorter than `restart_cooldown`.
    fn round_delay(&self, rounds: u32) -> Duration {
        let config = self.redialer.config();
        self.redialer
            .delay_for(rounds.saturating_sub(1))
            .max(config.restart_cooldown)
    }

    async fn try_start(&mut self) -> Result<LinkState> {
        let nm = NetworkManager::new(self.endpoint.clone());

        // Watch first, read second: a change racing the read is still
        // delivered, at worst as a repeat of the initial state.
        let state_watch = nm.watch_state().await?;
        let primary_watch = nm.watch_primary_connection().await?;

        let initial = nm.get_state().await?;
        if initial == LinkState::Unknown {
            return Err(ConnError::bus("NetworkManager reported an unknown state"));
        }

        let primary = match nm.get_primary_connection().await {
            Ok(primary) => {
                debug!("primary connection starts as {}", primary);
                Some(primary)
            }
            Err(e) => {
                warn!("unable to read primary connection: {}", e);
                None
            }
        };

        self.state_watch = Some(state_watch);
        self.primary_watch = Some(primary_watch);
        self.primary = primary;
        self.current_state = initial;
        self.webget_rx = None;
        self.last_sent = false;
        if initial.is_connected_global() {
            self.arm_timer(self.config.stabilizing_timeout);
        } else {
            self.timer_armed = false;
        }
        Ok(initial)
    }

    fn arm_timer(&mut self, after: Duration) {
        self.timer.as_mut().reset(Instant::now() + after);
        self.timer_armed = true;
    }

    fn start_webcheck(&mut self) {
        let (tx, rx) = mpsc::channel(1);
        self.webget_rx = Some(rx);
        let webchk = self.webchk.clone();
        let checks = self.checks.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = checks.cancelled() => {}
                _ = webchk.webcheck(tx) => {}
            }
        });
    }

    async fn next_event(&mut self) -> Result<Event> {
        let Some(state_watch) = self.state_watch.as_mut() else {
            return Err(ConnError::Other("connectivity tracking not started".to_string()));
        };
        let primary_watch = self.primary_watch.as_mut();
        let webget_rx = self.webget_rx.as_mut();
        let timer = self.timer.as_mut();
        let timer_armed = self.timer_armed;

        let event = tokio::select! {
            primary = async move {
                match primary_watch {
                    Some(watch) => watch.recv().await,
                    None => pending().await,
                }
            } => Event::Primary(primary),
            state = state_watch.recv() => Event::State(state),
            _ = timer, if timer_armed => Event::Timer,
            verdict = async move {
                match webget_rx {
                    Some(rx) => rx.recv().await,
                    None => pending().await,
                }
            } => Event::Webcheck(verdict),
        };
        Ok(event)
    }

    /// Block until the connectivity verdict changes and return the new value.
    ///
    /// Events that don't change the verdict are consumed silently, so two
    /// consecutive calls never return the same value. Fails when a watch
    /// closes; the instance is unusable afterwards.
    ///
    /// Verdicts are re-checked every `recheck_timeout` while the link stays
    /// `ConnectedGlobal`. A failing re-check after `true` returns `false`
    /// right away instead of holding `true` until the next link event.
    pub async fn step(&mut self) -> Result<bool> {
        loop {
            match self.next_event().await? {
                Event::State(None) => {
                    return Err(ConnError::WatchClosed {
                        member: BusConfig::STATE_CHANGED_SIGNAL.to_string(),
                    });
                }
                Event::Primary(None) => {
                    return Err(ConnError::WatchClosed {
                        member: BusConfig::PROPERTIES_CHANGED_SIGNAL.to_string(),
                    });
                }
                Event::State(Some(state)) => {
                    self.webget_rx = None;
                    self.current_state = state;
                    if state.is_connected_global() {
                        self.arm_timer(self.config.stabilizing_timeout);
                    } else {
                        self.timer_armed = false;
                    }
                    debug!("State changed to {}. Assuming disconnect.", state);
                    if self.last_sent {
                        info!("Sending 'disconnected'.");
                        self.last_sent = false;
                        return Ok(false);
                    }
                }
                Event::Primary(Some(primary)) => {
                    self.primary = Some(primary.clone());
                    if !self.current_state.is_connected_global() {
                        debug!(
                            "Primary connection changed to {} while {}; ignoring.",
                            primary, self.current_state
                        );
                        continue;
                    }
                    debug!("Primary connection changed to {}. Re-checking.", primary);
                    self.webget_rx = None;
                    self.arm_timer(self.config.stabilizing_timeout);
                    if self.last_sent {
                        info!("Sending 'disconnected'.");
                        self.last_sent = false;
                        return Ok(false);
                    }
                }
                Event::Timer => {
                    self.timer_armed = false;
                    if self.current_state.is_connected_global() {
                        debug!("May be connected; checking...");
                        self.start_webcheck();
                    }
                }
                Event::Webcheck(verdict) => {
                    self.webget_rx = None;
                    let connected = verdict.unwrap_or(false);
                    debug!("Connection check says: {}", connected);
                    self.arm_timer(self.config.recheck_timeout);
                    if connected != self.last_sent {
                        if connected {
                            info!("Sending 'connected'.");
                        } else {
                            info!("Sending 'disconnected'.");
                        }
                        self.last_sent = connected;
                        return Ok(connected);
                    }
                }
            }
        }
    }
}
