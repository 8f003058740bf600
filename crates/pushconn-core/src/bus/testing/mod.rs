//! In-process [`Endpoint`] double for tests.
//!
//! `TestingEndpoint` consults a dial [`Condition`] before `dial()` and a call
//! condition before every `call()`, `get_property()` and watch. Successful
//! calls hand out the scripted return values in order. Watches either replay
//! the remaining return values (10ms apart) or, when a watch source was
//! installed for the member, forward whatever the test sends into it.

pub mod condition;

use crate::bus::{BusValue, Endpoint, PropertiesChanged, PropertiesWatch, SignalWatch, Watch};
use crate::cancel::CancellationToken;
use crate::config::BusConfig;
use crate::error::{ConnError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub use condition::{Chain, Condition, Fail2Work, Work};

/// Delay between replayed watch values.
const REPLAY_INTERVAL: Duration = Duration::from_millis(10);

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CallArgs {
    pub member: String,
    pub args: Vec<BusValue>,
}

type SharedSource = Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<BusValue>>>>;

/// Scripted endpoint. See the module docs.
pub struct TestingEndpoint {
    dial_cond: Box<dyn Condition>,
    call_cond: Box<dyn Condition>,
    retvals: Vec<Vec<BusValue>>,
    used: Mutex<usize>,
    watch_sources: Mutex<HashMap<String, SharedSource>>,
    call_args: Mutex<Vec<CallArgs>>,
}

impl TestingEndpoint {
    /// Build an endpoint whose calls each return a single value, in order.
    pub fn new(
        dial_cond: impl Condition + 'static,
        call_cond: impl Condition + 'static,
        retvals: Vec<BusValue>,
    ) -> Self {
        Self::multi_valued(dial_cond, call_cond, retvals.into_iter().map(|v| vec![v]).collect())
    }

    /// Build an endpoint whose calls return whole value lists, in order.
    pub fn multi_valued(
        dial_cond: impl Condition + 'static,
        call_cond: impl Condition + 'static,
        retvals: Vec<Vec<BusValue>>,
    ) -> Self {
        Self {
            dial_cond: Box::new(dial_cond),
            call_cond: Box::new(call_cond),
            retvals,
            used: Mutex::new(0),
            watch_sources: Mutex::new(HashMap::new()),
            call_args: Mutex::new(Vec::new()),
        }
    }

    /// Install a source for watches on `member` and return its feeding end.
    ///
    /// Values sent on the returned sender are delivered to the active watch.
    /// Dropping the sender terminates that watch and every later one.
    pub fn watch_source(&self, member: &str) -> mpsc::Sender<Vec<BusValue>> {
        let (tx, rx) = mpsc::channel(16);
        self.lock_sources()
            .insert(member.to_string(), Arc::new(tokio::sync::Mutex::new(rx)));
        tx
    }

    /// Arguments of every call made so far, including the `::`-prefixed
    /// bookkeeping entries for `set_property` and `close`.
    pub fn call_args(&self) -> Vec<CallArgs> {
        self.lock_calls().clone()
    }

    fn lock_sources(&self) -> std::sync::MutexGuard<'_, HashMap<String, SharedSource>> {
        self.watch_sources.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<CallArgs>> {
        self.call_args.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, member: &str, args: Vec<BusValue>) {
        self.lock_calls().push(CallArgs {
            member: member.to_string(),
            args,
        });
    }

    fn next_index(&self) -> usize {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        let idx = *used;
        *used += 1;
        idx
    }

    fn spawn_feed<T, F>(&self, member: &str, map: F) -> Result<Watch<T>>
    where
        T: Send + 'static,
        F: Fn(Vec<BusValue>) -> Option<T> + Send + 'static,
    {
        if !self.call_cond.ok() {
            return Err(ConnError::WatchFailed {
                member: member.to_string(),
                message: "no way".to_string(),
            });
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(16);
        let source = self.lock_sources().get(member).cloned();

        match source {
            Some(source) => {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut source = tokio::select! {
                        _ = cancel.cancelled() => return,
                        guard = source.lock_owned() => guard,
                    };
                    loop {
                        let values = tokio::select! {
                            _ = cancel.cancelled() => break,
                            v = source.recv() => v,
                        };
                        let Some(values) = values else { break };
                        let Some(item) = map(values) else { continue };
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                });
            }
            None => {
                let idx = self.next_index();
                let replay: Vec<Vec<BusValue>> = self.retvals.iter().skip(idx).cloned().collect();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    for values in replay {
                        let Some(item) = map(values) else { continue };
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            sent = tx.send(item) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(REPLAY_INTERVAL) => {}
                        }
                    }
                });
            }
        }

        Ok(Watch::new(rx, cancel))
    }
}

fn translate_properties(values: Vec<BusValue>) -> Option<PropertiesChanged> {
    let mut values = values.into_iter();
    let changed = match values.next()? {
        BusValue::Dict(changed) => changed,
        _ => return None,
    };
    let invalidated = match values.next() {
        Some(BusValue::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                BusValue::Str(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    Some(PropertiesChanged {
        changed,
        invalidated,
    })
}

#[async_trait]
impl Endpoint for TestingEndpoint {
    async fn dial(&self) -> Result<()> {
        if self.dial_cond.ok() {
            Ok(())
        } else {
            Err(ConnError::bus("dialCond said No."))
        }
    }

    async fn call(&self, member: &str, args: Vec<BusValue>) -> Result<Vec<BusValue>> {
        self.record(member, args);
        if !self.call_cond.ok() {
            return Err(ConnError::bus("no way"));
        }
        let idx = self.next_index();
        Ok(self.retvals.get(idx).cloned().unwrap_or_default())
    }

    async fn get_property(&self, property: &str) -> Result<BusValue> {
        self.call(property, Vec::new())
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ConnError::bus(format!("no return value provided for {}", property)))
    }

    async fn set_property(&self, property: &str, suffix: &str, value: BusValue) -> Result<()> {
        self.record("::SetProperty", vec![property.into(), suffix.into(), value]);
        Ok(())
    }

    async fn watch_signal(&self, member: &str) -> Result<SignalWatch> {
        self.spawn_feed(member, Some)
    }

    async fn watch_properties(&self) -> Result<PropertiesWatch> {
        self.spawn_feed(BusConfig::PROPERTIES_CHANGED_SIGNAL, translate_properties)
    }

    fn close(&self) {
        self.record("::Close", Vec::new());
    }
}

impl fmt::Display for TestingEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TestingEndpoint{{dial_cond:({}) call_cond:({}) retvals:({:?})}}",
            self.dial_cond, self.call_cond, self.retvals
        )
    }
}
