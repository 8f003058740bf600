//! Network-side building blocks for connectivity tracking.
//!
//! This module provides:
//! - NetworkManager state and primary-connection watches
//! - Redialing with a jittered backoff schedule
//! - The HTTP reachability check

mod manager;
mod redial;
mod webcheck;

pub use manager::{LinkState, NetworkManager, PrimaryConnection, PrimaryConnectionWatch, StateWatch};
pub use redial::{jitter, jittered, RedialStats, Redialer};
pub use webcheck::{HttpWebchecker, Webchecker};
