//! Connectivity tracking.
//!
//! [`ConnectivityTracker`] is the entry point: it owns the bus endpoint and
//! the webcheck, and publishes a de-duplicated stream of "are we online"
//! booleans. [`ConnectedState`] is the state machine behind it.

mod state;
mod tracker;

pub use state::ConnectedState;
pub use tracker::ConnectivityTracker;
