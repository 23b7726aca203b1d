//! Connection state machine
//!
//! ```text
//! Connecting --> Connected
//!     |              |
//!     +----> Faulted <+
//! ```
//!
//! `Faulted` is terminal. The first recorded fault wins; later faults are
//! logged and dropped. A watch channel signals that background
//! establishment has finished, whatever its outcome.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::EipError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 1,
    Connected = 2,
    Faulted = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            2 => ConnectionState::Connected,
            3 => ConnectionState::Faulted,
            _ => ConnectionState::Connecting,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Faulted => write!(f, "Faulted"),
        }
    }
}

/// Shared connection state with a sticky first fault
#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
    fault: OnceLock<EipError>,
    finished: watch::Sender<bool>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            fault: OnceLock::new(),
            finished,
        }
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }

    pub fn is_faulted(&self) -> bool {
        self.get() == ConnectionState::Faulted
    }

    /// Connecting -> Connected; false if the cell already left Connecting
    pub fn try_set_connected(&self) -> bool {
        if self.fault.get().is_some() {
            return false;
        }
        let moved = self
            .state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Connected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if moved {
            debug!("Connection state: Connecting -> Connected");
        }
        moved
    }

    /// Record a fault. Returns true if this call caused the transition.
    ///
    /// The cause is stored before `Faulted` is published.
    pub fn fault(&self, cause: EipError) -> bool {
        let message = cause.to_string();
        if self.fault.set(cause).is_err() {
            debug!(cause = %message, "Dropping fault, cell already faulted");
            return false;
        }
        let previous = self.state.swap(ConnectionState::Faulted as u8, Ordering::AcqRel);
        warn!(
            from = %ConnectionState::from_u8(previous),
            cause = %message,
            "Connection faulted"
        );
        true
    }

    /// Cause of the first fault, once faulted
    pub fn fault_cause(&self) -> Option<&EipError> {
        self.fault.get()
    }

    /// Signal that background establishment has finished
    pub fn mark_finished(&self) {
        self.finished.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Wait up to `timeout` for establishment to finish; true if connected
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        if self.is_connected() {
            return true;
        }
        let mut rx = self.finished.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await;
        self.is_connected()
    }
}
