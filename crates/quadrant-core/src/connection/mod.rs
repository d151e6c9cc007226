//! Live streaming connections and their lifecycle.
//!
//! Every push-stream and duplex connection moves through
//! `Connecting -> Open -> Closing -> Closed`, with `Errored` reachable from
//! any non-terminal state when the transport drops. Entering a terminal state
//! happens exactly once: close listeners run at that moment, and every later
//! close request is a no-op.

mod duplex;
mod push;

pub use duplex::DuplexConnection;
pub use push::PushConnection;

pub(crate) use duplex::{DuplexCore, Outbound, Side};
pub(crate) use push::{PushCore, PushFrame};

use serde::Serialize;
use std::any::Any;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
    /// The transport dropped without a protocol-level close.
    Errored,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }
}

type CloseListener = Box<dyn FnOnce() + Send>;

/// State machine shared by both connection flavours and by client-side
/// subscriptions.
pub(crate) struct Lifecycle {
    state: watch::Sender<ConnectionState>,
    close_listeners: Mutex<Vec<CloseListener>>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            state,
            close_listeners: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// `Connecting -> Open`.
    pub(crate) fn mark_open(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Open;
                true
            } else {
                false
            }
        })
    }

    /// `Connecting | Open -> Closing`. Returns `false` if a close is
    /// already under way or done.
    pub(crate) fn begin_close(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            ConnectionState::Connecting | ConnectionState::Open => {
                *state = ConnectionState::Closing;
                true
            }
            _ => false,
        })
    }

    /// Enter `terminal` and run the close listeners. Only the first call
    /// has any effect.
    pub(crate) fn finish(&self, terminal: ConnectionState) -> bool {
        debug_assert!(terminal.is_terminal());

        let listeners = {
            let mut listeners = lock(&self.close_listeners);
            let changed = self.state.send_if_modified(|state| {
                if state.is_terminal() {
                    false
                } else {
                    *state = terminal;
                    true
                }
            });
            if !changed {
                return false;
            }
            std::mem::take(&mut *listeners)
        };

        for listener in listeners {
            listener();
        }
        true
    }

    /// Register a close listener. Runs immediately if already terminal.
    pub(crate) fn on_close(&self, listener: CloseListener) {
        let mut listeners = lock(&self.close_listeners);
        if self.state().is_terminal() {
            drop(listeners);
            listener();
        } else {
            listeners.push(listener);
        }
    }

    /// Resolve once the connection reaches a terminal state.
    pub(crate) async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(ConnectionState::is_terminal).await;
    }
}

/// Lock a mutex, recovering the data if a listener panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "implementation panicked".to_string()
    }
}
