//! Server side of a SUBSCRIPTION: a send-only connection pushing events.

use super::{lock, ConnectionState, Lifecycle};
use crate::error::{Result, RpcError};
use crate::shape::Shape;
use crate::validate::validate;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Frame handed to the transport writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PushFrame {
    Event(String),
    Error(String),
    Close,
}

pub(crate) struct PushCore {
    procedure: String,
    output: Shape,
    sender: Mutex<Option<mpsc::UnboundedSender<PushFrame>>>,
    lifecycle: Lifecycle,
}

impl PushCore {
    pub(crate) fn new(
        procedure: impl Into<String>,
        output: Shape,
        sender: mpsc::UnboundedSender<PushFrame>,
    ) -> Self {
        Self {
            procedure: procedure.into(),
            output,
            sender: Mutex::new(Some(sender)),
            lifecycle: Lifecycle::new(),
        }
    }

    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub(crate) fn procedure(&self) -> &str {
        &self.procedure
    }

    fn send_frame(&self, frame: PushFrame) -> Result<()> {
        match lock(&self.sender).as_ref() {
            Some(sender) => sender.send(frame).map_err(|_| RpcError::ConnectionClosed),
            None => Err(RpcError::ConnectionClosed),
        }
    }

    fn write_value(&self, value: serde_json::Value) -> Result<()> {
        if !self.lifecycle.state().is_open() {
            return Err(RpcError::ConnectionClosed);
        }

        let value = validate(&self.output, &value).map_err(|failure| RpcError::InvalidOutput {
            procedure: self.procedure.clone(),
            failure,
        })?;
        self.send_frame(PushFrame::Event(value.to_string()))
    }

    /// Send the close frame, run close listeners, then release the writer.
    pub(crate) fn close(&self) {
        if !self.lifecycle.begin_close() {
            return;
        }
        let _ = self.send_frame(PushFrame::Close);
        self.release(ConnectionState::Closed);
        debug!("Closed push stream {}", self.procedure);
    }

    /// Report an implementation failure to the client and end the stream.
    pub(crate) fn fail(&self, err: &RpcError) {
        warn!("Push stream {} failed: {}", self.procedure, err);
        if self.lifecycle.state().is_open() {
            // SSE field values cannot carry carriage returns
            let message = err.to_string().replace('\r', "");
            let _ = self.send_frame(PushFrame::Error(message));
        }
        self.close();
    }

    /// The client went away.
    pub(crate) fn transport_dropped(&self) {
        if self.release(ConnectionState::Closed) {
            debug!("Client disconnected from {}", self.procedure);
        }
    }

    fn release(&self, terminal: ConnectionState) -> bool {
        let finished = self.lifecycle.finish(terminal);
        if finished {
            lock(&self.sender).take();
        }
        finished
    }
}

/// Server-side handle of an open SUBSCRIPTION.
///
/// Handed to the implementation, which may clone it into fan-out registry
/// callbacks. Events are validated against the procedure's output shape
/// before they leave the server.
pub struct PushConnection<T> {
    core: Arc<PushCore>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for PushConnection<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<T> PushConnection<T> {
    pub(crate) fn from_core(core: Arc<PushCore>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    /// Close the stream. Calling this more than once is a no-op.
    pub fn close(&self) {
        self.core.close();
    }

    /// Register a listener invoked exactly once when the stream ends,
    /// whether closed by the implementation, by shutdown or by the client.
    pub fn on_close<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.lifecycle.on_close(Box::new(listener));
    }

    pub fn state(&self) -> ConnectionState {
        self.core.lifecycle.state()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Wait until the stream has ended.
    pub async fn closed(&self) {
        self.core.lifecycle.closed().await
    }

    pub fn procedure(&self) -> &str {
        &self.core.procedure
    }
}

impl<T: Serialize> PushConnection<T> {
    /// Push one event to the client.
    pub fn write(&self, event: &T) -> Result<()> {
        self.core.write_value(serde_json::to_value(event)?)
    }
}
