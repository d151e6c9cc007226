//! BIDIRECTIONAL connections, shared by the client and the dispatcher.
//!
//! Inbound frames are processed one at a time in arrival order. Every
//! registered message listener receives every inbound message, in
//! registration order; with no listener the message is dropped. A listener
//! failure never tears the connection down: the server answers it with a
//! failure payload on the same connection, and both sides notify their
//! error listeners.

use super::{lock, panic_message, ConnectionState, Lifecycle};
use crate::error::{Result, RpcError};
use crate::shape::Shape;
use crate::validate::{validate, ValidationFailure, Violation};
use crate::wire;
use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Frame handed to the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outbound {
    Text(String),
    Close,
}

/// Which end of the connection this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

type MessageListener = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type ErrorListener = Arc<dyn Fn(&RpcError) + Send + Sync>;

pub(crate) struct DuplexCore {
    procedure: String,
    side: Side,
    send_shape: Shape,
    recv_shape: Shape,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    listeners: Mutex<Vec<(String, MessageListener)>>,
    error_listeners: Mutex<Vec<ErrorListener>>,
    lifecycle: Lifecycle,
}

impl DuplexCore {
    pub(crate) fn new(
        procedure: impl Into<String>,
        side: Side,
        send_shape: Shape,
        recv_shape: Shape,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            procedure: procedure.into(),
            side,
            send_shape,
            recv_shape,
            outbound: Mutex::new(Some(outbound)),
            listeners: Mutex::new(Vec::new()),
            error_listeners: Mutex::new(Vec::new()),
            lifecycle: Lifecycle::new(),
        }
    }

    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn push(&self, frame: Outbound) -> Result<()> {
        match lock(&self.outbound).as_ref() {
            Some(outbound) => outbound.send(frame).map_err(|_| RpcError::ConnectionClosed),
            None => Err(RpcError::ConnectionClosed),
        }
    }

    fn send_value(&self, value: Value) -> Result<()> {
        // Closing and closed connections never queue
        if !self.lifecycle.state().is_open() {
            return Err(RpcError::ConnectionClosed);
        }

        let value = validate(&self.send_shape, &value).map_err(|failure| match self.side {
            Side::Server => RpcError::InvalidOutput {
                procedure: self.procedure.clone(),
                failure,
            },
            Side::Client => RpcError::InvalidInput {
                procedure: self.procedure.clone(),
                failure,
            },
        })?;
        self.push(Outbound::Text(value.to_string()))
    }

    fn add_listener(&self, name: String, listener: MessageListener) {
        if self.lifecycle.state().is_terminal() {
            return;
        }
        lock(&self.listeners).push((name, listener));
    }

    fn add_error_listener(&self, listener: ErrorListener) {
        if self.lifecycle.state().is_terminal() {
            return;
        }
        lock(&self.error_listeners).push(listener);
    }

    /// Handle one inbound text frame.
    pub(crate) async fn dispatch_inbound(&self, text: &str) {
        if !self.lifecycle.state().is_open() {
            debug!("Ignoring frame on {}: connection not open", self.procedure);
            return;
        }

        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                let err = match self.side {
                    Side::Server => self.rejected_input(format!("malformed JSON: {}", e)),
                    Side::Client => RpcError::MalformedResponse {
                        message: e.to_string(),
                    },
                };
                self.report_failure(err);
                return;
            }
        };

        if self.side == Side::Client {
            if let Some(message) = wire::parse_failure_frame(&value) {
                self.notify_error(&RpcError::Remote {
                    status: None,
                    message,
                });
                return;
            }
        }

        let value = match validate(&self.recv_shape, &value) {
            Ok(value) => value,
            Err(failure) => {
                let procedure = self.procedure.clone();
                let err = match self.side {
                    Side::Server => RpcError::InvalidInput { procedure, failure },
                    Side::Client => RpcError::InvalidOutput { procedure, failure },
                };
                self.report_failure(err);
                return;
            }
        };

        let listeners: Vec<(String, MessageListener)> = lock(&self.listeners).clone();
        if listeners.is_empty() {
            debug!("Dropping message on {}: no listeners", self.procedure);
            return;
        }

        for (name, listener) in listeners {
            let message = value.clone();
            let outcome = AssertUnwindSafe(async move { listener(message).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!("Listener {} on {} failed: {}", name, self.procedure, err);
                    self.report_failure(err);
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!("Listener {} on {} panicked: {}", name, self.procedure, message);
                    self.report_failure(RpcError::Procedure(message));
                }
            }
        }
    }

    /// Surface an application-level failure without closing the connection.
    pub(crate) fn report_failure(&self, err: RpcError) {
        if self.side == Side::Server {
            if self.lifecycle.state().is_open() {
                let _ = self.push(Outbound::Text(wire::failure_frame(&err.to_string())));
            }
            warn!("{} failed: {}", self.procedure, err);
        }
        self.notify_error(&err);
    }

    fn notify_error(&self, err: &RpcError) {
        let listeners: Vec<ErrorListener> = lock(&self.error_listeners).clone();
        if listeners.is_empty() && self.side == Side::Client {
            warn!("Unhandled error on {}: {}", self.procedure, err);
        }
        for listener in listeners {
            listener(err);
        }
    }

    fn rejected_input(&self, message: String) -> RpcError {
        RpcError::InvalidInput {
            procedure: self.procedure.clone(),
            failure: ValidationFailure {
                violations: vec![Violation {
                    path: "$".to_string(),
                    message,
                }],
            },
        }
    }

    /// Initiate a close: send the close frame, then tear down locally.
    pub(crate) fn close(&self) {
        if !self.lifecycle.begin_close() {
            return;
        }
        let _ = self.push(Outbound::Close);
        self.release(ConnectionState::Closed);
        debug!("Closed duplex connection {}", self.procedure);
    }

    /// The peer sent a close frame.
    pub(crate) fn remote_closed(&self) {
        self.lifecycle.begin_close();
        if self.release(ConnectionState::Closed) {
            debug!("Peer closed duplex connection {}", self.procedure);
        }
    }

    /// The socket dropped without a close handshake.
    pub(crate) fn transport_lost(&self, err: RpcError) {
        if self.lifecycle.state().is_terminal() {
            return;
        }
        warn!("Duplex connection {} lost: {}", self.procedure, err);
        self.notify_error(&err);
        self.release(ConnectionState::Errored);
    }

    fn release(&self, terminal: ConnectionState) -> bool {
        if !self.lifecycle.finish(terminal) {
            return false;
        }
        lock(&self.listeners).clear();
        lock(&self.error_listeners).clear();
        lock(&self.outbound).take();
        true
    }
}

/// One end of a BIDIRECTIONAL exchange.
///
/// `S` is what this side sends, `R` what it receives: the server holds a
/// `DuplexConnection<Output, Input>` and the client the mirror
/// `DuplexConnection<Input, Output>`. Clones share the same connection.
///
/// The handle returned by [`RpcClient::connect`](crate::RpcClient::connect)
/// owns the socket: once it and all of its clones are dropped the connection
/// is closed as if [`close`](Self::close) had been called. Handles passed to
/// listeners and server handlers do not own it.
pub struct DuplexConnection<S, R> {
    core: Arc<DuplexCore>,
    owner: Option<Arc<CloseOnDrop>>,
    _marker: PhantomData<fn(S) -> R>,
}

/// Closes the connection when the last owning handle goes away.
struct CloseOnDrop(Arc<DuplexCore>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if !self.0.lifecycle.state().is_terminal() {
            debug!("Last handle to {} dropped, closing", self.0.procedure);
        }
        self.0.close();
    }
}

impl<S, R> Clone for DuplexConnection<S, R> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            owner: self.owner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<S, R> DuplexConnection<S, R> {
    pub(crate) fn from_core(core: Arc<DuplexCore>) -> Self {
        Self {
            core,
            owner: None,
            _marker: PhantomData,
        }
    }

    /// A handle that closes the connection when it and its clones drop.
    pub(crate) fn owned(core: Arc<DuplexCore>) -> Self {
        let owner = Arc::new(CloseOnDrop(Arc::clone(&core)));
        Self {
            core,
            owner: Some(owner),
            _marker: PhantomData,
        }
    }

    /// Register a listener invoked exactly once when the connection ends,
    /// before its resources are released.
    pub fn on_close<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.lifecycle.on_close(Box::new(listener));
    }

    /// Register a listener for application-level failures: failure payloads
    /// from the peer, invalid inbound frames, listener errors and transport
    /// loss.
    pub fn on_error<F>(&self, listener: F)
    where
        F: Fn(&RpcError) + Send + Sync + 'static,
    {
        self.core.add_error_listener(Arc::new(listener));
    }

    /// Close the connection. Calling this more than once is a no-op.
    pub fn close(&self) {
        self.core.close();
    }

    pub fn state(&self) -> ConnectionState {
        self.core.lifecycle.state()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Wait until the connection has ended.
    pub async fn closed(&self) {
        self.core.lifecycle.closed().await
    }

    pub fn procedure(&self) -> &str {
        &self.core.procedure
    }
}

impl<S: Serialize, R> DuplexConnection<S, R> {
    /// Send one message. Fails with `ConnectionClosed` once a close has begun.
    pub fn send(&self, message: &S) -> Result<()> {
        self.core.send_value(serde_json::to_value(message)?)
    }
}

impl<S, R> DuplexConnection<S, R>
where
    S: Send + 'static,
    R: DeserializeOwned + Send + 'static,
{
    /// Register a named message listener.
    ///
    /// Listeners receive a handle to the connection so they can reply or
    /// close it. Names label the listener in logs; every listener sees every
    /// inbound message.
    pub fn on_message<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(DuplexConnection<S, R>, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let core: Weak<DuplexCore> = Arc::downgrade(&self.core);
        let listener: MessageListener = Arc::new(move |value: Value| {
            let Some(core) = core.upgrade() else {
                return future::ready(Ok(())).boxed();
            };
            match serde_json::from_value::<R>(value) {
                Ok(message) => handler(DuplexConnection::from_core(core), message).boxed(),
                Err(e) => future::ready(Err(RpcError::from(e))).boxed(),
            }
        });
        self.core.add_listener(name.into(), listener);
    }
}
