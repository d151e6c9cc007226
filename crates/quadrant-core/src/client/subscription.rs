//! Client side of a SUBSCRIPTION.

use crate::config::StreamConfig;
use crate::connection::{ConnectionState, Lifecycle};
use crate::error::{Result, RpcError};
use crate::shape::Shape;
use crate::validate::validate;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Notification delivered by a [`Subscription`].
#[derive(Debug)]
pub enum StreamEvent<T> {
    /// The stream is open. Always the first notification.
    Opened,
    Message(T),
    /// A bad frame or a server-reported failure. The stream stays open
    /// unless the error is a transport error.
    Error(RpcError),
    /// The server closed the stream.
    Closed,
}

/// A live server-push stream.
///
/// Dropping the subscription closes it and releases the transport.
pub struct Subscription<T> {
    events: mpsc::Receiver<StreamEvent<T>>,
    lifecycle: Arc<Lifecycle>,
    shutdown: watch::Sender<bool>,
}

impl<T> Subscription<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub(crate) fn start(procedure: String, shape: Shape, response: reqwest::Response) -> Self {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.mark_open();

        let (tx, rx) = mpsc::channel(StreamConfig::CLIENT_EVENT_BUFFER);
        let _ = tx.try_send(StreamEvent::Opened);
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(pump(
            Pump {
                procedure,
                shape,
                lifecycle: Arc::clone(&lifecycle),
                events: tx,
                shutdown: shutdown_rx,
            },
            response,
        ));

        Self {
            events: rx,
            lifecycle,
            shutdown,
        }
    }
}

impl<T> Subscription<T> {
    /// Next notification, or `None` once the stream has ended and every
    /// buffered notification was consumed.
    pub async fn next(&mut self) -> Option<StreamEvent<T>> {
        self.events.recv().await
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    /// Register a listener invoked exactly once when the stream ends.
    pub fn on_close<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lifecycle.on_close(Box::new(listener));
    }

    /// Close the stream locally. Calling this more than once, or after the
    /// server already closed it, is a no-op.
    pub fn close(&self) {
        if self.lifecycle.begin_close() {
            let _ = self.shutdown.send(true);
            self.lifecycle.finish(ConnectionState::Closed);
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.close();
    }
}

struct Pump<T> {
    procedure: String,
    shape: Shape,
    lifecycle: Arc<Lifecycle>,
    events: mpsc::Sender<StreamEvent<T>>,
    shutdown: watch::Receiver<bool>,
}

impl<T: DeserializeOwned> Pump<T> {
    /// Forward a notification. `false` once nobody is listening.
    async fn emit(&mut self, event: StreamEvent<T>) -> bool {
        tokio::select! {
            sent = self.events.send(event) => sent.is_ok(),
            _ = self.shutdown.changed() => false,
        }
    }

    fn decode(&self, data: &str) -> Result<T> {
        let value: serde_json::Value =
            serde_json::from_str(data).map_err(|e| RpcError::MalformedResponse {
                message: format!("event is not JSON: {}", e),
            })?;
        let value = validate(&self.shape, &value).map_err(|failure| RpcError::InvalidOutput {
            procedure: self.procedure.clone(),
            failure,
        })?;
        serde_json::from_value(value).map_err(|e| RpcError::MalformedResponse {
            message: e.to_string(),
        })
    }

    /// Handle one event frame. `false` ends the pump.
    async fn frame(&mut self, event: &str, data: String) -> bool {
        // A frame without an event field is a message
        let event = if event.is_empty() {
            StreamConfig::MESSAGE_EVENT
        } else {
            event
        };

        if event == StreamConfig::MESSAGE_EVENT {
            let notification = match self.decode(&data) {
                Ok(message) => StreamEvent::Message(message),
                Err(err) => {
                    debug!("Bad frame on {}: {}", self.procedure, err);
                    StreamEvent::Error(err)
                }
            };
            self.emit(notification).await
        } else if event == StreamConfig::CLOSE_EVENT {
            if self.lifecycle.finish(ConnectionState::Closed) {
                debug!("Server closed {}", self.procedure);
                self.emit(StreamEvent::Closed).await;
            }
            false
        } else if event == StreamConfig::ERROR_EVENT {
            self.emit(StreamEvent::Error(RpcError::Remote {
                status: None,
                message: data,
            }))
            .await
        } else {
            debug!("Ignoring {} event on {}", event, self.procedure);
            true
        }
    }

    async fn lost(&mut self, message: String) {
        if self.lifecycle.finish(ConnectionState::Errored) {
            warn!("Subscription {} lost: {}", self.procedure, message);
            self.emit(StreamEvent::Error(RpcError::Transport { message })).await;
        }
    }
}

async fn pump<T: DeserializeOwned>(mut pump: Pump<T>, response: reqwest::Response) {
    let mut frames = Box::pin(response.bytes_stream().eventsource());

    loop {
        let next = tokio::select! {
            _ = pump.shutdown.changed() => {
                debug!("Subscription {} closed locally", pump.procedure);
                return;
            }
            next = frames.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                if !pump.frame(&event.event, event.data).await {
                    return;
                }
            }
            Some(Err(e)) => {
                pump.lost(e.to_string()).await;
                return;
            }
            None => {
                pump.lost("stream ended without a close frame".to_string()).await;
                return;
            }
        }
    }
}
