//! HTTP server hosting the procedure implementations.
//!
//! Binds an axum router with one route per wire endpoint and dispatches
//! every `/_api/<service>/<procedure>` request by method kind.
//!
//! # Thread Safety
//!
//! Each HTTP request and each streaming connection runs in its own task.
//! Inbound duplex messages are processed sequentially per connection and
//! concurrently across connections.

mod dispatch;
mod implementation;

pub use implementation::{RequestContext, ServiceImplementation, ServiceImplementationBuilder};

use crate::config::ServerConfig;
use crate::error::{Result, RpcError};
use crate::schema::ApiSchema;
use axum::extract::Request;
use axum::response::Response;
use dispatch::DispatchState;
use implementation::Handler;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{error, info};

/// Handler for the non-RPC webhook endpoint.
///
/// The request is passed through untouched; the transport never inspects it.
#[async_trait::async_trait]
pub trait WebhookHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

/// Handle to a running server. Dropping shuts down the server.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://<addr>`, suitable for [`ClientConfig::new`](crate::config::ClientConfig::new).
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Shut down the server gracefully.
    ///
    /// Stops accepting new connections and closes every live push-stream and
    /// duplex connection, which runs their close listeners.
    pub fn shutdown(&mut self) {
        // Signal accept loop to stop
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Signal all streaming connections to close
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Wait for the server task to finish after [`shutdown`](Self::shutdown).
    pub async fn join(mut self) {
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// A schema together with the implementation of every procedure in it.
pub struct RpcServer {
    schema: Arc<ApiSchema>,
    handlers: HashMap<String, HashMap<String, Handler>>,
    webhook: Option<Arc<dyn WebhookHandler>>,
}

impl RpcServer {
    /// Pair a schema with its implementations.
    ///
    /// Fails if an implementation targets a service the schema does not
    /// declare (or declares differently), if a service is implemented twice,
    /// or if a declared service has no implementation.
    pub fn new(schema: ApiSchema, implementations: Vec<ServiceImplementation>) -> Result<Self> {
        let mut handlers = HashMap::new();

        for implementation in implementations {
            let (service, service_handlers) = implementation.into_parts();

            match schema.service(service.name()) {
                Some(declared) if *declared == service => {}
                Some(_) => {
                    return Err(RpcError::Config {
                        message: format!(
                            "Implementation of {} does not match its schema declaration",
                            service.name()
                        ),
                    })
                }
                None => {
                    return Err(RpcError::Config {
                        message: format!("Service {} is not part of the schema", service.name()),
                    })
                }
            }

            if handlers
                .insert(service.name().to_string(), service_handlers)
                .is_some()
            {
                return Err(RpcError::DuplicateService {
                    service: service.name().to_string(),
                });
            }
        }

        let implemented: HashSet<&str> = handlers.keys().map(String::as_str).collect();
        for service in schema.services() {
            if implemented.contains(service.name()) {
                continue;
            }
            if let Some(procedure) = service.procedures().first() {
                return Err(RpcError::MissingImplementation {
                    service: service.name().to_string(),
                    procedure: procedure.name().to_string(),
                });
            }
        }

        Ok(Self {
            schema: Arc::new(schema),
            handlers,
            webhook: None,
        })
    }

    /// Forward `POST /_webhook` to `handler`.
    pub fn with_webhook<W: WebhookHandler>(mut self, handler: W) -> Self {
        self.webhook = Some(Arc::new(handler));
        self
    }

    pub fn schema(&self) -> &ApiSchema {
        &self.schema
    }

    /// Bind and start serving in a background task.
    pub async fn start(self, config: &ServerConfig) -> Result<ServerHandle> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("Server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let state = Arc::new(DispatchState {
            schema: self.schema,
            handlers: self.handlers,
            webhook: self.webhook,
            keep_alive: config.keep_alive,
            conn_shutdown: conn_shutdown_rx,
        });
        let app = dispatch::router(state);

        let task_handle = tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown_rx.await;
                info!("Server shutting down");
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
            {
                error!("Server error: {}", e);
            }
        });

        Ok(ServerHandle {
            addr,
            port,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{MethodKind, Procedure, Service};
    use crate::shape::Shape;

    fn schema() -> ApiSchema {
        ApiSchema::builder()
            .service(
                Service::builder("Health")
                    .procedure(Procedure::new(
                        "Ping",
                        MethodKind::Query,
                        Shape::object(),
                        Shape::any(),
                    ))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_unimplemented_service_is_rejected() {
        match RpcServer::new(schema(), Vec::new()) {
            Err(RpcError::MissingImplementation { service, procedure }) => {
                assert_eq!(service, "Health");
                assert_eq!(procedure, "Ping");
            }
            Err(e) => panic!("Expected MissingImplementation, got: {:?}", e),
            Ok(_) => panic!("Expected MissingImplementation"),
        }
    }

    #[test]
    fn test_implementation_for_undeclared_service_is_rejected() {
        let stray = Service::builder("Stray").build().unwrap();
        let implementation = ServiceImplementation::builder(&stray).build().unwrap();

        assert!(matches!(
            RpcServer::new(schema(), vec![implementation]),
            Err(RpcError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_server_starts_on_auto_port() {
        let empty = ApiSchema::builder().build().unwrap();
        let mut handle = RpcServer::new(empty, Vec::new())
            .unwrap()
            .start(&ServerConfig::default())
            .await
            .unwrap();

        assert!(handle.port > 0);
        assert_eq!(handle.base_url(), format!("http://127.0.0.1:{}", handle.port));
        handle.shutdown();
        handle.join().await;
    }
}
