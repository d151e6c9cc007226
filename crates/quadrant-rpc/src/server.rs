//! Server bootstrap: schema, implementations and webhook wired together.

use crate::api::{self, TodoEvent};
use crate::services::{self, TodoStore};
use crate::webhook::LoggingWebhook;
use quadrant_core::{EventRegistry, RpcServer, ServerConfig, ServerHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A running application server.
pub struct App {
    pub handle: ServerHandle,
    /// Shared todo store, exposed for inspection.
    pub todos: Arc<TodoStore>,
}

impl App {
    pub fn addr(&self) -> SocketAddr {
        self.handle.addr()
    }

    /// Close every live connection, drop all fan-out subscribers and wait
    /// for the server task to exit.
    pub async fn shutdown(mut self) {
        self.handle.shutdown();
        self.todos.events().clear();
        self.handle.join().await;
        info!("Server stopped");
    }
}

/// Start the application server.
///
/// Binding to port 0 picks a free port; read it back from [`App::addr`].
pub async fn start_server(config: &ServerConfig, stream_delay: Duration) -> anyhow::Result<App> {
    let schema = api::api_schema()?;
    let events: Arc<EventRegistry<TodoEvent>> = Arc::new(EventRegistry::new());
    let todos = Arc::new(TodoStore::new(events));

    let implementations = services::implementations(Arc::clone(&todos), stream_delay)?;
    let handle = RpcServer::new(schema, implementations)?
        .with_webhook(LoggingWebhook)
        .start(config)
        .await?;

    Ok(App { handle, todos })
}
