//! Quadrant Core - typed multi-mode RPC transport.
//!
//! Procedures are declared once with a method kind and input/output shapes,
//! then exchanged in one of four modes:
//!
//! - QUERY: idempotent read, one request and one response
//! - MUTATION: state-changing write, one request and one response
//! - SUBSCRIPTION: server-push stream of events
//! - BIDIRECTIONAL: full-duplex message exchange
//!
//! Payloads are validated against their shapes on both sides of the wire.
//! Server-side implementations broadcast state changes to live streams
//! through an [`EventRegistry`].
//!
//! # Example
//!
//! ```rust,ignore
//! use quadrant_core::{
//!     ApiSchema, ClientConfig, RpcClient, RpcServer, ServerConfig, Service, ServiceImplementation,
//! };
//!
//! #[tokio::main]
//! async fn main() -> quadrant_core::Result<()> {
//!     let greeting = Service::builder("Greeting").rpc::<SayHello>().build()?;
//!     let schema = ApiSchema::builder().service(greeting.clone()).build()?;
//!
//!     let implementation = ServiceImplementation::builder(&greeting)
//!         .query::<SayHello, _, _>(say_hello)
//!         .build()?;
//!     let handle = RpcServer::new(schema, vec![implementation])?
//!         .start(&ServerConfig::default())
//!         .await?;
//!
//!     let client = RpcClient::new(ClientConfig::new(&handle.base_url())?)?;
//!     let reply = client.query::<SayHello>(&input).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod schema;
pub mod server;
pub mod shape;
pub mod typed;
pub mod validate;
pub mod wire;

// Re-export commonly used types
pub use client::{RpcClient, StreamEvent, Subscription};
pub use config::{ClientConfig, ServerConfig};
pub use connection::{ConnectionState, DuplexConnection, PushConnection};
pub use error::{Result, RpcError};
pub use fanout::{EventRegistry, SubscriptionKey};
pub use schema::{ApiSchema, MethodKind, Procedure, Service};
pub use server::{
    RequestContext, RpcServer, ServerHandle, ServiceImplementation, WebhookHandler,
};
pub use shape::{ObjectShape, Shape};
pub use typed::{DuplexRpc, MutationRpc, QueryRpc, Rpc, SubscriptionRpc};
pub use validate::{validate, ValidationFailure, ValidationResult, Violation};

// Implementing `WebhookHandler` requires the attribute macro
pub use async_trait::async_trait;
