//! Quadrant example application.
//!
//! Declares the Greeting and Todo services on top of `quadrant-core`,
//! implements them and serves them over HTTP. The `quadrant-rpc` binary is a
//! thin CLI around [`server::start_server`].

pub mod api;
pub mod server;
pub mod services;
pub mod webhook;

pub use server::{start_server, App};
pub use services::{TodoStore, DEFAULT_STREAM_DELAY, TODO_TOPIC};
