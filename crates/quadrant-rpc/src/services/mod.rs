//! Implementations of the application services.

pub mod greeting;
pub mod todo;

pub use greeting::DEFAULT_STREAM_DELAY;
pub use todo::{TodoStore, TODO_TOPIC};

use crate::api;
use quadrant_core::{Result, ServiceImplementation};
use std::sync::Arc;
use std::time::Duration;

/// Build the implementation of every service in [`api::api_schema`].
pub fn implementations(
    store: Arc<TodoStore>,
    stream_delay: Duration,
) -> Result<Vec<ServiceImplementation>> {
    Ok(vec![
        greeting::implementation(&api::greeting_service()?, stream_delay)?,
        todo::implementation(&api::todo_service()?, store)?,
    ])
}
