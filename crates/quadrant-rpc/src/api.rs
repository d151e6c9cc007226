//! API declaration for the example application.
//!
//! Two services are exposed:
//! - `Greeting`: one procedure of every method kind, with trivial payloads
//! - `Todo`: CRUD over an in-memory store, a filtered change feed and a
//!   live collaboration channel

use quadrant_core::{ApiSchema, ObjectShape, Result, Service, Shape};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const GREETING_SERVICE: &str = "Greeting";
pub const TODO_SERVICE: &str = "Todo";

/// Maximum length of a todo title, in characters.
pub const MAX_TITLE_LEN: usize = 200;

// ========================================
// Greeting payloads
// ========================================

/// Names keyed by language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloReply {
    pub greeting: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRequest {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReceipt {
    pub status: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoMessage {
    pub msg: String,
}

fn echo_shape() -> ObjectShape {
    Shape::object().field("msg", Shape::string())
}

quadrant_core::procedure! {
    pub struct SayHello: Query in "Greeting" as "SayHello" {
        description: "Says hello and the name.",
        input: HelloRequest = Shape::object().field("name", Shape::record(Shape::string())),
        output: HelloReply = Shape::object().field("greeting", Shape::record(Shape::string())),
    }
}

quadrant_core::procedure! {
    pub struct SendMessage: Mutation in "Greeting" as "SendMessage" {
        description: "Delivers a message to the server.",
        input: MessageRequest = Shape::object().field("message", Shape::string()),
        output: MessageReceipt = Shape::object().field("status", Shape::bool()),
    }
}

quadrant_core::procedure! {
    pub struct StreamedName: Subscription in "Greeting" as "StreamedName" {
        description: "Streams the given name, letter by letter.",
        input: NameRequest = Shape::object().field("name", Shape::string()),
        output: String = Shape::string(),
    }
}

quadrant_core::procedure! {
    pub struct Echo: Bidirectional in "Greeting" as "echo" {
        description: "Echoes back the given message, then hangs up.",
        input: EchoMessage = echo_shape(),
        output: EchoMessage = echo_shape(),
    }
}

// ========================================
// Todo payloads
// ========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub id: String,
    pub title: String,
    pub completed: bool,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TodoPage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoList {
    pub todos: Vec<Todo>,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoId {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTodo {
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TodoPatch {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deleted {
    pub success: bool,
}

/// Which todos a change feed forwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoFilter {
    #[default]
    All,
    Completed,
    Pending,
}

impl TodoFilter {
    pub fn accepts(&self, event: &TodoEvent) -> bool {
        match (self, &event.todo) {
            (TodoFilter::All, _) | (_, None) => true,
            (TodoFilter::Completed, Some(todo)) => todo.completed,
            (TodoFilter::Pending, Some(todo)) => !todo.completed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<TodoFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoEventKind {
    Created,
    Updated,
    Deleted,
}

/// A change to the todo store, as published to watchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoEvent {
    pub event: TodoEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todo: Option<Todo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoAction {
    Edit,
    Complete,
    Delete,
}

impl TodoAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TodoAction::Edit => "edit",
            TodoAction::Complete => "complete",
            TodoAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationAction {
    pub action: TodoAction,
    pub todo_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_todo: Option<Todo>,
}

fn todo_shape() -> ObjectShape {
    Shape::object()
        .field("id", Shape::string())
        .field("title", Shape::string())
        .field("completed", Shape::bool())
        .field("createdAt", Shape::string())
}

fn title_shape() -> Shape {
    Shape::string().min_len(1).max_len(MAX_TITLE_LEN)
}

fn id_shape() -> ObjectShape {
    Shape::object().field("id", Shape::string())
}

quadrant_core::procedure! {
    pub struct GetTodos: Query in "Todo" as "GetTodos" {
        description: "Retrieves all todos from the store",
        input: TodoPage = Shape::object()
            .optional("limit", Shape::integer().min(0.0))
            .optional("offset", Shape::integer().min(0.0)),
        output: TodoList = Shape::object()
            .field("todos", Shape::array(todo_shape()))
            .field("total", Shape::integer().min(0.0)),
    }
}

quadrant_core::procedure! {
    pub struct GetTodoById: Query in "Todo" as "GetTodoById" {
        description: "Retrieves a single todo by its ID",
        input: TodoId = id_shape(),
        output: Todo = todo_shape(),
    }
}

quadrant_core::procedure! {
    pub struct CreateTodo: Mutation in "Todo" as "CreateTodo" {
        description: "Creates a new todo item",
        input: NewTodo = Shape::object().field("title", title_shape()),
        output: Todo = todo_shape(),
    }
}

quadrant_core::procedure! {
    pub struct UpdateTodo: Mutation in "Todo" as "UpdateTodo" {
        description: "Updates an existing todo item",
        input: TodoPatch = Shape::object()
            .field("id", Shape::string())
            .optional("title", title_shape())
            .optional("completed", Shape::bool()),
        output: Todo = todo_shape(),
    }
}

quadrant_core::procedure! {
    pub struct DeleteTodo: Mutation in "Todo" as "DeleteTodo" {
        description: "Deletes a todo item by ID",
        input: TodoId = id_shape(),
        output: Deleted = Shape::object().field("success", Shape::bool()),
    }
}

quadrant_core::procedure! {
    pub struct WatchTodos: Subscription in "Todo" as "WatchTodos" {
        description: "Streams real-time updates when todos are created, updated, or deleted",
        input: WatchRequest = Shape::object()
            .optional("filter", Shape::enumeration(["all", "completed", "pending"])),
        output: TodoEvent = Shape::object()
            .field("event", Shape::enumeration(["created", "updated", "deleted"]))
            .optional("todo", todo_shape()),
    }
}

quadrant_core::procedure! {
    pub struct CollaborateTodo: Bidirectional in "Todo" as "CollaborateTodo" {
        description: "Real-time todo collaboration: send actions, receive their outcome",
        input: CollaborationAction = Shape::object()
            .field("action", Shape::enumeration(["edit", "complete", "delete"]))
            .field("todoId", Shape::string())
            .optional("data", Shape::any()),
        output: CollaborationResult = Shape::object()
            .field("success", Shape::bool())
            .field("message", Shape::string())
            .optional("updatedTodo", todo_shape()),
    }
}

// ========================================
// Schema
// ========================================

pub fn greeting_service() -> Result<Service> {
    Service::builder(GREETING_SERVICE)
        .rpc::<SayHello>()
        .rpc::<SendMessage>()
        .rpc::<StreamedName>()
        .rpc::<Echo>()
        .build()
}

pub fn todo_service() -> Result<Service> {
    Service::builder(TODO_SERVICE)
        .rpc::<GetTodos>()
        .rpc::<GetTodoById>()
        .rpc::<CreateTodo>()
        .rpc::<UpdateTodo>()
        .rpc::<DeleteTodo>()
        .rpc::<WatchTodos>()
        .rpc::<CollaborateTodo>()
        .build()
}

/// The full application schema.
pub fn api_schema() -> Result<ApiSchema> {
    ApiSchema::builder()
        .service(greeting_service()?)
        .service(todo_service()?)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadrant_core::{validate, MethodKind, Rpc};
    use serde_json::json;

    #[test]
    fn test_schema_declares_every_procedure() {
        let schema = api_schema().unwrap();

        let greeting = schema.service("Greeting").unwrap();
        assert_eq!(greeting.procedures().len(), 4);
        assert_eq!(
            greeting.procedure("echo").unwrap().kind(),
            MethodKind::Bidirectional
        );

        let todo = schema.service("Todo").unwrap();
        assert_eq!(todo.procedures().len(), 7);
        assert_eq!(
            todo.procedure("WatchTodos").unwrap().kind(),
            MethodKind::Subscription
        );
        assert!(schema.lookup("Todo", "GetTodos").is_ok());
    }

    #[test]
    fn test_title_bounds() {
        let shape = CreateTodo::input_shape();

        assert!(validate(&shape, &json!({"title": ""})).is_err());
        assert!(validate(&shape, &json!({"title": "Buy milk"})).is_ok());
        let too_long = "x".repeat(MAX_TITLE_LEN + 1);
        assert!(validate(&shape, &json!({ "title": too_long })).is_err());
    }

    #[test]
    fn test_event_serialization_omits_missing_todo() {
        let event = TodoEvent {
            event: TodoEventKind::Deleted,
            todo: None,
        };
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value, json!({"event": "deleted"}));
        assert!(validate(&WatchTodos::output_shape(), &value).is_ok());
    }

    #[test]
    fn test_filter_accepts() {
        let todo = |completed| TodoEvent {
            event: TodoEventKind::Updated,
            todo: Some(Todo {
                id: "1".into(),
                title: "t".into(),
                completed,
                created_at: "2026-01-01T00:00:00Z".into(),
            }),
        };

        assert!(TodoFilter::All.accepts(&todo(true)));
        assert!(TodoFilter::Completed.accepts(&todo(true)));
        assert!(!TodoFilter::Completed.accepts(&todo(false)));
        assert!(TodoFilter::Pending.accepts(&todo(false)));
        assert!(!TodoFilter::Pending.accepts(&todo(true)));
    }
}
