//! Todo service over an in-memory store.
//!
//! Every change is published on [`TODO_TOPIC`] of the shared
//! [`EventRegistry`]; `WatchTodos` streams subscribe there.

use crate::api::{
    CollaborateTodo, CollaborationAction, CollaborationResult, CreateTodo, DeleteTodo, Deleted,
    GetTodoById, GetTodos, NewTodo, Todo, TodoAction, TodoEvent, TodoEventKind, TodoId, TodoList,
    TodoPage, TodoPatch, UpdateTodo, WatchRequest, WatchTodos, MAX_TITLE_LEN,
};
use chrono::{SecondsFormat, Utc};
use quadrant_core::{
    DuplexConnection, EventRegistry, PushConnection, RequestContext, Result, RpcError, Service,
    ServiceImplementation,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Fan-out topic carrying every [`TodoEvent`].
pub const TODO_TOPIC: &str = "todos";

/// Page size of `GetTodos` when the caller gives none.
pub const DEFAULT_PAGE_SIZE: u64 = 100;

fn not_found(id: &str) -> RpcError {
    RpcError::Procedure(format!("Todo with ID {} not found", id))
}

/// In-memory todo storage, kept in creation order.
pub struct TodoStore {
    todos: RwLock<Vec<Todo>>,
    events: Arc<EventRegistry<TodoEvent>>,
}

impl TodoStore {
    pub fn new(events: Arc<EventRegistry<TodoEvent>>) -> Self {
        Self {
            todos: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventRegistry<TodoEvent>> {
        &self.events
    }

    pub async fn list(&self, page: &TodoPage) -> TodoList {
        let todos = self.todos.read().await;
        let offset = usize::try_from(page.offset.unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = usize::try_from(page.limit.unwrap_or(DEFAULT_PAGE_SIZE)).unwrap_or(usize::MAX);

        TodoList {
            todos: todos.iter().skip(offset).take(limit).cloned().collect(),
            total: todos.len() as u64,
        }
    }

    pub async fn get(&self, id: &str) -> Result<Todo> {
        let todos = self.todos.read().await;
        todos
            .iter()
            .find(|todo| todo.id == id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    pub async fn create(&self, title: String) -> Todo {
        let todo = Todo {
            id: uuid::Uuid::new_v4().to_string(),
            title,
            completed: false,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        self.todos.write().await.push(todo.clone());

        debug!("Created todo {}", todo.id);
        self.publish(TodoEventKind::Created, &todo);
        todo
    }

    pub async fn update(&self, patch: TodoPatch) -> Result<Todo> {
        let updated = {
            let mut todos = self.todos.write().await;
            let todo = todos
                .iter_mut()
                .find(|todo| todo.id == patch.id)
                .ok_or_else(|| not_found(&patch.id))?;
            if let Some(title) = patch.title {
                todo.title = title;
            }
            if let Some(completed) = patch.completed {
                todo.completed = completed;
            }
            todo.clone()
        };

        self.publish(TodoEventKind::Updated, &updated);
        Ok(updated)
    }

    /// Remove a todo, returning it.
    pub async fn delete(&self, id: &str) -> Result<Todo> {
        let removed = {
            let mut todos = self.todos.write().await;
            let index = todos
                .iter()
                .position(|todo| todo.id == id)
                .ok_or_else(|| not_found(id))?;
            todos.remove(index)
        };

        debug!("Deleted todo {}", removed.id);
        self.publish(TodoEventKind::Deleted, &removed);
        Ok(removed)
    }

    /// Apply a collaboration action. Failures are reported in the result,
    /// never as an error, so the session stays usable.
    pub async fn collaborate(&self, input: CollaborationAction) -> CollaborationResult {
        let todo = match self.get(&input.todo_id).await {
            Ok(todo) => todo,
            Err(e) => {
                return CollaborationResult {
                    success: false,
                    message: e.to_string(),
                    updated_todo: None,
                }
            }
        };

        let outcome = match input.action {
            TodoAction::Edit => match edited_title(input.data.as_ref()) {
                Some(title) if title.chars().count() > MAX_TITLE_LEN => Err(RpcError::Procedure(
                    format!("Title must be at most {} characters", MAX_TITLE_LEN),
                )),
                Some(title) => {
                    self.update(TodoPatch {
                        id: todo.id.clone(),
                        title: Some(title.to_string()),
                        completed: None,
                    })
                    .await
                }
                None => Ok(todo),
            },
            TodoAction::Complete => {
                self.update(TodoPatch {
                    id: todo.id.clone(),
                    title: None,
                    completed: Some(true),
                })
                .await
            }
            TodoAction::Delete => self.delete(&todo.id).await,
        };

        match outcome {
            Ok(updated) => CollaborationResult {
                success: true,
                message: format!("Todo {} successful", input.action.as_str()),
                updated_todo: Some(updated),
            },
            Err(e) => CollaborationResult {
                success: false,
                message: format!("Error: {}", e),
                updated_todo: None,
            },
        }
    }

    fn publish(&self, event: TodoEventKind, todo: &Todo) {
        let delivered = self.events.publish(
            TODO_TOPIC,
            &TodoEvent {
                event,
                todo: Some(todo.clone()),
            },
        );
        debug!("Todo {:?} event delivered to {} watchers", event, delivered);
    }
}

/// A non-empty `title` string inside the action's free-form data.
fn edited_title(data: Option<&Value>) -> Option<&str> {
    data?
        .get("title")
        .and_then(Value::as_str)
        .filter(|title| !title.is_empty())
}

pub fn implementation(service: &Service, store: Arc<TodoStore>) -> Result<ServiceImplementation> {
    let list = Arc::clone(&store);
    let get = Arc::clone(&store);
    let create = Arc::clone(&store);
    let update = Arc::clone(&store);
    let delete = Arc::clone(&store);
    let watch = Arc::clone(&store);

    ServiceImplementation::builder(service)
        .query::<GetTodos, _, _>(move |page: TodoPage| {
            let store = Arc::clone(&list);
            async move { Ok(store.list(&page).await) }
        })
        .query::<GetTodoById, _, _>(move |input: TodoId| {
            let store = Arc::clone(&get);
            async move { store.get(&input.id).await }
        })
        .mutation::<CreateTodo, _, _>(move |input: NewTodo| {
            let store = Arc::clone(&create);
            async move { Ok(store.create(input.title).await) }
        })
        .mutation::<UpdateTodo, _, _>(move |patch: TodoPatch| {
            let store = Arc::clone(&update);
            async move { store.update(patch).await }
        })
        .mutation::<DeleteTodo, _, _>(move |input: TodoId| {
            let store = Arc::clone(&delete);
            async move {
                store.delete(&input.id).await?;
                Ok(Deleted { success: true })
            }
        })
        .subscription::<WatchTodos, _, _>(move |input: WatchRequest, conn: PushConnection<TodoEvent>| {
            watch_todos(Arc::clone(&watch), input, conn)
        })
        .bidirectional::<CollaborateTodo, _, _>(
            move |_context: RequestContext,
                  conn: DuplexConnection<CollaborationResult, CollaborationAction>| {
                collaborate(Arc::clone(&store), conn)
            },
        )
        .build()
}

async fn watch_todos(
    store: Arc<TodoStore>,
    input: WatchRequest,
    conn: PushConnection<TodoEvent>,
) -> Result<()> {
    let filter = input.filter.unwrap_or_default();
    let writer = conn.clone();
    let key = store.events().subscribe_filtered(
        TODO_TOPIC,
        move |event: &TodoEvent| filter.accepts(event),
        move |event: &TodoEvent| {
            if let Err(e) = writer.write(event) {
                debug!("Dropped todo event for closed watcher: {}", e);
            }
        },
    );
    debug!("Todo watcher registered with filter {:?}", filter);

    let events = Arc::clone(store.events());
    conn.on_close(move || {
        events.unsubscribe(&key);
        debug!("Todo watcher released");
    });
    Ok(())
}

async fn collaborate(
    store: Arc<TodoStore>,
    conn: DuplexConnection<CollaborationResult, CollaborationAction>,
) -> Result<()> {
    info!("Client connected for collaboration");
    conn.on_close(|| info!("Collaboration session ended"));
    conn.on_message(
        "TodoCollaboration",
        move |conn, action: CollaborationAction| {
            let store = Arc::clone(&store);
            async move {
                debug!("Received collaboration action: {:?}", action.action);
                let result = store.collaborate(action).await;
                conn.send(&result)
            }
        },
    );
    Ok(())
}
