//! Dispatch adapter: maps an inbound [`Request`] to exactly one [`Response`].
//!
//! Nothing a handler does can escape this boundary. Unknown commands, handler
//! errors and handler panics all become ordinary `ok: false` responses tagged
//! with the request id, so the connection's read loop never dies because of a
//! command.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;

use crate::bridge::protocol::{Artifacts, Request, RequestId, Response};

/// Successful result of a command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub changed: bool,
    pub data: Option<serde_json::Value>,
    pub artifacts: Option<Artifacts>,
    pub warnings: Vec<String>,
}

impl CommandOutput {
    /// Read-only result.
    pub fn unchanged(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// Result of a command that mutated the document.
    pub fn changed(data: serde_json::Value) -> Self {
        Self {
            changed: true,
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn with_artifacts(mut self, artifacts: Artifacts) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    fn into_response(self, id: RequestId) -> Response {
        let mut response = Response::success(id, self.changed, self.data).with_warnings(self.warnings);
        if let Some(artifacts) = self.artifacts {
            response = response.with_artifacts(artifacts);
        }
        response
    }
}

/// A command failed.
///
/// `changed` is set when the command got partway before failing and the
/// document was modified anyway.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub changed: bool,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            changed: false,
        }
    }

    /// Failure after the document was already modified.
    pub fn partial(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            changed: true,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(format!("invalid params: {e}"))
    }
}

/// One command implementation.
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn call(&self, params: serde_json::Value) -> Result<CommandOutput, HandlerError>;
}

/// Adapts an async closure into a [`CommandHandler`].
pub struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CommandOutput, HandlerError>> + Send + 'static,
{
    async fn call(&self, params: serde_json::Value) -> Result<CommandOutput, HandlerError> {
        (self.0)(params).await
    }
}

/// Static command name -> handler table.
#[derive(Clone, Default)]
pub struct CommandTable {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `command`, replacing any earlier registration.
    pub fn register(
        &mut self,
        command: impl Into<String>,
        handler: impl CommandHandler,
    ) -> &mut Self {
        let command = command.into();
        if self
            .handlers
            .insert(command.clone(), Arc::new(handler))
            .is_some()
        {
            tracing::warn!(%command, "Replacing existing command handler");
        }
        self
    }

    pub fn register_fn<F, Fut>(&mut self, command: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CommandOutput, HandlerError>> + Send + 'static,
    {
        self.register(command, FnHandler(f))
    }

    pub fn get(&self, command: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(command).cloned()
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Shared, cloneable front of a [`CommandTable`].
#[derive(Clone)]
pub struct Dispatcher {
    table: Arc<CommandTable>,
}

impl Dispatcher {
    pub fn new(table: CommandTable) -> Self {
        Self {
            table: Arc::new(table),
        }
    }

    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    /// Run `request` against the table. Always returns a response for `request.id`.
    pub async fn dispatch(&self, request: Request) -> Response {
        let Request {
            id,
            command,
            params,
        } = request;

        let Some(handler) = self.table.get(&command) else {
            tracing::warn!(request_id = %id, %command, "Unknown command");
            return Response::failure(id, false, format!("Unknown command: {command}"));
        };

        tracing::debug!(request_id = %id, %command, "Dispatching command");
        let started = Instant::now();
        let outcome = AssertUnwindSafe(handler.call(params)).catch_unwind().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(output)) => {
                tracing::debug!(request_id = %id, %command, elapsed_ms, changed = output.changed, "Command succeeded");
                output.into_response(id)
            }
            Ok(Err(err)) => {
                tracing::warn!(request_id = %id, %command, elapsed_ms, error = %err, "Command failed");
                Response::failure(id, err.changed, err.message)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(request_id = %id, %command, error = %message, "Command handler panicked");
                Response::failure(id, false, format!("Command '{command}' panicked: {message}"))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
