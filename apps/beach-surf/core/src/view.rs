use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::{
    render::Rendered,
    session::Session,
    socket::{Assigns, Flash, KeyNotFound, Socket},
};

/// Why an instance stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// The view asked to stop without navigating anywhere.
    Normal,
    /// The view asked the client to navigate away.
    Redirect { to: String, flash: Flash },
    /// Stop requested from outside the instance.
    Shutdown,
    /// The transport went away.
    Closed,
    /// A handler or render failed.
    Fault { message: String },
}

impl StopReason {
    pub fn fault(message: impl Into<String>) -> Self {
        StopReason::Fault {
            message: message.into(),
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            StopReason::Normal => "normal",
            StopReason::Redirect { .. } => "redirect",
            StopReason::Shutdown => "shutdown",
            StopReason::Closed => "closed",
            StopReason::Fault { .. } => "fault",
        }
    }
}

/// Result of handling one inbound message.
#[derive(Debug)]
pub enum Outcome {
    Continue(Socket),
    Stop(StopReason, Socket),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("view failed to initialize: {reason}")]
pub struct InitializationError {
    pub reason: String,
}

impl InitializationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<KeyNotFound> for InitializationError {
    fn from(err: KeyNotFound) -> Self {
        Self::new(err.to_string())
    }
}

/// Failure raised by `handle_event` or `handle_info`. Any of these ends the
/// instance as a fault.
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("no handler for event `{0}`")]
    UnhandledEvent(String),
    #[error(transparent)]
    KeyNotFound(#[from] KeyNotFound),
    #[error("invalid event params: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Failed(String),
}

/// A live view.
///
/// Views hold no per-client state themselves; everything a client sees lives
/// in the socket, and one `View` value serves every instance of that view.
#[async_trait]
pub trait View: Send + Sync + 'static {
    /// Runs for the disconnected render and again for every connected mount,
    /// each time with a fresh socket and the same session.
    async fn initialize(
        &self,
        _session: &Session,
        socket: Socket,
    ) -> Result<Socket, InitializationError> {
        Ok(socket)
    }

    /// Must be a pure function of `assigns`.
    fn render(&self, assigns: &Assigns) -> Rendered;

    /// Views that receive client events must override this; the default
    /// treats any event as a fault.
    async fn handle_event(
        &self,
        event: &str,
        _origin: Option<&str>,
        _params: Value,
        _socket: Socket,
    ) -> Result<Outcome, ViewError> {
        Err(ViewError::UnhandledEvent(event.to_string()))
    }

    /// Out-of-band messages sent to the instance from the server side.
    async fn handle_info(&self, message: Value, socket: Socket) -> Result<Outcome, ViewError> {
        debug!(?message, "ignoring info message");
        Ok(Outcome::Continue(socket))
    }

    /// Best effort; the return is ignored and a failure here does not change
    /// the stop reason.
    async fn terminate(&self, _reason: &StopReason, _socket: &Socket) {}
}

/// Maps view names to implementations. Built once at startup.
#[derive(Clone, Default)]
pub struct ViewRegistry {
    views: BTreeMap<String, Arc<dyn View>>,
}

impl fmt::Debug for ViewRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.views.keys()).finish()
    }
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, view: impl View) -> Self {
        self.views.insert(name.into(), Arc::new(view));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn View>> {
        self.views.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.views.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.views.keys().map(String::as_str)
    }
}
