use std::{
    any::Any,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
};

use serde::Serialize;
use thiserror::Error;

use crate::{socket::Socket, view::View};

/// Opaque output of `View::render`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Rendered(String);

impl Rendered {
    pub fn new(content: impl Into<String>) -> Self {
        Self(content.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for Rendered {
    fn from(content: String) -> Self {
        Self(content)
    }
}

impl fmt::Display for Rendered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("render panicked: {message}")]
pub struct RenderFault {
    pub message: String,
}

/// Renders the socket's current assigns, turning a panic in the view into a
/// `RenderFault`.
pub fn render(view: &dyn View, socket: &Socket) -> Result<Rendered, RenderFault> {
    catch_unwind(AssertUnwindSafe(|| view.render(socket.assigns()))).map_err(|payload| {
        RenderFault {
            message: panic_message(payload.as_ref()),
        }
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
