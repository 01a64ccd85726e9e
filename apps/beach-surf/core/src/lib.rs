//! Core of the Beach Surf live view runtime.
//!
//! A view is first rendered on a plain request together with a signed copy
//! of its session. When the browser upgrades, the token is verified, the view
//! is initialized again from the same session, and a dedicated task keeps the
//! view's state while it handles events and pushes renders.

pub mod handshake;
pub mod instance;
pub mod render;
pub mod session;
pub mod socket;
pub mod token;
pub mod view;

pub use handshake::{Document, HandshakeError, LiveEndpoint, Phase, VerifiedSession};
pub use instance::{InstanceHandle, InstanceStatus, Outbound, PushError};
pub use render::{render, RenderFault, Rendered};
pub use session::Session;
pub use socket::{Assigns, ConnectionState, Flash, KeyNotFound, Socket};
pub use token::{Keyring, KeyringError, SignError, VerificationError};
pub use view::{InitializationError, Outcome, StopReason, View, ViewError, ViewRegistry};

pub use async_trait::async_trait;
