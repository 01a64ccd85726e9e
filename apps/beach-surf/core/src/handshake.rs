use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    instance::{self, InstanceHandle, Outbound},
    render::{panic_message, render, RenderFault, Rendered},
    session::{Session, SessionEnvelope},
    socket::Socket,
    token::{Keyring, SignError, VerificationError},
    view::{InitializationError, View, ViewRegistry},
};

pub const DEFAULT_MAILBOX_DEPTH: usize = 64;

/// Where a client view stands in the two-phase lifecycle.
///
/// A dropped transport is not a phase of its own: the client either starts
/// over with a plain request or presents the token it kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Disconnected,
    AwaitingVerification,
    Connected,
    Terminated,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("unknown view `{0}`")]
    UnknownView(String),
    #[error(transparent)]
    Initialization(#[from] InitializationError),
    #[error(transparent)]
    Render(#[from] RenderFault),
    #[error(transparent)]
    Signing(#[from] SignError),
}

impl HandshakeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::Verification(err) => err.metric_label(),
            HandshakeError::UnknownView(_) => "unknown_view",
            HandshakeError::Initialization(_) => "initialization",
            HandshakeError::Render(_) => "render_fault",
            HandshakeError::Signing(_) => "signing",
        }
    }
}

/// Output of the disconnected render. Where the token goes in the document
/// is up to the caller.
#[derive(Debug, Clone)]
pub struct Document {
    pub view: String,
    pub token: String,
    pub rendered: Rendered,
}

/// A token that passed verification and names a registered view.
#[derive(Debug, Clone)]
pub struct VerifiedSession {
    envelope: SessionEnvelope,
}

impl VerifiedSession {
    pub fn view(&self) -> &str {
        &self.envelope.view
    }

    pub fn session(&self) -> &Session {
        &self.envelope.session
    }
}

/// Runs both halves of the handshake for a fixed set of views and keys.
///
/// Holds no per-client state: every disconnected render and every upgrade
/// is independent, and cloning only bumps reference counts.
#[derive(Debug, Clone)]
pub struct LiveEndpoint {
    keyring: Arc<Keyring>,
    views: Arc<ViewRegistry>,
    mailbox_depth: usize,
}

impl LiveEndpoint {
    pub fn new(keyring: Arc<Keyring>, views: Arc<ViewRegistry>) -> Self {
        Self {
            keyring,
            views,
            mailbox_depth: DEFAULT_MAILBOX_DEPTH,
        }
    }

    pub fn with_mailbox_depth(mut self, depth: usize) -> Self {
        self.mailbox_depth = depth.max(1);
        self
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn views(&self) -> &ViewRegistry {
        &self.views
    }

    /// Disconnected → Disconnected: sign the session, initialize a
    /// disconnected socket, render once. No instance is created.
    pub async fn render_disconnected(
        &self,
        view_name: &str,
        session: Session,
    ) -> Result<Document, HandshakeError> {
        let view = self.resolve(view_name)?;
        let envelope = SessionEnvelope {
            view: view_name.to_string(),
            session,
        };
        let token = self.keyring.sign(&envelope)?;

        let socket = initialize(view.as_ref(), &envelope.session, Socket::disconnected())
            .await
            .inspect_err(|err| {
                warn!(view = view_name, reason = %err.reason, "disconnected initialize failed");
            })?;
        let rendered = render(view.as_ref(), &socket)?;

        debug!(view = view_name, phase = ?Phase::Disconnected, "rendered disconnected view");
        Ok(Document {
            view: envelope.view,
            token,
            rendered,
        })
    }

    /// AwaitingVerification: check the token and that its view still exists.
    /// Nothing is initialized here.
    pub fn verify(&self, token: &str) -> Result<VerifiedSession, HandshakeError> {
        let envelope: SessionEnvelope = self.keyring.verify(token).inspect_err(|err| {
            warn!(
                phase = ?Phase::AwaitingVerification,
                reason = err.metric_label(),
                "session token rejected"
            );
        })?;
        if !self.views.contains(&envelope.view) {
            warn!(view = %envelope.view, "session token names an unregistered view");
            return Err(HandshakeError::UnknownView(envelope.view));
        }
        Ok(VerifiedSession { envelope })
    }

    /// AwaitingVerification → Connected: initialize a connected socket from
    /// the verified session and spawn the instance, which pushes its first
    /// render before reading any event.
    pub async fn connect(
        &self,
        verified: VerifiedSession,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<InstanceHandle, HandshakeError> {
        let SessionEnvelope {
            view: view_name,
            session,
        } = verified.envelope;
        let view = self.resolve(&view_name)?;

        let socket = initialize(view.as_ref(), &session, Socket::connected())
            .await
            .inspect_err(|err| {
                warn!(view = %view_name, reason = %err.reason, "connected initialize failed");
            })?;

        let handle = instance::spawn(view_name, view, socket, outbound, self.mailbox_depth);
        info!(
            instance_id = %handle.id(),
            view = handle.view_name(),
            phase = ?Phase::Connected,
            "view instance created"
        );
        Ok(handle)
    }

    pub async fn upgrade(
        &self,
        token: &str,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<InstanceHandle, HandshakeError> {
        let verified = self.verify(token)?;
        self.connect(verified, outbound).await
    }

    fn resolve(&self, view_name: &str) -> Result<Arc<dyn View>, HandshakeError> {
        self.views
            .get(view_name)
            .ok_or_else(|| HandshakeError::UnknownView(view_name.to_string()))
    }
}

async fn initialize(
    view: &dyn View,
    session: &Session,
    socket: Socket,
) -> Result<Socket, InitializationError> {
    AssertUnwindSafe(view.initialize(session, socket))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            Err(InitializationError::new(format!(
                "initialize panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
}
