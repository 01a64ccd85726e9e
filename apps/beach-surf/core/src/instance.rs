//! Connected view instances.
//!
//! Each instance is one Tokio task that owns its socket. Events and info
//! messages arrive through a bounded mailbox and are handled strictly one at
//! a time; renders go out through the transport sender in the order the
//! state changes happened. A stop request is checked before every mailbox
//! read but never interrupts a handler that is already running.

use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    handshake::Phase,
    render::{panic_message, render, Rendered},
    socket::{Flash, Socket},
    view::{Outcome, StopReason, View},
};

/// Messages an instance hands to its transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Render {
        instance_id: Uuid,
        rev: u64,
        rendered: Rendered,
    },
    Redirect {
        instance_id: Uuid,
        to: String,
        flash: Flash,
    },
    Disconnect {
        instance_id: Uuid,
        reason: StopReason,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceStatus {
    Running,
    Terminated(StopReason),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("view instance {0} has terminated")]
    Terminated(Uuid),
}

#[derive(Debug)]
enum Command {
    Event {
        event: String,
        origin: Option<String>,
        params: Value,
    },
    Info(Value),
}

/// Cloneable reference to a running instance.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    id: Uuid,
    view: Arc<str>,
    commands: mpsc::Sender<Command>,
    stop: Arc<watch::Sender<bool>>,
    status: watch::Receiver<InstanceStatus>,
}

impl InstanceHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn view_name(&self) -> &str {
        &self.view
    }

    /// Queues a client event behind any already waiting.
    pub async fn push_event(
        &self,
        event: impl Into<String>,
        origin: Option<String>,
        params: Value,
    ) -> Result<(), PushError> {
        self.send(Command::Event {
            event: event.into(),
            origin,
            params,
        })
        .await
    }

    pub async fn send_info(&self, message: Value) -> Result<(), PushError> {
        self.send(Command::Info(message)).await
    }

    /// Asks the instance to stop. Events still queued are dropped; a handler
    /// already running finishes first.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn status(&self) -> InstanceStatus {
        self.status.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        match *self.status.borrow() {
            InstanceStatus::Running => Phase::Connected,
            InstanceStatus::Terminated(_) => Phase::Terminated,
        }
    }

    /// Resolves once the instance has run `terminate` and sent its last
    /// message.
    pub async fn terminated(&self) -> StopReason {
        let mut status = self.status.clone();
        loop {
            if let InstanceStatus::Terminated(reason) = &*status.borrow_and_update() {
                return reason.clone();
            }
            if status.changed().await.is_err() {
                return match &*status.borrow() {
                    InstanceStatus::Terminated(reason) => reason.clone(),
                    InstanceStatus::Running => {
                        StopReason::fault("view instance task ended unexpectedly")
                    }
                };
            }
        }
    }

    async fn send(&self, command: Command) -> Result<(), PushError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PushError::Terminated(self.id))
    }
}

pub(crate) fn spawn(
    view_name: String,
    view: Arc<dyn View>,
    socket: Socket,
    outbound: mpsc::Sender<Outbound>,
    mailbox_depth: usize,
) -> InstanceHandle {
    let id = Uuid::new_v4();
    let (commands_tx, commands_rx) = mpsc::channel(mailbox_depth.max(1));
    let (stop_tx, stop_rx) = watch::channel(false);
    let (status_tx, status_rx) = watch::channel(InstanceStatus::Running);

    let span = info_span!("view_instance", instance_id = %id, view = %view_name);
    let instance = ViewInstance {
        id,
        view,
        socket,
        rev: 0,
        outbound,
    };
    tokio::spawn(
        instance
            .run(commands_rx, stop_rx, status_tx)
            .instrument(span),
    );

    InstanceHandle {
        id,
        view: Arc::from(view_name),
        commands: commands_tx,
        stop: Arc::new(stop_tx),
        status: status_rx,
    }
}

struct ViewInstance {
    id: Uuid,
    view: Arc<dyn View>,
    socket: Socket,
    rev: u64,
    outbound: mpsc::Sender<Outbound>,
}

impl ViewInstance {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut stop: watch::Receiver<bool>,
        status: watch::Sender<InstanceStatus>,
    ) {
        debug!("view instance started");
        let reason = match self.push_render().await {
            Ok(()) => self.event_loop(&mut commands, &mut stop).await,
            Err(reason) => reason,
        };
        commands.close();
        self.shutdown(&reason).await;
        status.send_replace(InstanceStatus::Terminated(reason));
    }

    async fn event_loop(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
        stop: &mut watch::Receiver<bool>,
    ) -> StopReason {
        let mut watching_stop = true;
        loop {
            let command = tokio::select! {
                biased;
                changed = stop.changed(), if watching_stop => {
                    match changed {
                        Ok(()) => {
                            if *stop.borrow_and_update() {
                                return StopReason::Shutdown;
                            }
                            continue;
                        }
                        // Every handle is gone; drain what they already queued.
                        Err(_) => {
                            watching_stop = false;
                            continue;
                        }
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => return StopReason::Closed,
                },
            };

            if let Some(reason) = self.dispatch(command).await {
                return reason;
            }
        }
    }

    async fn dispatch(&mut self, command: Command) -> Option<StopReason> {
        let view = Arc::clone(&self.view);
        let socket = self.socket.clone();
        let handled = match command {
            Command::Event {
                event,
                origin,
                params,
            } => {
                debug!(event = %event, origin = ?origin, "handling event");
                AssertUnwindSafe(view.handle_event(&event, origin.as_deref(), params, socket))
                    .catch_unwind()
                    .await
            }
            Command::Info(message) => {
                AssertUnwindSafe(view.handle_info(message, socket))
                    .catch_unwind()
                    .await
            }
        };

        match handled {
            Ok(Ok(Outcome::Continue(socket))) => {
                self.socket = socket;
                self.push_render().await.err()
            }
            Ok(Ok(Outcome::Stop(reason, socket))) => {
                self.socket = socket;
                Some(reason)
            }
            Ok(Err(err)) => Some(StopReason::fault(err.to_string())),
            Err(payload) => Some(StopReason::fault(format!(
                "handler panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }

    async fn push_render(&mut self) -> Result<(), StopReason> {
        let rendered = render(self.view.as_ref(), &self.socket)
            .map_err(|fault| StopReason::fault(fault.to_string()))?;
        let message = Outbound::Render {
            instance_id: self.id,
            rev: self.rev,
            rendered,
        };
        self.outbound
            .send(message)
            .await
            .map_err(|_| StopReason::Closed)?;
        self.rev += 1;
        Ok(())
    }

    async fn shutdown(&mut self, reason: &StopReason) {
        let terminated = AssertUnwindSafe(self.view.terminate(reason, &self.socket))
            .catch_unwind()
            .await;
        if let Err(payload) = terminated {
            warn!(
                panic = %panic_message(payload.as_ref()),
                "terminate callback panicked"
            );
        }

        match reason {
            StopReason::Fault { message } => {
                warn!(message = %message, "view instance faulted");
            }
            other => {
                info!(reason = other.metric_label(), "view instance terminated");
            }
        }

        let farewell = match reason {
            StopReason::Closed => None,
            StopReason::Redirect { to, flash } => Some(Outbound::Redirect {
                instance_id: self.id,
                to: to.clone(),
                flash: flash.clone(),
            }),
            other => Some(Outbound::Disconnect {
                instance_id: self.id,
                reason: other.clone(),
            }),
        };
        if let Some(message) = farewell {
            if self.outbound.send(message).await.is_err() {
                debug!("transport closed before final message");
            }
        }
    }
}
