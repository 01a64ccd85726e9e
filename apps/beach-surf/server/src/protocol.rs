//! JSON frames exchanged with the browser over the upgraded socket.

use beach_surf_core::{Flash, Keyring, Outbound, Rendered, SignError, VerificationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

/// Query parameter carrying a signed flash across a redirect.
pub const FLASH_PARAM: &str = "flash";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Event {
        event: String,
        #[serde(default)]
        origin: Option<String>,
        #[serde(default)]
        params: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Render {
        instance_id: Uuid,
        rev: u64,
        rendered: Rendered,
    },
    Redirect {
        to: String,
    },
    Disconnect {
        reason: &'static str,
    },
}

impl ServerFrame {
    pub fn from_outbound(outbound: Outbound, keyring: &Keyring) -> Self {
        match outbound {
            Outbound::Render {
                instance_id,
                rev,
                rendered,
            } => ServerFrame::Render {
                instance_id,
                rev,
                rendered,
            },
            Outbound::Redirect { to, flash, .. } => ServerFrame::Redirect {
                to: redirect_target(&to, &flash, keyring),
            },
            Outbound::Disconnect { reason, .. } => ServerFrame::Disconnect {
                reason: reason.metric_label(),
            },
        }
    }

    /// Whether the instance sends nothing after this frame.
    pub fn is_final(&self) -> bool {
        !matches!(self, ServerFrame::Render { .. })
    }
}

/// Signed form of a redirect flash. The `flash` wrapper keeps these tokens
/// from ever decoding as a session envelope, and the reverse.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FlashEnvelope {
    flash: Flash,
}

pub fn sign_flash(flash: &Flash, keyring: &Keyring) -> Result<String, SignError> {
    keyring.sign(&FlashEnvelope {
        flash: flash.clone(),
    })
}

pub fn verify_flash(token: &str, keyring: &Keyring) -> Result<Flash, VerificationError> {
    keyring
        .verify::<FlashEnvelope>(token)
        .map(|envelope| envelope.flash)
}

/// Appends the signed flash to `to` so the next disconnected render can show
/// it. An empty flash leaves the target untouched.
pub fn redirect_target(to: &str, flash: &Flash, keyring: &Keyring) -> String {
    if flash.is_empty() {
        return to.to_string();
    }
    match sign_flash(flash, keyring) {
        Ok(token) => {
            let separator = if to.contains('?') { '&' } else { '?' };
            format!("{to}{separator}{FLASH_PARAM}={token}")
        }
        Err(err) => {
            warn!(error = %err, "failed to sign redirect flash; dropping it");
            to.to_string()
        }
    }
}
