use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::view::{Outcome, StopReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Current UI state of one view. Only reachable by the client through
/// render output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Assigns(BTreeMap<String, Value>);

impl Assigns {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One-shot notices keyed by kind ("info", "error", ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flash(BTreeMap<String, String>);

impl Flash {
    pub fn get(&self, kind: &str) -> Option<&str> {
        self.0.get(kind).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(kind, message)| (kind.as_str(), message.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Flash {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(kind, message)| (kind.into(), message.into()))
                .collect(),
        )
    }
}

/// `Socket::update` was asked for an assign that was never set.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("no assign named `{key}`")]
pub struct KeyNotFound {
    pub key: String,
}

/// Per-view context: assigns, pending flash, and whether this is the
/// disconnected render or a connected instance.
///
/// Every mutation consumes the socket and returns the next one.
#[derive(Debug, Clone)]
pub struct Socket {
    assigns: Assigns,
    flash: Flash,
    connection: ConnectionState,
}

impl Socket {
    pub fn new(connection: ConnectionState) -> Self {
        Self {
            assigns: Assigns::default(),
            flash: Flash::default(),
            connection,
        }
    }

    pub fn disconnected() -> Self {
        Self::new(ConnectionState::Disconnected)
    }

    pub fn connected() -> Self {
        Self::new(ConnectionState::Connected)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    pub fn assigns(&self) -> &Assigns {
        &self.assigns
    }

    pub fn flash(&self) -> &Flash {
        &self.flash
    }

    pub fn assign(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.assigns.0.insert(key.into(), value.into());
        self
    }

    pub fn assign_all<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        for (key, value) in entries {
            self.assigns.0.insert(key.into(), value.into());
        }
        self
    }

    /// Assigns `key` only when it is not already present. `value` is not
    /// called otherwise.
    pub fn assign_new<V, F>(self, key: impl Into<String>, value: F) -> Self
    where
        F: FnOnce() -> V,
        V: Into<Value>,
    {
        let key = key.into();
        if self.assigns.contains_key(&key) {
            return self;
        }
        self.assign(key, value())
    }

    /// Replaces the value under `key` with `f(current)`. Never inserts.
    pub fn update<F>(mut self, key: &str, f: F) -> Result<Self, KeyNotFound>
    where
        F: FnOnce(Value) -> Value,
    {
        let Some(slot) = self.assigns.0.get_mut(key) else {
            return Err(KeyNotFound {
                key: key.to_string(),
            });
        };
        let current = std::mem::take(slot);
        *slot = f(current);
        Ok(self)
    }

    pub fn put_flash(mut self, kind: impl Into<String>, message: impl Into<String>) -> Self {
        self.flash.0.insert(kind.into(), message.into());
        self
    }

    pub fn clear_flash(mut self) -> Self {
        self.flash.0.clear();
        self
    }

    /// Ends the instance and tells the client to navigate to `to`, carrying
    /// whatever flash is pending.
    pub fn redirect(self, to: impl Into<String>) -> Outcome {
        let reason = StopReason::Redirect {
            to: to.into(),
            flash: self.flash.clone(),
        };
        Outcome::Stop(reason, self)
    }
}
