use beach_surf_core::{
    async_trait, Assigns, InitializationError, Outcome, Rendered, Session, Socket, View,
    ViewError, ViewRegistry,
};
use serde_json::{json, Value};

use crate::layout::escape;

/// Views served by this binary.
pub fn registry() -> ViewRegistry {
    ViewRegistry::new().register("counter", CounterView)
}

/// Click counter. Session keys: `id`, `count` (starting value), `label`.
pub struct CounterView;

fn step(params: &Value) -> i64 {
    match params.get("step") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(1),
        Some(Value::String(s)) => s.parse().unwrap_or(1),
        _ => 1,
    }
}

#[async_trait]
impl View for CounterView {
    async fn initialize(
        &self,
        session: &Session,
        socket: Socket,
    ) -> Result<Socket, InitializationError> {
        let connected = socket.is_connected();
        let label = session.get_str("label").unwrap_or("Counter").to_string();
        Ok(socket
            .assign("id", session.get("id").cloned().unwrap_or(Value::Null))
            .assign("label", label)
            .assign("count", session.get_i64("count").unwrap_or(0))
            .assign("connected", connected))
    }

    fn render(&self, assigns: &Assigns) -> Rendered {
        let label = assigns.get_as::<String>("label").unwrap_or_default();
        let count = assigns.get_as::<i64>("count").unwrap_or_default();
        let status = if assigns.get_as::<bool>("connected").unwrap_or_default() {
            "live"
        } else {
            "static"
        };
        let id = match assigns.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        Rendered::new(format!(
            "<section class=\"counter\" data-id=\"{id}\" data-status=\"{status}\">\
             <h1>{label}</h1>\
             <p>count: <output>{count}</output></p>\
             <button id=\"dec\" data-surf-event=\"dec\">-</button>\
             <button id=\"inc\" data-surf-event=\"inc\">+</button>\
             <button id=\"reset\" data-surf-event=\"reset\">reset</button>\
             <button id=\"finish\" data-surf-event=\"finish\">finish</button>\
             </section>",
            id = escape(&id),
            label = escape(&label),
        ))
    }

    async fn handle_event(
        &self,
        event: &str,
        _origin: Option<&str>,
        params: Value,
        socket: Socket,
    ) -> Result<Outcome, ViewError> {
        match event {
            "inc" => {
                let step = step(&params);
                let socket = socket.update("count", |count| {
                    json!(count.as_i64().unwrap_or(0).saturating_add(step))
                })?;
                Ok(Outcome::Continue(socket))
            }
            "dec" => {
                let step = step(&params);
                let socket = socket.update("count", |count| {
                    json!(count.as_i64().unwrap_or(0).saturating_sub(step))
                })?;
                Ok(Outcome::Continue(socket))
            }
            "reset" => Ok(Outcome::Continue(socket.assign("count", 0))),
            "finish" => {
                let count = socket.assigns().get_as::<i64>("count").unwrap_or_default();
                Ok(socket
                    .put_flash("info", format!("Finished at {count}"))
                    .redirect("/live/counter"))
            }
            other => Err(ViewError::UnhandledEvent(other.to_string())),
        }
    }
}
