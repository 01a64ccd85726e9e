use std::sync::{Arc, Mutex};

use beach_surf_core::{
    async_trait, Assigns, HandshakeError, InitializationError, Keyring, LiveEndpoint, Outbound,
    Outcome, Phase, Rendered, Session, Socket, StopReason, VerificationError, View, ViewError,
    ViewRegistry,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

type TerminateLog = Arc<Mutex<Vec<(StopReason, Option<i64>)>>>;

#[derive(Clone, Default)]
struct Counter {
    terminated: TerminateLog,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl View for Counter {
    async fn initialize(
        &self,
        session: &Session,
        socket: Socket,
    ) -> Result<Socket, InitializationError> {
        if session.contains_key("reject") {
            return Err(InitializationError::new("rejected by session"));
        }
        if socket.is_connected() && session.contains_key("reject_connected") {
            return Err(InitializationError::new("rejected on connect"));
        }
        let id = session.get("id").cloned().unwrap_or(Value::Null);
        let count = session.get_i64("count").unwrap_or(0);
        let connected = socket.is_connected();
        Ok(socket
            .assign("id", id)
            .assign("count", count)
            .assign("connected", connected))
    }

    fn render(&self, assigns: &Assigns) -> Rendered {
        let id = assigns.get("id").cloned().unwrap_or(Value::Null);
        let count = assigns.get_as::<i64>("count").unwrap_or_default();
        let connected = assigns.get_as::<bool>("connected").unwrap_or_default();
        let gated = assigns.get_as::<bool>("gated").unwrap_or_default();
        Rendered::new(format!(
            "id={id};count={count};connected={connected};gated={gated}"
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
            "inc" => Ok(Outcome::Continue(socket.update("count", |count| {
                json!(count.as_i64().unwrap_or(0) + 1)
            })?)),
            "set" => {
                let value = params
                    .get("value")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| ViewError::InvalidParams("value".into()))?;
                Ok(Outcome::Continue(socket.assign("count", value)))
            }
            "gate" => {
                self.entered.notify_one();
                self.release.notified().await;
                Ok(Outcome::Continue(socket.assign("gated", true)))
            }
            "finish" => Ok(socket.put_flash("info", "all done").redirect("/done")),
            "halt" => Ok(Outcome::Stop(StopReason::Normal, socket)),
            "missing" => Ok(Outcome::Continue(
                socket.update("nope", |value| value)?,
            )),
            "boom" => Err(ViewError::Failed("boom".into())),
            "panic" => panic!("handler exploded"),
            other => Err(ViewError::UnhandledEvent(other.to_string())),
        }
    }

    async fn handle_info(&self, message: Value, socket: Socket) -> Result<Outcome, ViewError> {
        let add = message.get("add").and_then(Value::as_i64).unwrap_or(0);
        Ok(Outcome::Continue(socket.update("count", |count| {
            json!(count.as_i64().unwrap_or(0) + add)
        })?))
    }

    async fn terminate(&self, reason: &StopReason, socket: &Socket) {
        let count = socket.assigns().get_as::<i64>("count");
        self.terminated.lock().unwrap().push((reason.clone(), count));
    }
}

fn keyring(secret: &str) -> Arc<Keyring> {
    Arc::new(Keyring::single("k1", secret).unwrap())
}

fn endpoint_with(view: Counter, secret: &str) -> LiveEndpoint {
    let views = ViewRegistry::new().register("counter", view);
    LiveEndpoint::new(keyring(secret), Arc::new(views))
}

fn endpoint(view: Counter) -> LiveEndpoint {
    endpoint_with(view, "surf-test-secret")
}

async fn expect_render(rx: &mut mpsc::Receiver<Outbound>) -> (u64, String) {
    match rx.recv().await {
        Some(Outbound::Render { rev, rendered, .. }) => (rev, rendered.into_string()),
        other => panic!("expected render, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn disconnected_token_upgrades_into_instance_with_session_state() {
    let endpoint = endpoint(Counter::default());
    let document = endpoint
        .render_disconnected("counter", Session::new().with("id", 7))
        .await
        .unwrap();
    assert_eq!(document.view, "counter");
    assert_eq!(
        document.rendered.as_str(),
        "id=7;count=0;connected=false;gated=false"
    );

    let (tx, mut rx) = mpsc::channel(16);
    let handle = endpoint.upgrade(&document.token, tx).await.unwrap();
    assert_eq!(handle.view_name(), "counter");
    assert_eq!(handle.phase(), Phase::Connected);

    let (rev, rendered) = expect_render(&mut rx).await;
    assert_eq!(rev, 0);
    assert_eq!(rendered, "id=7;count=0;connected=true;gated=false");
    handle.stop();
    assert_eq!(handle.terminated().await, StopReason::Shutdown);
}

#[test_timeout::tokio_timeout_test]
async fn token_from_another_secret_creates_no_instance() {
    let issuer = endpoint_with(Counter::default(), "someone else");
    let document = issuer
        .render_disconnected("counter", Session::new().with("id", 7))
        .await
        .unwrap();

    let view = Counter::default();
    let endpoint = endpoint(view.clone());
    let (tx, mut rx) = mpsc::channel(16);
    let err = endpoint.upgrade(&document.token, tx).await.unwrap_err();
    assert!(matches!(
        err,
        HandshakeError::Verification(VerificationError::SignatureMismatch)
    ));
    assert_eq!(err.metric_label(), "signature_mismatch");
    assert!(rx.recv().await.is_none());
    assert!(view.terminated.lock().unwrap().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn events_push_renders_in_arrival_order() {
    let endpoint = endpoint(Counter::default());
    let document = endpoint
        .render_disconnected("counter", Session::new().with("id", 1).with("count", 0))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let handle = endpoint.upgrade(&document.token, tx).await.unwrap();

    for _ in 0..3 {
        handle.push_event("inc", None, Value::Null).await.unwrap();
    }

    let mut pushes = Vec::new();
    for _ in 0..4 {
        pushes.push(expect_render(&mut rx).await);
    }
    assert_eq!(
        pushes,
        vec![
            (0, "id=1;count=0;connected=true;gated=false".to_string()),
            (1, "id=1;count=1;connected=true;gated=false".to_string()),
            (2, "id=1;count=2;connected=true;gated=false".to_string()),
            (3, "id=1;count=3;connected=true;gated=false".to_string()),
        ]
    );
    handle.stop();
    handle.terminated().await;
}

#[test_timeout::tokio_timeout_test]
async fn redirect_stops_instance_and_carries_flash() {
    let view = Counter::default();
    let endpoint = endpoint(view.clone());
    let document = endpoint
        .render_disconnected("counter", Session::new())
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let handle = endpoint.upgrade(&document.token, tx).await.unwrap();
    expect_render(&mut rx).await;

    handle.push_event("finish", None, Value::Null).await.unwrap();

    let reason = handle.terminated().await;
    match &reason {
        StopReason::Redirect { to, flash } => {
            assert_eq!(to, "/done");
            assert_eq!(flash.get("info"), Some("all done"));
        }
        other => panic!("unexpected stop reason {other:?}"),
    }
    assert_eq!(handle.phase(), Phase::Terminated);

    match rx.recv().await {
        Some(Outbound::Redirect { to, flash, instance_id }) => {
            assert_eq!(instance_id, handle.id());
            assert_eq!(to, "/done");
            assert_eq!(flash.get("info"), Some("all done"));
        }
        other => panic!("expected redirect, got {other:?}"),
    }
    assert!(rx.recv().await.is_none());
    assert_eq!(view.terminated.lock().unwrap().as_slice(), &[(reason, Some(0))]);
    assert!(handle.push_event("inc", None, Value::Null).await.is_err());
}

#[test_timeout::tokio_timeout_test]
async fn concurrent_instances_keep_separate_assigns() {
    let endpoint = endpoint(Counter::default());
    let doc_a = endpoint
        .render_disconnected("counter", Session::new().with("id", "a"))
        .await
        .unwrap();
    let doc_b = endpoint
        .render_disconnected("counter", Session::new().with("id", "b"))
        .await
        .unwrap();

    let (tx_a, mut rx_a) = mpsc::channel(64);
    let (tx_b, mut rx_b) = mpsc::channel(64);
    let a = endpoint.upgrade(&doc_a.token, tx_a).await.unwrap();
    let b = endpoint.upgrade(&doc_b.token, tx_b).await.unwrap();

    let drive_a = async {
        for _ in 0..5 {
            a.push_event("inc", None, Value::Null).await.unwrap();
        }
    };
    let drive_b = async {
        for _ in 0..2 {
            b.push_event("inc", None, Value::Null).await.unwrap();
        }
    };
    tokio::join!(drive_a, drive_b);

    let mut last_a = String::new();
    for _ in 0..6 {
        let (_, rendered) = expect_render(&mut rx_a).await;
        assert!(rendered.starts_with("id=\"a\""), "{rendered}");
        last_a = rendered;
    }
    let mut last_b = String::new();
    for _ in 0..3 {
        let (_, rendered) = expect_render(&mut rx_b).await;
        assert!(rendered.starts_with("id=\"b\""), "{rendered}");
        last_b = rendered;
    }
    assert!(last_a.contains("count=5"));
    assert!(last_b.contains("count=2"));
    assert_ne!(a.id(), b.id());

    a.stop();
    b.stop();
    a.terminated().await;
    b.terminated().await;
}

#[test_timeout::tokio_timeout_test]
async fn stop_waits_for_running_handler_and_skips_queued_events() {
    let view = Counter::default();
    let endpoint = endpoint(view.clone());
    let document = endpoint
        .render_disconnected("counter", Session::new())
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let handle = endpoint.upgrade(&document.token, tx).await.unwrap();
    expect_render(&mut rx).await;

    handle.push_event("gate", None, Value::Null).await.unwrap();
    view.entered.notified().await;
    handle.push_event("inc", None, Value::Null).await.unwrap();
    handle.push_event("inc", None, Value::Null).await.unwrap();
    handle.stop();
    view.release.notify_one();

    assert_eq!(handle.terminated().await, StopReason::Shutdown);
    let (rev, rendered) = expect_render(&mut rx).await;
    assert_eq!(rev, 1);
    assert_eq!(rendered, "id=null;count=0;connected=true;gated=true");
    match rx.recv().await {
        Some(Outbound::Disconnect { reason, .. }) => assert_eq!(reason, StopReason::Shutdown),
        other => panic!("expected disconnect, got {other:?}"),
    }
    assert_eq!(
        view.terminated.lock().unwrap().as_slice(),
        &[(StopReason::Shutdown, Some(0))]
    );
}

#[test_timeout::tokio_timeout_test]
async fn handler_fault_terminates_only_the_failing_instance() {
    let view = Counter::default();
    let endpoint = endpoint(view.clone());
    let document = endpoint
        .render_disconnected("counter", Session::new())
        .await
        .unwrap();

    let (tx_bad, mut rx_bad) = mpsc::channel(16);
    let (tx_good, mut rx_good) = mpsc::channel(16);
    let bad = endpoint.upgrade(&document.token, tx_bad).await.unwrap();
    let good = endpoint.upgrade(&document.token, tx_good).await.unwrap();
    expect_render(&mut rx_bad).await;
    expect_render(&mut rx_good).await;

    bad.push_event("boom", None, Value::Null).await.unwrap();
    assert_eq!(bad.terminated().await, StopReason::fault("boom"));
    match rx_bad.recv().await {
        Some(Outbound::Disconnect { reason, .. }) => assert_eq!(reason.metric_label(), "fault"),
        other => panic!("expected disconnect, got {other:?}"),
    }

    good.push_event("inc", None, Value::Null).await.unwrap();
    let (_, rendered) = expect_render(&mut rx_good).await;
    assert!(rendered.contains("count=1"));
    assert_eq!(good.phase(), Phase::Connected);

    good.stop();
    good.terminated().await;
}

#[test_timeout::tokio_timeout_test]
async fn panicking_handler_is_reported_as_fault() {
    let view = Counter::default();
    let endpoint = endpoint(view.clone());
    let document = endpoint
        .render_disconnected("counter", Session::new().with("count", 4))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let handle = endpoint.upgrade(&document.token, tx).await.unwrap();
    expect_render(&mut rx).await;

    handle.push_event("panic", None, Value::Null).await.unwrap();
    match handle.terminated().await {
        StopReason::Fault { message } => assert!(message.contains("handler exploded")),
        other => panic!("unexpected stop reason {other:?}"),
    }
    let log = view.terminated.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].1, Some(4));
}

#[test_timeout::tokio_timeout_test]
async fn update_of_missing_assign_faults_the_instance() {
    let endpoint = endpoint(Counter::default());
    let document = endpoint
        .render_disconnected("counter", Session::new())
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let handle = endpoint.upgrade(&document.token, tx).await.unwrap();
    expect_render(&mut rx).await;

    handle.push_event("missing", None, Value::Null).await.unwrap();
    match handle.terminated().await {
        StopReason::Fault { message } => assert!(message.contains("nope")),
        other => panic!("unexpected stop reason {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn normal_stop_and_info_messages() {
    let endpoint = endpoint(Counter::default());
    let document = endpoint
        .render_disconnected("counter", Session::new())
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let handle = endpoint.upgrade(&document.token, tx).await.unwrap();
    expect_render(&mut rx).await;

    handle.send_info(json!({"add": 5})).await.unwrap();
    let (_, rendered) = expect_render(&mut rx).await;
    assert!(rendered.contains("count=5"));

    handle
        .push_event("set", Some("input#count".into()), json!({"value": 42}))
        .await
        .unwrap();
    let (_, rendered) = expect_render(&mut rx).await;
    assert!(rendered.contains("count=42"));

    handle.push_event("halt", None, Value::Null).await.unwrap();
    assert_eq!(handle.terminated().await, StopReason::Normal);
}

#[test_timeout::tokio_timeout_test]
async fn initialization_failures_are_typed() {
    let endpoint = endpoint(Counter::default());

    let err = endpoint
        .render_disconnected("counter", Session::new().with("reject", true))
        .await
        .unwrap_err();
    assert!(matches!(err, HandshakeError::Initialization(_)));

    let document = endpoint
        .render_disconnected("counter", Session::new().with("reject_connected", true))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let err = endpoint.upgrade(&document.token, tx).await.unwrap_err();
    assert_eq!(err.metric_label(), "initialization");
    assert!(rx.recv().await.is_none());

    let err = endpoint
        .render_disconnected("missing", Session::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HandshakeError::UnknownView(name) if name == "missing"));
}

#[test_timeout::tokio_timeout_test]
async fn token_is_bound_to_the_view_it_was_issued_for() {
    let keys = keyring("shared-secret");
    let issuer_view = Counter::default();
    let issuer = LiveEndpoint::new(
        Arc::clone(&keys),
        Arc::new(ViewRegistry::new().register("a", issuer_view.clone())),
    );
    let document = issuer
        .render_disconnected("a", Session::new().with("id", 7))
        .await
        .unwrap();

    let other_view = Counter::default();
    let other = LiveEndpoint::new(
        keys,
        Arc::new(ViewRegistry::new().register("b", other_view.clone())),
    );
    let err = other.verify(&document.token).unwrap_err();
    assert!(matches!(&err, HandshakeError::UnknownView(name) if name == "a"));
    assert_eq!(err.metric_label(), "unknown_view");

    let (tx, mut rx) = mpsc::channel(16);
    let err = other.upgrade(&document.token, tx).await.unwrap_err();
    assert!(matches!(err, HandshakeError::UnknownView(name) if name == "a"));
    assert!(rx.recv().await.is_none());
    assert!(other_view.terminated.lock().unwrap().is_empty());
    assert!(issuer_view.terminated.lock().unwrap().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn reconnect_rederives_state_from_session() {
    let endpoint = endpoint(Counter::default());
    let document = endpoint
        .render_disconnected("counter", Session::new().with("count", 10))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let first = endpoint.upgrade(&document.token, tx).await.unwrap();
    expect_render(&mut rx).await;
    first.push_event("inc", None, Value::Null).await.unwrap();
    let (_, rendered) = expect_render(&mut rx).await;
    assert!(rendered.contains("count=11"));
    drop(rx);
    first.push_event("inc", None, Value::Null).await.unwrap();
    assert_eq!(first.terminated().await, StopReason::Closed);

    let (tx, mut rx) = mpsc::channel(16);
    let second = endpoint.upgrade(&document.token, tx).await.unwrap();
    assert_ne!(first.id(), second.id());
    let (rev, rendered) = expect_render(&mut rx).await;
    assert_eq!(rev, 0);
    assert!(rendered.contains("count=10"));
    second.stop();
    second.terminated().await;
}
