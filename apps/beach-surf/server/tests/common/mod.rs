use std::{sync::Arc, time::Duration};

use beach_surf_core::Keyring;
use beach_surf_server::{build_state, telemetry::detached_metrics_handle, AppState, ServerConfig};

pub fn keyring() -> Keyring {
    Keyring::single("k1", "integration-secret").unwrap()
}

pub fn test_state() -> Arc<AppState> {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        keyring: keyring(),
        shutdown_grace: Duration::ZERO,
        outbound_buffer: 16,
    };
    build_state(&config, detached_metrics_handle())
}

pub fn embedded_token(html: &str) -> Option<&str> {
    let start = html.find("data-surf-session=\"")? + "data-surf-session=\"".len();
    let len = html[start..].find('"')?;
    Some(&html[start..start + len])
}
