use std::sync::atomic::{AtomicUsize, Ordering};

use beach_surf_core::{Flash, LiveEndpoint};
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::debug;

use crate::protocol;

pub struct AppState {
    endpoint: LiveEndpoint,
    metrics: PrometheusHandle,
    outbound_buffer: usize,
    active_instances: AtomicUsize,
}

impl AppState {
    pub fn new(endpoint: LiveEndpoint, metrics: PrometheusHandle, outbound_buffer: usize) -> Self {
        Self {
            endpoint,
            metrics,
            outbound_buffer: outbound_buffer.max(1),
            active_instances: AtomicUsize::new(0),
        }
    }

    pub fn endpoint(&self) -> &LiveEndpoint {
        &self.endpoint
    }

    pub fn outbound_buffer(&self) -> usize {
        self.outbound_buffer
    }

    pub fn active_instances(&self) -> usize {
        self.active_instances.load(Ordering::Relaxed)
    }

    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }

    /// Flash carried over from a redirect. Anything that fails verification
    /// is dropped rather than shown.
    pub fn verify_flash(&self, token: &str) -> Flash {
        protocol::verify_flash(token, self.endpoint.keyring()).unwrap_or_else(|err| {
            debug!(error = %err, "ignoring unverifiable flash");
            Flash::default()
        })
    }

    pub(crate) fn instance_started(&self) {
        let active = self.active_instances.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("beach_surf_instances_active", active as f64);
    }

    pub(crate) fn instance_finished(&self) {
        let active = self
            .active_instances
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        gauge!("beach_surf_instances_active", active as f64);
    }
}
