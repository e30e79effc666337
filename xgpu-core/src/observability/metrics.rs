//! Plugin metrics definitions.
//!
//! Names follow Prometheus conventions (`_total` for counters).

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register all plugin metrics with descriptions.
pub fn register_plugin_metrics() {
    describe_gauge!("xgpu_advertised_devices", "Devices advertised to the kubelet (by resource)");
    describe_counter!("xgpu_allocations_total", "Successful allocations (by resource)");
    describe_counter!(
        "xgpu_allocation_failures_total",
        "Rejected allocations (by resource, reason)"
    );
    describe_counter!(
        "xgpu_health_transitions_total",
        "Device health changes reported to the kubelet (by resource, health)"
    );
    describe_counter!(
        "xgpu_plugin_restarts_total",
        "Plugin server restarts after the kubelet dropped its socket (by resource)"
    );
    describe_counter!("xgpu_registrations_total", "Kubelet registrations (by resource, outcome)");
}

pub fn set_advertised_devices(resource: &str, count: usize) {
    gauge!("xgpu_advertised_devices", "resource" => resource.to_string()).set(count as f64);
}

pub fn record_allocation(resource: &str) {
    counter!("xgpu_allocations_total", "resource" => resource.to_string()).increment(1);
}

pub fn record_allocation_failure(resource: &str, reason: &str) {
    counter!(
        "xgpu_allocation_failures_total",
        "resource" => resource.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_health_transition(resource: &str, health: &str) {
    counter!(
        "xgpu_health_transitions_total",
        "resource" => resource.to_string(),
        "health" => health.to_string()
    )
    .increment(1);
}

pub fn record_restart(resource: &str) {
    counter!("xgpu_plugin_restarts_total", "resource" => resource.to_string()).increment(1);
}

pub fn record_registration(resource: &str, ok: bool) {
    let outcome = if ok { "ok" } else { "failed" };
    counter!(
        "xgpu_registrations_total",
        "resource" => resource.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
