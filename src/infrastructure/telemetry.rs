//! Session metrics
//!
//! Recording goes through the `metrics` facade; the embedding application
//! decides whether a recorder is installed.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Describe every metric the session emits
pub fn describe_metrics() {
    describe_counter!(
        "pathcast_negotiations_total",
        "Total number of remote offers applied to the transport"
    );
    describe_histogram!(
        "pathcast_negotiation_duration_seconds",
        "Time spent applying one remote offer"
    );
    describe_counter!(
        "pathcast_stale_generations_total",
        "Remote offers dropped because a newer generation exists"
    );
    describe_counter!(
        "pathcast_reconnects_total",
        "Reconnect attempts scheduled, by scope"
    );
    describe_counter!(
        "pathcast_connection_state_changes_total",
        "Transport connection state changes"
    );
    describe_counter!(
        "pathcast_rpc_calls_total",
        "Control channel calls, by function and outcome"
    );
    describe_gauge!(
        "pathcast_active_medias",
        "Number of medias currently tracked by the session"
    );
}

/// Record an applied negotiation round
pub fn record_negotiation_applied(duration: Duration) {
    counter!("pathcast_negotiations_total").increment(1);
    histogram!("pathcast_negotiation_duration_seconds").record(duration.as_secs_f64());
}

/// Record a dropped stale generation
pub fn record_stale_generation() {
    counter!("pathcast_stale_generations_total").increment(1);
}

/// Record a scheduled reconnect; `scope` is `session` or `media`
pub fn record_reconnect_scheduled(scope: &'static str) {
    counter!("pathcast_reconnects_total", "scope" => scope).increment(1);
}

pub fn record_connection_state(state: &'static str) {
    counter!("pathcast_connection_state_changes_total", "state" => state).increment(1);
}

/// Record a completed control channel call
pub fn record_rpc(function: &str, outcome: &'static str) {
    counter!("pathcast_rpc_calls_total", "fn" => function.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn update_active_medias(count: usize) {
    gauge!("pathcast_active_medias").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        describe_metrics();
        record_negotiation_applied(Duration::from_millis(3));
        record_stale_generation();
        record_reconnect_scheduled("media");
        record_connection_state("connected");
        record_rpc("consume", "ok");
        update_active_medias(2);
    }
}
