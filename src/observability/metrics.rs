use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub transitions_total: IntCounterVec,
    pub outbound_events_total: IntCounterVec,
    pub sync_calls_total: IntCounterVec,
    pub sync_latency_seconds: HistogramVec,
    pub reconciliations_total: IntCounterVec,
    pub reconnects_total: IntCounter,
    pub driver_online: IntGauge,
    pub queue_position: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let transitions_total = IntCounterVec::new(
            Opts::new("transitions_total", "Driver and ride state transitions by event"),
            &["event"],
        )
        .expect("valid transitions_total metric");

        let outbound_events_total = IntCounterVec::new(
            Opts::new("outbound_events_total", "Events sent to the dispatch server"),
            &["event"],
        )
        .expect("valid outbound_events_total metric");

        let sync_calls_total = IntCounterVec::new(
            Opts::new("sync_calls_total", "State sync attempts by outcome"),
            &["outcome"],
        )
        .expect("valid sync_calls_total metric");

        let sync_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "sync_latency_seconds",
                "Latency of state sync calls in seconds, retries included",
            ),
            &["outcome"],
        )
        .expect("valid sync_latency_seconds metric");

        let reconciliations_total = IntCounterVec::new(
            Opts::new("reconciliations_total", "Ride reconciliations by outcome"),
            &["outcome"],
        )
        .expect("valid reconciliations_total metric");

        let reconnects_total = IntCounter::new("reconnects_total", "Socket reconnects")
            .expect("valid reconnects_total metric");

        let driver_online = IntGauge::new("driver_online", "1 while the driver is online")
            .expect("valid driver_online metric");

        let queue_position = IntGauge::new(
            "queue_position",
            "Current queue position at the pickup point, 0 when not queued",
        )
        .expect("valid queue_position metric");

        registry
            .register(Box::new(transitions_total.clone()))
            .expect("register transitions_total");
        registry
            .register(Box::new(outbound_events_total.clone()))
            .expect("register outbound_events_total");
        registry
            .register(Box::new(sync_calls_total.clone()))
            .expect("register sync_calls_total");
        registry
            .register(Box::new(sync_latency_seconds.clone()))
            .expect("register sync_latency_seconds");
        registry
            .register(Box::new(reconciliations_total.clone()))
            .expect("register reconciliations_total");
        registry
            .register(Box::new(reconnects_total.clone()))
            .expect("register reconnects_total");
        registry
            .register(Box::new(driver_online.clone()))
            .expect("register driver_online");
        registry
            .register(Box::new(queue_position.clone()))
            .expect("register queue_position");

        Self {
            registry,
            transitions_total,
            outbound_events_total,
            sync_calls_total,
            sync_latency_seconds,
            reconciliations_total,
            reconnects_total,
            driver_online,
            queue_position,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Metrics;

    #[test]
    fn encodes_registered_families() {
        let metrics = Metrics::new();
        metrics.transitions_total.with_label_values(&["go_online_requested"]).inc();
        metrics.queue_position.set(3);

        let body = metrics.encode().unwrap();
        assert!(body.contains("transitions_total{event=\"go_online_requested\"} 1"));
        assert!(body.contains("queue_position 3"));
    }
}
