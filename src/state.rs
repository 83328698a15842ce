use std::sync::Arc;

use tokio::sync::watch;

use crate::observability::metrics::Metrics;
use crate::session::DriverSession;

pub struct AppState {
    pub session: Arc<DriverSession>,
    pub metrics: Metrics,
    /// Flipped to `true` on logout or process shutdown.
    pub shutdown: watch::Sender<bool>,
}

impl AppState {
    pub fn new(session: Arc<DriverSession>, metrics: Metrics) -> (Self, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);

        (
            Self {
                session,
                metrics,
                shutdown,
            },
            shutdown_rx,
        )
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
