use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::machine::Event;
use crate::engine::sync::SyncTrigger;
use crate::observability::metrics::Metrics;
use crate::session::DriverSession;
use crate::transport::events::InboundEvent;
use crate::transport::ConnectionState;

#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    pub tick: Duration,
    pub sync_interval: Duration,
    /// Quiet time after a reconnect before reconciling with the server.
    pub reconnect_settle: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            sync_interval: Duration::from_secs(20),
            reconnect_settle: Duration::from_secs(2),
        }
    }
}

pub struct RuntimeChannels {
    pub inbound: broadcast::Receiver<InboundEvent>,
    pub connection: watch::Receiver<ConnectionState>,
    pub replies: mpsc::UnboundedReceiver<Event>,
    pub shutdown: watch::Receiver<bool>,
}

/// Drives the session until shutdown. A stopped transport does not end the
/// loop; ticks keep expiring deadlines.
pub async fn run_driver_runtime(
    session: Arc<DriverSession>,
    channels: RuntimeChannels,
    settings: RuntimeSettings,
    metrics: Metrics,
) {
    let RuntimeChannels {
        mut inbound,
        mut connection,
        mut replies,
        mut shutdown,
    } = channels;

    let mut tick = time::interval(settings.tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut routine = time::interval_at(Instant::now() + settings.sync_interval, settings.sync_interval);
    routine.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut reconcile_at: Option<Instant> = None;
    let mut inbound_open = true;
    let mut connection_open = true;

    let initial = connection.borrow_and_update().clone();
    session.connection_changed(initial).await;
    info!(driver_id = %session.driver_id(), "driver runtime started");

    loop {
        let settle = async move {
            match reconcile_at {
                Some(at) => time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            received = inbound.recv(), if inbound_open => match received {
                Ok(event) => session.dispatch(Event::Inbound(event)).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "inbound events dropped; forcing a sync");
                    if let Err(err) = session.sync(SyncTrigger::Forced).await {
                        warn!(error = %err, "forced sync after lag failed");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!("inbound event stream closed");
                    inbound_open = false;
                }
            },
            changed = connection.changed(), if connection_open => {
                if changed.is_err() {
                    let last = connection.borrow().clone();
                    warn!(state = ?last, "transport stopped; session keeps running offline from the server");
                    connection_open = false;
                    session.connection_changed(last).await;
                    continue;
                }
                let state = connection.borrow_and_update().clone();
                if let ConnectionState::Connected { reconnected: true } = state {
                    metrics.reconnects_total.inc();
                    reconcile_at = Some(Instant::now() + settings.reconnect_settle);
                    debug!(settle_ms = settings.reconnect_settle.as_millis() as u64, "reconnected; reconciling after settle delay");
                }
                session.connection_changed(state).await;
            }
            Some(event) = replies.recv() => session.dispatch(event).await,
            _ = settle => {
                reconcile_at = None;
                if let Err(err) = session.sync(SyncTrigger::Reconnect).await {
                    warn!(error = %err, "reconnect sync failed");
                }
            }
            _ = tick.tick() => session.tick().await,
            _ = routine.tick() => {
                if let Err(err) = session.sync(SyncTrigger::Routine).await {
                    warn!(error = %err, "routine sync failed");
                }
            }
            _ = shutdown.changed() => {
                info!(driver_id = %session.driver_id(), "driver runtime stopping");
                break;
            }
        }
    }
}
