//! Health Monitoring
//!
//! A running tunnel is probed on its own task; the monitor never mutates
//! tunnel state, it only reports into the controller's inbox. Each report
//! carries the generation of the tunnel it was taken for, so results that
//! arrive after the tunnel was replaced can be discarded.

use crate::relay::{Relay, RelayHandle};
use crate::routing::RoutingTable;
use crate::subnet::NetworkSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Detached liveness check for one tunnel
#[derive(Clone)]
pub struct HealthProbe {
    relay: Arc<dyn Relay>,
    routing: Arc<dyn RoutingTable>,
    handle: RelayHandle,
    settings: NetworkSettings,
}

impl HealthProbe {
    pub fn new(
        relay: Arc<dyn Relay>,
        routing: Arc<dyn RoutingTable>,
        handle: RelayHandle,
        settings: NetworkSettings,
    ) -> Self {
        Self {
            relay,
            routing,
            handle,
            settings,
        }
    }

    /// Relay alive and routes still present
    pub async fn run(&self) -> bool {
        self.relay.health_probe(&self.handle).await
            && self.routing.routes_present(&self.settings).await
    }
}

/// Result of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    /// Tunnel generation the probe ran against
    pub generation: u64,
    pub healthy: bool,
}

/// Periodic prober for the active tunnel
pub struct HealthMonitor {
    generation: u64,
    paused: watch::Sender<bool>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl HealthMonitor {
    /// Start probing every `interval`. The first probe runs one interval in.
    pub fn spawn(
        probe: HealthProbe,
        generation: u64,
        interval: Duration,
        paused: bool,
        reports: mpsc::Sender<HealthReport>,
    ) -> Self {
        let (paused_tx, paused_rx) = watch::channel(paused);
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(probe_loop(
            probe,
            generation,
            interval,
            paused_rx,
            wake.clone(),
            reports,
        ));

        Self {
            generation,
            paused: paused_tx,
            wake,
            task,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Suspend probing (OS sleep)
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Resume probing and run one probe right away (OS wake)
    pub fn resume(&self) {
        self.paused.send_replace(false);
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn probe_loop(
    probe: HealthProbe,
    generation: u64,
    interval: Duration,
    mut paused: watch::Receiver<bool>,
    wake: Arc<Notify>,
    reports: mpsc::Sender<HealthReport>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        let is_paused = *paused.borrow_and_update();
        if is_paused {
            if paused.changed().await.is_err() {
                return;
            }
            // Ticks missed while asleep are dropped; resume() notifies instead
            ticker.reset();
            continue;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            _ = wake.notified() => ticker.reset(),
            changed = paused.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
        }

        let healthy = probe.run().await;
        debug!("Health probe (generation {}): {}", generation, if healthy { "ok" } else { "failed" });

        if reports.send(HealthReport { generation, healthy }).await.is_err() {
            return;
        }
    }
}
