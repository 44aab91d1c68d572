//! # Background Tasks
//!
//! Tokio loops around the registry: the periodic sweep and verification
//! step, and the drain of scheduled recovery connections. Both stop when
//! the shutdown flag flips to `true`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::{GossipMessage, OutboundAction};
use crate::ports::{PeerConnector, PeerNetwork};
use crate::service::{execute_actions, PopnodeRegistry};

/// Opens the connections recovery asked for, one at a time.
pub struct ConnectionDrain<C: PeerConnector> {
    registry: Arc<PopnodeRegistry>,
    connector: Arc<C>,
}

impl<C: PeerConnector> ConnectionDrain<C> {
    pub fn new(registry: Arc<PopnodeRegistry>, connector: Arc<C>) -> Self {
        Self {
            registry,
            connector,
        }
    }

    /// Pop one scheduled connection and request its announcements.
    ///
    /// Returns false when nothing was scheduled.
    pub async fn drain_once(&self) -> bool {
        let Some((addr, hashes)) = self.registry.pop_scheduled_connection() else {
            return false;
        };
        let count = hashes.len();
        match self
            .connector
            .request_announcements(addr, hashes.into_iter().collect())
            .await
        {
            Ok(()) => debug!("[popnode] asked {} for {} announcements", addr, count),
            Err(e) => warn!("[popnode] recovery connection to {} failed: {}", addr, e),
        }
        true
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.registry.config().connection_drain_interval_secs.max(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    while self.drain_once().await {}
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("[popnode] connection drain stopped");
    }
}

/// Periodic sweep plus, for an active popnode, the verification step.
pub struct MaintenanceTask {
    registry: Arc<PopnodeRegistry>,
    network: Arc<dyn PeerNetwork>,
}

impl MaintenanceTask {
    pub fn new(registry: Arc<PopnodeRegistry>, network: Arc<dyn PeerNetwork>) -> Self {
        Self { registry, network }
    }

    pub fn sweep(&self) {
        let actions = self.registry.check_and_remove();
        execute_actions(self.network.as_ref(), actions);
    }

    /// Send this step's challenges and mark each one dispatched.
    pub fn verify(&self) {
        let actions = self.registry.do_full_verification_step();
        let targets: Vec<_> = actions
            .iter()
            .filter_map(|action| match action {
                OutboundAction::Send {
                    peer,
                    message: GossipMessage::VerifyRequest(_),
                } => Some(*peer),
                _ => None,
            })
            .collect();
        execute_actions(self.network.as_ref(), actions);
        for peer in targets {
            self.registry.confirm_verify_dispatch(&peer);
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let config = self.registry.config();
        let mut sweep = interval(Duration::from_secs(config.sweep_interval_secs.max(1)));
        let mut verification =
            interval(Duration::from_secs(config.verification_interval_secs.max(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        verification.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = sweep.tick() => self.sweep(),
                _ = verification.tick() => {
                    if self.registry.local_popnode().is_some() {
                        self.verify();
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("[popnode] maintenance task stopped");
    }
}
